//! End-to-end scenarios: a whole region supervisor driven against the
//! in-memory keyspace, shard tracker, and cluster environment.

use std::collections::BTreeSet;
use std::sync::Arc;

use ballast::collection::{
    CollectionEnv, CollectionKnobs, CollectionStats, CollectionSupervisor,
    PriorityBoard, StorageConfig, StorageMigrationType, TeamCollection,
};
use ballast::external::memory::{MemoryCluster, MemoryKeyspace, MemoryShardTracker};
use ballast::external::{
    ExclusionKey, ExclusionLists, KeyRange, ProcessClass, RelocateShard,
    ServerListEntry, ShardAssignment, StorageInterface, StoreType, SystemKeyspace,
};
use ballast::model::{
    Locality, ProcessId, Region, ServerId, TeamPriority, LOC_DCID, LOC_PROCESSID,
    LOC_ZONEID,
};
use ballast::policy::PolicyAcross;
use ballast::BallastError;

use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    keyspace: Arc<MemoryKeyspace>,
    cluster: Arc<MemoryCluster>,
    tracker: Arc<MemoryShardTracker>,
    board: Arc<PriorityBoard>,
    relocations: mpsc::UnboundedReceiver<RelocateShard>,
    relocations_tx: Option<mpsc::UnboundedSender<RelocateShard>>,
    _unhealthy_tx: watch::Sender<usize>,
    unhealthy_rx: watch::Receiver<usize>,
}

impl Harness {
    fn new() -> Self {
        let keyspace = Arc::new(MemoryKeyspace::new());
        let cluster = Arc::new(MemoryCluster::new(keyspace.clone()));
        let tracker = Arc::new(MemoryShardTracker::new());
        let (relocations_tx, relocations) = mpsc::unbounded_channel();
        let (unhealthy_tx, unhealthy_rx) = watch::channel(0);
        Harness {
            keyspace,
            cluster,
            tracker,
            board: Arc::new(PriorityBoard::new()),
            relocations,
            relocations_tx: Some(relocations_tx),
            _unhealthy_tx: unhealthy_tx,
            unhealthy_rx,
        }
    }

    fn env(&self) -> CollectionEnv {
        CollectionEnv {
            keyspace: self.keyspace.clone(),
            shards: self.tracker.clone(),
            controller: self.cluster.clone(),
            workers: self.cluster.clone(),
            storage: self.cluster.clone(),
            failures: self.cluster.clone(),
        }
    }

    async fn spawn_region(
        &mut self,
        region: Region,
        cfg: StorageConfig,
    ) -> Result<RunningRegion, BallastError> {
        let supervisor = CollectionSupervisor::new_and_setup(
            region,
            cfg,
            test_knobs(),
            self.env(),
            self.relocations_tx.take().expect("one region per harness sender"),
            self.unhealthy_rx.clone(),
            self.board.clone(),
        )
        .await?;
        let stats = supervisor.stats();
        let zero_healthy = supervisor.zero_healthy_teams();
        let (term_tx, term_rx) = watch::channel(false);
        let handle = tokio::spawn(supervisor.run(term_rx));
        Ok(RunningRegion {
            stats,
            zero_healthy,
            term_tx,
            handle,
        })
    }
}

struct RunningRegion {
    stats: watch::Receiver<CollectionStats>,
    zero_healthy: watch::Receiver<bool>,
    term_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<Result<TeamCollection, BallastError>>,
}

impl RunningRegion {
    async fn wait_stats(
        &mut self,
        what: &str,
        pred: impl Fn(&CollectionStats) -> bool,
    ) {
        let waited = timeout(WAIT, async {
            loop {
                if pred(&self.stats.borrow()) {
                    return;
                }
                if self.stats.changed().await.is_err() {
                    panic!("stats channel closed waiting for {}", what);
                }
            }
        })
        .await;
        if waited.is_err() {
            panic!(
                "timed out waiting for {}; last stats {:?}",
                what,
                self.stats.borrow().clone()
            );
        }
    }

    async fn stop(self) -> Result<TeamCollection, BallastError> {
        let _ = self.term_tx.send(true);
        self.handle.await.map_err(BallastError::from)?
    }
}

fn test_knobs() -> CollectionKnobs {
    CollectionKnobs {
        initial_reaction_ms: 50,
        failure_reaction_ms: 50,
        drain_poll_ms: 25,
        health_check_ms: 50,
        server_list_poll_ms: 100,
        metrics_poll_ms: 10_000,
        testing_check_ms: 10_000,
        remove_machine_team_ms: 60_000,
        remove_server_team_ms: 60_000,
        wiggle_interval_ms: 50,
        removal_version_margin: 100_000,
        zero_left_log_delay_ms: 1_000,
        rng_seed: Some(99),
        ..CollectionKnobs::default()
    }
}

fn config(team_size: usize) -> StorageConfig {
    StorageConfig {
        team_size,
        policy: Arc::new(PolicyAcross::across_zones(team_size)),
        usable_regions: 1,
        migration: StorageMigrationType::Gradual,
        store_type: StoreType::SsdBTree,
        testing_store_type: StoreType::SsdBTree,
        desired_testing_servers: 0,
        included_dcs: Vec::new(),
        remote_dcs: Vec::new(),
    }
}

fn interface(n: u64, dc: &str, zone: &str) -> StorageInterface {
    StorageInterface {
        id: ServerId::from(n),
        address: format!("10.{}.{}.1:4500", n / 200, n % 200).parse().unwrap(),
        secondary_address: None,
        locality: Locality::new()
            .with(LOC_DCID, dc)
            .with(LOC_ZONEID, zone)
            .with(LOC_PROCESSID, &format!("p{:03}", n)),
        pair_of: None,
    }
}

fn register(keyspace: &MemoryKeyspace, n: u64, dc: &str, zone: &str) {
    keyspace
        .register_server(&ServerListEntry {
            interface: interface(n, dc, zone),
            class: ProcessClass::Storage,
            added_version: 1,
        })
        .unwrap();
}

async fn expect_relocation(
    relocations: &mut mpsc::UnboundedReceiver<RelocateShard>,
    priority: TeamPriority,
) -> RelocateShard {
    timeout(WAIT, async {
        loop {
            match relocations.recv().await {
                Some(r) if r.priority == priority => return r,
                Some(_) => continue,
                None => panic!("relocation channel closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no relocation at priority {} arrived", priority))
}

/// Scenario: build from scratch at replication three over sixty processes
/// spread across twelve zones.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn build_from_scratch() -> Result<(), BallastError> {
    let mut harness = Harness::new();
    for n in 1..=60 {
        register(&harness.keyspace, n, "dc0", &format!("z{}", n % 12));
    }

    let mut region = harness.spawn_region(Region::Primary, config(3)).await?;
    region
        .wait_stats("teams built to target", |s| {
            s.teams >= 300 && s.healthy_teams == s.teams
        })
        .await;

    let tc = region.stop().await?;
    assert!(tc.team_count() <= 600);
    tc.sanity_check()?;

    for team in tc.teams() {
        let zones: BTreeSet<_> = team
            .servers
            .iter()
            .map(|sid| {
                tc.server(*sid)
                    .unwrap()
                    .interface
                    .locality
                    .zone_id()
                    .unwrap()
            })
            .collect();
        assert_eq!(zones.len(), 3);
    }
    for id in tc.server_ids() {
        assert!(!tc.server(id).unwrap().teams.is_empty());
    }
    Ok(())
}

/// Scenario: one member of one team fails; its team degrades, one
/// relocation per owned shard goes out, and the healthy count drops by one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fail_one_server_of_one_team() -> Result<(), BallastError> {
    let mut harness = Harness::new();
    // two disjoint teams over six zones
    for n in 1..=6 {
        register(&harness.keyspace, n, "dc0", &format!("z{}", n));
    }
    let team_a: Vec<ServerId> = vec![1, 2, 3].into_iter().map(ServerId::from).collect();
    let team_b: Vec<ServerId> = vec![4, 5, 6].into_iter().map(ServerId::from).collect();
    harness.keyspace.set_shards(vec![
        ShardAssignment {
            range: KeyRange::new("", "m"),
            src: team_a.clone(),
            dest: vec![],
        },
        ShardAssignment {
            range: KeyRange::new("m", "z"),
            src: team_b.clone(),
            dest: vec![],
        },
    ]);
    harness.tracker.assign(&KeyRange::new("", "m"), &team_a, &[], 1 << 20);
    harness.tracker.assign(&KeyRange::new("m", "z"), &team_b, &[], 1 << 20);

    let mut region = harness.spawn_region(Region::Primary, config(3)).await?;
    region
        .wait_stats("all teams healthy", |s| {
            s.teams >= 2 && s.healthy_teams == s.teams
        })
        .await;
    let healthy_before = region.stats.borrow().healthy_teams;

    // server 1 goes dark
    let addr = interface(1, "dc0", "z1").address;
    harness.cluster.set_failed(addr, true);

    let relocation =
        expect_relocation(&mut harness.relocations, TeamPriority::TwoLeft).await;
    assert_eq!(relocation.keys, KeyRange::new("", "m"));

    region
        .wait_stats("healthy count dropped", move |s| {
            s.healthy_teams < healthy_before
        })
        .await;

    let tc = region.stop().await?;
    assert!(tc.status(ServerId::from(1)).is_failed);

    // exactly the teams containing the failed server degraded, each to the
    // two-remaining level
    let mut with_failed = 0;
    for team in tc.teams() {
        if team.servers.contains(&ServerId::from(1)) {
            with_failed += 1;
            assert!(!team.healthy);
            assert_eq!(team.priority, TeamPriority::TwoLeft);
        } else {
            assert!(team.healthy);
        }
    }
    assert!(with_failed >= 1);
    assert_eq!(tc.healthy_team_count(), tc.team_count() - with_failed);
    tc.sanity_check()?;
    Ok(())
}

/// Scenario: an address is excluded as failed; its servers fail at once,
/// relocations go out at the failed priority, and after the shards drain
/// the server is removed from the server list.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_exclusion_drains_and_removes() -> Result<(), BallastError> {
    let mut harness = Harness::new();
    for n in 1..=6 {
        register(&harness.keyspace, n, "dc0", &format!("z{}", n));
    }
    let team: Vec<ServerId> = vec![1, 2, 3].into_iter().map(ServerId::from).collect();
    harness.keyspace.set_shards(vec![ShardAssignment {
        range: KeyRange::new("", "z"),
        src: team.clone(),
        dest: vec![],
    }]);
    harness.tracker.assign(&KeyRange::new("", "z"), &team, &[], 1 << 20);

    let mut region = harness.spawn_region(Region::Primary, config(3)).await?;
    region
        .wait_stats("teams settled", |s| s.teams >= 1 && s.healthy_teams == s.teams)
        .await;

    let addr = interface(1, "dc0", "z1").address;
    harness.keyspace.set_exclusions(ExclusionLists {
        failed_addresses: vec![ExclusionKey::from(addr)],
        ..Default::default()
    });

    let relocation =
        expect_relocation(&mut harness.relocations, TeamPriority::Failed).await;
    assert!(relocation.keys.overlaps(&KeyRange::new("", "z")));

    // shards drain off the failed server; removal preconditions open up
    harness.tracker.remove_server(ServerId::from(1));
    harness.keyspace.advance_version(1_000_000);

    timeout(WAIT, async {
        loop {
            let list = harness.keyspace.read_server_list().await.unwrap();
            if !list.iter().any(|e| e.interface.id == ServerId::from(1)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("failed server was never removed from the server list");

    let tc = region.stop().await?;
    assert!(tc.server(ServerId::from(1)).is_none());
    tc.sanity_check()?;
    Ok(())
}

/// Scenario: the perpetual wiggle rotates one process: its teams degrade to
/// the wiggle priority, the process drains and is removed, and the
/// persisted pid advances to the next in sorted order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wiggle_walks_processes_in_order() -> Result<(), BallastError> {
    let mut harness = Harness::new();
    for n in 1..=6 {
        register(&harness.keyspace, n, "dc0", &format!("z{}", n));
    }
    let team: Vec<ServerId> = vec![1, 2, 3].into_iter().map(ServerId::from).collect();
    harness.tracker.assign(&KeyRange::new("", "m"), &team, &[], 1 << 20);
    harness.keyspace.set_shards(vec![ShardAssignment {
        range: KeyRange::new("", "m"),
        src: team.clone(),
        dest: vec![],
    }]);

    let mut region = harness.spawn_region(Region::Primary, config(3)).await?;
    region
        .wait_stats("teams built", |s| s.teams >= 10 && s.healthy_teams == s.teams)
        .await;

    harness.keyspace.set_wiggle_switch(true);

    // the first process in sorted pid order starts wiggling
    let relocation =
        expect_relocation(&mut harness.relocations, TeamPriority::Wiggle).await;
    assert!(relocation.keys.overlaps(&KeyRange::new("", "m")));

    // its shards drain and the server goes away
    harness.tracker.remove_server(ServerId::from(1));
    harness.keyspace.advance_version(1_000_000);

    region
        .wait_stats("wiggled server removed", |s| s.servers == 5)
        .await;

    // the pid advances to the successor
    timeout(WAIT, async {
        loop {
            let pid = harness
                .keyspace
                .read_wiggling_pid(Region::Primary)
                .await
                .unwrap();
            if pid == Some(ProcessId::from("p002")) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("wiggle never advanced to the next process");

    let tc = region.stop().await?;
    tc.sanity_check()?;
    Ok(())
}

/// Scenario: replication factor grows from three to four; the teams read
/// back at bootstrap are the wrong size, so they are filed as bad and
/// replaced by freshly built four-member teams.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replication_factor_change_rebuilds_teams() -> Result<(), BallastError> {
    let mut harness = Harness::new();
    for n in 1..=8 {
        register(&harness.keyspace, n, "dc0", &format!("z{}", n % 4));
    }
    // teams from the previous configuration have only three members
    harness.keyspace.set_shards(vec![ShardAssignment {
        range: KeyRange::new("", "z"),
        src: vec![1, 3, 6].into_iter().map(ServerId::from).collect(),
        dest: vec![],
    }]);

    let mut region = harness.spawn_region(Region::Primary, config(4)).await?;
    region
        .wait_stats("four-member teams built", |s| {
            s.teams >= 1 && s.healthy_teams == s.teams
        })
        .await;

    let tc = region.stop().await?;
    for team in tc.teams() {
        assert_eq!(team.size(), 4);
    }
    tc.sanity_check()?;
    Ok(())
}

/// Scenario: two regions run independently; losing every server of the
/// remote region zeroes its healthy teams without touching the primary.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_regions_fail_independently() -> Result<(), BallastError> {
    let mut primary_harness = Harness::new();
    let keyspace = primary_harness.keyspace.clone();
    for n in 1..=6 {
        register(&keyspace, n, "dc0", &format!("z{}", n));
    }
    for n in 101..=106 {
        register(&keyspace, n, "dc1", &format!("r{}", n));
    }

    // the remote region shares keyspace, cluster, tracker, and the board
    let mut remote_harness = Harness::new();
    remote_harness.keyspace = primary_harness.keyspace.clone();
    remote_harness.cluster = primary_harness.cluster.clone();
    remote_harness.tracker = primary_harness.tracker.clone();
    remote_harness.board = primary_harness.board.clone();

    let mut primary_cfg = config(3);
    primary_cfg.usable_regions = 2;
    primary_cfg.included_dcs = vec!["dc0".to_string()];
    primary_cfg.remote_dcs = vec!["dc1".to_string()];
    let mut remote_cfg = primary_cfg.clone();
    remote_cfg.included_dcs = vec!["dc1".to_string()];

    let mut primary = primary_harness
        .spawn_region(Region::Primary, primary_cfg)
        .await?;
    let mut remote = remote_harness
        .spawn_region(Region::Remote, remote_cfg)
        .await?;

    primary
        .wait_stats("primary healthy", |s| s.teams >= 1 && s.healthy_teams == s.teams)
        .await;
    remote
        .wait_stats("remote healthy", |s| s.teams >= 1 && s.healthy_teams == s.teams)
        .await;

    // the whole remote datacenter goes dark
    for n in 101..=106 {
        let addr = interface(n, "dc1", &format!("r{}", n)).address;
        primary_harness.cluster.set_failed(addr, true);
    }

    timeout(WAIT, async {
        loop {
            if *remote.zero_healthy.borrow() {
                return;
            }
            if remote.zero_healthy.changed().await.is_err() {
                panic!("remote zero-healthy channel closed");
            }
        }
    })
    .await
    .expect("remote region never saw zero healthy teams");

    // the primary is untouched
    assert!(!*primary.zero_healthy.borrow());
    let stats = primary.stats.borrow().clone();
    assert_eq!(stats.healthy_teams, stats.teams);

    primary.stop().await?.sanity_check()?;
    remote.stop().await?.sanity_check()?;
    Ok(())
}

/// Recruitment end to end: an under-provisioned cluster recruits offered
/// workers until teams can be built.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recruits_workers_to_build_teams() -> Result<(), BallastError> {
    let mut harness = Harness::new();
    // only two servers registered: no team possible yet
    register(&harness.keyspace, 1, "dc0", "z1");
    register(&harness.keyspace, 2, "dc0", "z2");

    let mut region = harness.spawn_region(Region::Primary, config(3)).await?;
    region.wait_stats("bootstrap seen", |s| s.servers == 2).await;
    assert!(*region.zero_healthy.borrow());

    // a worker in a third zone shows up
    harness.cluster.offer_worker(ballast::external::WorkerDescriptor {
        address: "10.9.0.1:4500".parse()?,
        locality: Locality::new()
            .with(LOC_DCID, "dc0")
            .with(LOC_ZONEID, "z3")
            .with(LOC_PROCESSID, "p900"),
        class: ProcessClass::Storage,
    });

    region
        .wait_stats("team built from recruited server", |s| {
            s.servers == 3 && s.healthy_teams >= 1
        })
        .await;

    let tc = region.stop().await?;
    assert_eq!(tc.team_count(), tc.healthy_team_count());
    tc.sanity_check()?;
    Ok(())
}

//! The data-distribution team collection: one instance per replication
//! region, owning the membership registry, team builder, trackers,
//! recruiter, exclusion/wiggle control, and team removers. All state lives
//! in `TeamCollection`; the `CollectionSupervisor` drives every component
//! from a single event loop so that builds, removals, and tracker updates
//! never observe each other's intermediate state.

mod bootstrap;
mod builder;
mod exclusion;
mod recruiter;
mod registry;
mod remover;
mod server_tracker;
mod team_tracker;

pub use bootstrap::{load_initial_state, InitialClusterState};
pub use registry::{MachineInfo, MachineTeamInfo, RemovalOutcome, ServerInfo, TeamInfo};
pub use remover::StorageMigrationType;
pub use team_tracker::PriorityBoard;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::external::{
    ClusterController, ExclusionKey, FailureMonitor, HealthyZone, RecruitStorageReply,
    RelocateShard, ServerListEntry, ShardTracker, StorageClient, StorageMetrics,
    StoreType, SystemKeyspace, WorkerClient,
};
use crate::model::{
    ExclusionStatus, MachineId, MachineTeamId, ProcessId, Region, ServerId,
    ServerStatus, TeamId,
};
use crate::policy::ReplicationPolicy;
use crate::utils::{BallastError, RestTimer};

use rand::rngs::StdRng;
use rand::SeedableRng;

use recruiter::{AddedServer, PairRendezvous, RecruiterState};
use server_tracker::WatchdogTimings;
use exclusion::WiggleState;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};

/// Replication-facing configuration of one region's collection.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Replication factor: the exact size of every server team.
    pub team_size: usize,

    /// Placement policy teams must satisfy.
    pub policy: Arc<dyn ReplicationPolicy>,

    /// 1 for a single region, 2 when a remote region exists.
    pub usable_regions: usize,

    pub migration: StorageMigrationType,
    pub store_type: StoreType,
    pub testing_store_type: StoreType,

    /// Target testing-server population across all regions.
    pub desired_testing_servers: usize,

    /// Datacenters this region is responsible for; empty means all.
    pub included_dcs: Vec<String>,

    /// Datacenters of the sibling region, for bootstrap classification.
    pub remote_dcs: Vec<String>,
}

/// Tunables, overridable from a TOML snippet. Unknown keys are rejected,
/// and combinations the collection cannot run with fail validation.
#[derive(Debug, PartialEq, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectionKnobs {
    pub desired_teams_per_server: usize,
    pub max_teams_per_server: usize,
    pub best_of_attempts: usize,
    pub overlap_penalty: usize,

    pub version_lag_to_fail: i64,
    pub version_lag_to_clear: i64,

    pub initial_reaction_ms: u64,
    pub failure_reaction_ms: u64,
    pub metrics_poll_ms: u64,
    pub metrics_jitter_ms: u64,
    pub drain_poll_ms: u64,
    pub removal_version_margin: i64,

    pub recruit_retry_ms: u64,
    pub pair_timeout_ms: u64,
    pub testing_check_ms: u64,

    pub remove_machine_team_ms: u64,
    pub remove_server_team_ms: u64,

    pub wiggle_interval_ms: u64,
    pub wiggle_pause_threshold: usize,
    pub wiggle_stuck_threshold: u64,

    pub health_check_ms: u64,
    pub server_list_poll_ms: u64,
    pub store_type_sweep_ms: u64,
    pub zero_left_log_delay_ms: u64,
    pub key_servers_page_limit: usize,

    /// Fixed seed for reproducible builder tie-breaks; random otherwise.
    pub rng_seed: Option<u64>,
}

impl Default for CollectionKnobs {
    fn default() -> Self {
        CollectionKnobs {
            desired_teams_per_server: 5,
            max_teams_per_server: 10,
            best_of_attempts: 4,
            overlap_penalty: 10_000,
            version_lag_to_fail: 250_000_000,
            version_lag_to_clear: 200_000_000,
            initial_reaction_ms: 10_000,
            failure_reaction_ms: 60_000,
            metrics_poll_ms: 2_000,
            metrics_jitter_ms: 500,
            drain_poll_ms: 5_000,
            removal_version_margin: 5_000_000,
            recruit_retry_ms: 500,
            pair_timeout_ms: 30_000,
            testing_check_ms: 60_000,
            remove_machine_team_ms: 60_000,
            remove_server_team_ms: 60_000,
            wiggle_interval_ms: 50_000,
            wiggle_pause_threshold: 10,
            wiggle_stuck_threshold: 50,
            health_check_ms: 5_000,
            server_list_poll_ms: 15_000,
            store_type_sweep_ms: 60_000,
            zero_left_log_delay_ms: 120_000,
            key_servers_page_limit: 1_000,
            rng_seed: None,
        }
    }
}

impl CollectionKnobs {
    /// Parses knob overrides from an optional TOML string; fields left out
    /// keep their defaults, unknown fields are an error.
    pub fn from_toml(knobs_str: Option<&str>) -> Result<Self, BallastError> {
        let knobs: CollectionKnobs = match knobs_str {
            Some(s) => toml::from_str(s)?,
            None => CollectionKnobs::default(),
        };
        knobs.validate()?;
        Ok(knobs)
    }

    /// Rejects knob combinations the collection cannot run with: the builder
    /// needs a sane team-count band and at least one candidate attempt, the
    /// lag hysteresis must open downward, and every periodic task needs a
    /// nonzero period.
    pub fn validate(&self) -> Result<(), BallastError> {
        if self.desired_teams_per_server == 0 {
            return Err(BallastError::msg("desired_teams_per_server must be positive"));
        }
        if self.max_teams_per_server < self.desired_teams_per_server {
            return Err(BallastError::msg(format!(
                "max_teams_per_server {} below desired_teams_per_server {}",
                self.max_teams_per_server, self.desired_teams_per_server,
            )));
        }
        if self.best_of_attempts == 0 {
            return Err(BallastError::msg("best_of_attempts must be positive"));
        }
        if self.version_lag_to_clear >= self.version_lag_to_fail {
            return Err(BallastError::msg(format!(
                "version_lag_to_clear {} must sit below version_lag_to_fail {}",
                self.version_lag_to_clear, self.version_lag_to_fail,
            )));
        }
        if self.key_servers_page_limit == 0 {
            return Err(BallastError::msg("key_servers_page_limit must be positive"));
        }
        for (name, ms) in [
            ("metrics_poll_ms", self.metrics_poll_ms),
            ("drain_poll_ms", self.drain_poll_ms),
            ("remove_machine_team_ms", self.remove_machine_team_ms),
            ("remove_server_team_ms", self.remove_server_team_ms),
            ("wiggle_interval_ms", self.wiggle_interval_ms),
            ("health_check_ms", self.health_check_ms),
            ("server_list_poll_ms", self.server_list_poll_ms),
            ("store_type_sweep_ms", self.store_type_sweep_ms),
            ("testing_check_ms", self.testing_check_ms),
        ] {
            if ms == 0 {
                return Err(BallastError::msg(format!("{} must be nonzero", name)));
            }
        }
        Ok(())
    }
}

/// Handles to every external collaborator, shared by spawned tasks.
#[derive(Clone)]
pub struct CollectionEnv {
    pub keyspace: Arc<dyn SystemKeyspace>,
    pub shards: Arc<dyn ShardTracker>,
    pub controller: Arc<dyn ClusterController>,
    pub workers: Arc<dyn WorkerClient>,
    pub storage: Arc<dyn StorageClient>,
    pub failures: Arc<dyn FailureMonitor>,
}

/// Observations delivered to the supervisor by its spawned tasks.
#[derive(Debug)]
pub(crate) enum TrackEvent {
    FailureChanged { id: ServerId, failed: bool },
    Drained { id: ServerId },
    Metrics { id: ServerId, metrics: StorageMetrics },
    StoreTypeLearned { id: ServerId, store_type: StoreType },
    ServerListFetched { entries: Vec<ServerListEntry> },
    RecruitCandidate { reply: Result<RecruitStorageReply, BallastError> },
    RecruitDone {
        address: SocketAddr,
        added: Option<AddedServer>,
        is_testing: bool,
    },
    ExclusionsChanged,
    HealthyZoneChanged,
    WiggleSwitchChanged,
    WigglePidChanged,
    SnapshotRequested,
}

/// One region's complete placement state. Synchronous: every method runs to
/// completion between the supervisor's suspension points.
pub struct TeamCollection {
    region: Region,
    cfg: StorageConfig,
    knobs: CollectionKnobs,

    servers: HashMap<ServerId, ServerInfo>,
    testing_servers: HashMap<ServerId, ServerInfo>,
    testing_by_pair: HashMap<ServerId, ServerId>,
    pid_index: BTreeMap<ProcessId, Vec<ServerId>>,
    machines: HashMap<MachineId, MachineInfo>,
    teams: BTreeMap<TeamId, TeamInfo>,
    bad_teams: BTreeMap<TeamId, TeamInfo>,
    machine_teams: BTreeMap<MachineTeamId, MachineTeamInfo>,

    server_status: HashMap<ServerId, ServerStatus>,
    exclusions: HashMap<ExclusionKey, ExclusionStatus>,
    wiggle_addresses: Vec<ExclusionKey>,
    wiggling_pid: Option<ProcessId>,

    healthy_team_count: usize,
    optimal_team_count: usize,
    unhealthy_servers: usize,

    healthy_zone: Option<HealthyZone>,
    disable_failing_lagging: bool,
    lagging_zones: BTreeSet<MachineId>,
    stuck_team_selections: u64,

    do_build_teams: bool,
    last_build_teams_failed: bool,

    /// The initial failure-reaction delay has elapsed; relocations may flow.
    reaction_ready: bool,

    next_team_id: u64,
    next_machine_team_id: u64,
    rng: StdRng,

    shards: Arc<dyn ShardTracker>,
    relocations: mpsc::UnboundedSender<RelocateShard>,
    board: Arc<PriorityBoard>,
}

impl TeamCollection {
    pub fn new(
        region: Region,
        cfg: StorageConfig,
        knobs: CollectionKnobs,
        shards: Arc<dyn ShardTracker>,
        relocations: mpsc::UnboundedSender<RelocateShard>,
        board: Arc<PriorityBoard>,
    ) -> Self {
        let rng = match knobs.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        TeamCollection {
            region,
            cfg,
            knobs,
            servers: HashMap::new(),
            testing_servers: HashMap::new(),
            testing_by_pair: HashMap::new(),
            pid_index: BTreeMap::new(),
            machines: HashMap::new(),
            teams: BTreeMap::new(),
            bad_teams: BTreeMap::new(),
            machine_teams: BTreeMap::new(),
            server_status: HashMap::new(),
            exclusions: HashMap::new(),
            wiggle_addresses: Vec::new(),
            wiggling_pid: None,
            healthy_team_count: 0,
            optimal_team_count: 0,
            unhealthy_servers: 0,
            healthy_zone: None,
            disable_failing_lagging: false,
            lagging_zones: BTreeSet::new(),
            stuck_team_selections: 0,
            do_build_teams: false,
            last_build_teams_failed: false,
            reaction_ready: false,
            next_team_id: 1,
            next_machine_team_id: 1,
            rng,
            shards,
            relocations,
            board,
        }
    }

    pub(crate) fn tag(&self) -> &'static str {
        self.region.tag()
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn knobs(&self) -> &CollectionKnobs {
        &self.knobs
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn testing_server_count(&self) -> usize {
        self.testing_servers.len()
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }

    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    pub fn bad_team_count(&self) -> usize {
        self.bad_teams.len()
    }

    pub fn machine_team_count(&self) -> usize {
        self.machine_teams.len()
    }

    pub fn healthy_team_count(&self) -> usize {
        self.healthy_team_count
    }

    pub fn optimal_team_count(&self) -> usize {
        self.optimal_team_count
    }

    pub fn unhealthy_server_count(&self) -> usize {
        self.unhealthy_servers
    }

    pub fn zero_healthy(&self) -> bool {
        self.healthy_team_count == 0
    }

    pub fn last_build_teams_failed(&self) -> bool {
        self.last_build_teams_failed
    }

    pub fn server(&self, id: ServerId) -> Option<&ServerInfo> {
        self.servers.get(&id)
    }

    pub fn testing_server(&self, id: ServerId) -> Option<&ServerInfo> {
        self.testing_servers.get(&id)
    }

    pub fn testing_pair_of(&self, id: ServerId) -> Option<ServerId> {
        self.testing_by_pair.get(&id).copied()
    }

    pub fn machine(&self, id: &MachineId) -> Option<&MachineInfo> {
        self.machines.get(id)
    }

    /// Looks up a team, live or bad.
    pub fn team(&self, id: TeamId) -> Option<&TeamInfo> {
        self.teams.get(&id).or_else(|| self.bad_teams.get(&id))
    }

    pub fn teams(&self) -> impl Iterator<Item = &TeamInfo> {
        self.teams.values()
    }

    pub fn bad_teams(&self) -> impl Iterator<Item = &TeamInfo> {
        self.bad_teams.values()
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.keys().copied().collect()
    }

    pub fn testing_server_ids(&self) -> Vec<ServerId> {
        self.testing_servers.keys().copied().collect()
    }

    pub fn status(&self, id: ServerId) -> ServerStatus {
        self.server_status.get(&id).cloned().unwrap_or_default()
    }

    pub fn healthy_zone(&self) -> &Option<HealthyZone> {
        &self.healthy_zone
    }

    pub fn wiggling_pid(&self) -> Option<&ProcessId> {
        self.wiggling_pid.as_ref()
    }

    pub(crate) fn set_healthy_zone(&mut self, zone: Option<HealthyZone>) {
        self.healthy_zone = zone;
    }

    pub(crate) fn set_reaction_ready(&mut self) {
        self.reaction_ready = true;
    }

    pub(crate) fn needs_build(&self) -> bool {
        self.do_build_teams
    }

    pub(crate) fn set_migration(&mut self, migration: StorageMigrationType) {
        self.cfg.migration = migration;
    }

    pub(crate) fn set_desired_testing_servers(&mut self, n: usize) {
        self.cfg.desired_testing_servers = n;
    }

    pub(crate) fn set_usable_regions(&mut self, n: usize) {
        self.cfg.usable_regions = n;
    }

    /// Dumps a one-shot snapshot of the collection to the log, for the
    /// externally poked debug trigger.
    pub fn log_snapshot(&self) {
        region_info!(self.tag(),
            "snapshot: servers={} testing={} machines={} teams={} bad={} \
             machine_teams={} healthy={} optimal={} unhealthy_servers={}",
            self.servers.len(), self.testing_servers.len(), self.machines.len(),
            self.teams.len(), self.bad_teams.len(), self.machine_teams.len(),
            self.healthy_team_count, self.optimal_team_count,
            self.unhealthy_servers);
        for team in self.teams.values().chain(self.bad_teams.values()) {
            region_info!(self.tag(),
                "snapshot team {}: priority={} healthy={} bad={} redundant={}",
                team.desc(), team.priority, team.healthy, team.is_bad,
                team.is_redundant);
        }
    }
}

/// Rolling summary of a collection, published on a watch channel after
/// every supervisor step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub servers: usize,
    pub testing_servers: usize,
    pub machines: usize,
    pub teams: usize,
    pub bad_teams: usize,
    pub machine_teams: usize,
    pub healthy_teams: usize,
    pub optimal_teams: usize,
    pub unhealthy_servers: usize,
    pub zero_healthy: bool,
}

/// Supervisor of one region's collection: bootstraps state from the system
/// keyspace, spawns the watcher tasks, and serializes every mutation
/// through its event loop.
pub struct CollectionSupervisor {
    tc: TeamCollection,
    env: CollectionEnv,

    tx_event: mpsc::UnboundedSender<TrackEvent>,
    rx_event: mpsc::UnboundedReceiver<TrackEvent>,
    tx_stuck: mpsc::UnboundedSender<()>,
    rx_stuck: mpsc::UnboundedReceiver<()>,

    zero_healthy_tx: watch::Sender<bool>,
    zero_optimal_tx: watch::Sender<bool>,
    stats_tx: watch::Sender<CollectionStats>,

    /// Unhealthy in-flight relocation count published by the queue.
    unhealthy_relocations: watch::Receiver<usize>,

    /// One watchdog task per tracked server, plus its unhealthy flag.
    watchdogs: HashMap<ServerId, (JoinHandle<()>, watch::Sender<bool>)>,

    /// Keyspace watchers and the server-list poller.
    watcher_tasks: Vec<JoinHandle<()>>,

    /// Armed zero-servers-left loggers by team.
    zero_left_loggers: HashMap<TeamId, JoinHandle<()>>,

    recruiter: RecruiterState,
    wiggle: WiggleState,

    /// Rest pacing between wiggle rounds; a round that finishes while the
    /// cluster is small earns the long rest.
    wiggle_rest: RestTimer,

    /// Servers the failure monitor currently reports as failed; re-applied
    /// when the maintenance zone changes.
    monitor_failed: HashSet<ServerId>,

    replicas_key_updated: bool,
}

impl CollectionSupervisor {
    /// Creates a supervisor and performs the external bootstrap: loads the
    /// initial server and team placements, seeds the collection, applies
    /// current exclusions, and spawns all watcher tasks.
    pub async fn new_and_setup(
        region: Region,
        cfg: StorageConfig,
        knobs: CollectionKnobs,
        env: CollectionEnv,
        relocations: mpsc::UnboundedSender<RelocateShard>,
        unhealthy_relocations: watch::Receiver<usize>,
        board: Arc<PriorityBoard>,
    ) -> Result<Self, BallastError> {
        knobs.validate()?;

        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let (tx_stuck, rx_stuck) = mpsc::unbounded_channel();
        let (zero_healthy_tx, _) = watch::channel(true);
        let (zero_optimal_tx, _) = watch::channel(true);
        let (stats_tx, _) = watch::channel(CollectionStats::default());

        let page_limit = knobs.key_servers_page_limit;
        let wiggle_rest =
            RestTimer::new(Duration::from_millis(knobs.wiggle_interval_ms));
        let tc = TeamCollection::new(
            region,
            cfg,
            knobs,
            env.shards.clone(),
            relocations,
            board,
        );

        let mut supervisor = CollectionSupervisor {
            tc,
            env,
            tx_event,
            rx_event,
            tx_stuck,
            rx_stuck,
            zero_healthy_tx,
            zero_optimal_tx,
            stats_tx,
            unhealthy_relocations,
            watchdogs: HashMap::new(),
            watcher_tasks: Vec::new(),
            zero_left_loggers: HashMap::new(),
            recruiter: RecruiterState::default(),
            wiggle: WiggleState::new(),
            wiggle_rest,
            monitor_failed: HashSet::new(),
            replicas_key_updated: false,
        };

        let initial = load_initial_state(
            &supervisor.env.keyspace,
            &supervisor.tc.cfg.remote_dcs,
            page_limit,
        )
        .await?;
        supervisor.seed(initial)?;
        supervisor.apply_exclusions_now().await?;
        supervisor.spawn_watchers();
        supervisor.restart_recruiting();
        Ok(supervisor)
    }

    /// Subscribes to the zero-healthy-teams flag.
    pub fn zero_healthy_teams(&self) -> watch::Receiver<bool> {
        self.zero_healthy_tx.subscribe()
    }

    /// Subscribes to the rolling stats summary.
    pub fn stats(&self) -> watch::Receiver<CollectionStats> {
        self.stats_tx.subscribe()
    }

    /// Sender the relocation queue uses to report stuck team selection.
    pub fn stuck_reporter(&self) -> mpsc::UnboundedSender<()> {
        self.tx_stuck.clone()
    }

    pub fn collection(&self) -> &TeamCollection {
        &self.tc
    }

    /// Seeds the collection from the bootstrap state: servers first, then
    /// the observed teams (as initial teams, whatever their size), then
    /// testing servers.
    fn seed(&mut self, initial: InitialClusterState) -> Result<(), BallastError> {
        if initial.mode == 0 {
            region_warn!(self.tc.tag(), "data distribution disabled at bootstrap");
        }
        self.tc.set_healthy_zone(initial.healthy_zone.clone());

        for entry in &initial.servers {
            self.tc.add_server(
                entry.interface.clone(),
                entry.class,
                entry.added_version,
            )?;
            self.ensure_watchdog(entry.interface.id);
        }

        let seed_teams = if self.tc.region.is_primary() {
            &initial.primary_teams
        } else {
            &initial.remote_teams
        };
        for members in seed_teams {
            self.tc.add_team(members, true, false);
        }

        for entry in &initial.testing_servers {
            self.tc.add_server(
                entry.interface.clone(),
                entry.class,
                entry.added_version,
            )?;
            self.ensure_watchdog(entry.interface.id);
        }

        self.tc.do_build_teams = true;
        region_info!(self.tc.tag(),
            "bootstrap complete: servers={} teams={} testing={}",
            initial.servers.len(), seed_teams.len(),
            initial.testing_servers.len());
        Ok(())
    }

    /// (Re)spawns the watchdog task of one server.
    fn ensure_watchdog(&mut self, id: ServerId) {
        if let Some((handle, _)) = self.watchdogs.remove(&id) {
            handle.abort();
        }
        let info = match self
            .tc
            .servers
            .get(&id)
            .or_else(|| self.tc.testing_servers.get(&id))
        {
            Some(info) => info,
            None => return,
        };
        let timings = WatchdogTimings {
            failure_reaction: Duration::from_millis(self.tc.knobs.failure_reaction_ms),
            metrics_poll: Duration::from_millis(self.tc.knobs.metrics_poll_ms),
            metrics_jitter: Duration::from_millis(self.tc.knobs.metrics_jitter_ms),
            drain_poll: Duration::from_millis(self.tc.knobs.drain_poll_ms),
            removal_version_margin: self.tc.knobs.removal_version_margin,
        };
        let unhealthy = self.tc.status(id).is_unhealthy();
        let (unhealthy_tx, unhealthy_rx) = watch::channel(unhealthy);
        let handle = tokio::spawn(server_tracker::server_watchdog(
            self.tc.tag(),
            id,
            info.interface.clone(),
            info.added_version,
            self.tc.is_testing_server(id),
            timings,
            unhealthy_rx,
            self.env.clone(),
            self.tx_event.clone(),
        ));
        self.watchdogs.insert(id, (handle, unhealthy_tx));
    }

    fn drop_watchdog(&mut self, id: ServerId) {
        if let Some((handle, _)) = self.watchdogs.remove(&id) {
            handle.abort();
        }
    }

    /// Spawns the keyspace watchers and the server-list poller. Each one
    /// turns "this value may have changed" into an event; the supervisor
    /// re-reads and diffs.
    fn spawn_watchers(&mut self) {
        let region = self.tc.region;

        macro_rules! spawn_watch {
            ($watch:ident, $event:expr) => {{
                let keyspace = self.env.keyspace.clone();
                let tx = self.tx_event.clone();
                self.watcher_tasks.push(tokio::spawn(async move {
                    loop {
                        if keyspace.$watch().await.is_err() {
                            time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                        if tx.send($event).is_err() {
                            break;
                        }
                    }
                }));
            }};
        }

        spawn_watch!(watch_exclusions, TrackEvent::ExclusionsChanged);
        spawn_watch!(watch_healthy_zone, TrackEvent::HealthyZoneChanged);
        spawn_watch!(watch_wiggle_switch, TrackEvent::WiggleSwitchChanged);
        spawn_watch!(watch_snapshot_trigger, TrackEvent::SnapshotRequested);

        {
            let keyspace = self.env.keyspace.clone();
            let tx = self.tx_event.clone();
            self.watcher_tasks.push(tokio::spawn(async move {
                loop {
                    if keyspace.watch_wiggling_pid(region).await.is_err() {
                        time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                    if tx.send(TrackEvent::WigglePidChanged).is_err() {
                        break;
                    }
                }
            }));
        }

        {
            let keyspace = self.env.keyspace.clone();
            let tx = self.tx_event.clone();
            let poll = Duration::from_millis(self.tc.knobs.server_list_poll_ms);
            self.watcher_tasks.push(tokio::spawn(async move {
                loop {
                    time::sleep(poll).await;
                    match keyspace.read_server_list().await {
                        Ok(entries) => {
                            if tx
                                .send(TrackEvent::ServerListFetched { entries })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            region_debug!(region.tag(), "server list poll failed: {}", e)
                        }
                    }
                }
            }));
        }
    }

    /// Runs the region until the termination signal flips. Consumes the
    /// supervisor and hands the final collection state back for inspection.
    pub async fn run(
        mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<TeamCollection, BallastError> {
        let reaction_delay =
            time::sleep(Duration::from_millis(self.tc.knobs.initial_reaction_ms));
        tokio::pin!(reaction_delay);

        let mut machine_team_remover = time::interval(Duration::from_millis(
            self.tc.knobs.remove_machine_team_ms,
        ));
        machine_team_remover.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut server_team_remover = time::interval(Duration::from_millis(
            self.tc.knobs.remove_server_team_ms,
        ));
        server_team_remover.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health_check =
            time::interval(Duration::from_millis(self.tc.knobs.health_check_ms));
        health_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut testing_check =
            time::interval(Duration::from_millis(self.tc.knobs.testing_check_ms));
        testing_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut store_sweep =
            time::interval(Duration::from_millis(self.tc.knobs.store_type_sweep_ms));
        store_sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.tc.needs_build() {
                self.tc.build_teams();
                self.maybe_update_replicas_key().await;
                // let any status fallout settle before the next decision
                tokio::task::yield_now().await;
            }
            self.publish_flags();

            tokio::select! {
                event = self.rx_event.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await?,
                        None => break,
                    }
                },

                Some(()) = self.rx_stuck.recv() => {
                    self.tc.note_team_selection_stuck();
                },

                () = &mut reaction_delay, if !self.tc.reaction_ready => {
                    self.tc.set_reaction_ready();
                    let deltas = self.tc.refresh_all_teams();
                    self.after_refresh(deltas);
                },

                _ = machine_team_remover.tick() => {
                    self.tc.try_remove_one_machine_team();
                },

                _ = server_team_remover.tick() => {
                    self.tc.try_remove_one_server_team();
                },

                _ = health_check.tick() => {
                    self.health_check().await;
                },

                _ = testing_check.tick() => {
                    self.testing_surplus_check().await;
                },

                _ = store_sweep.tick() => {
                    self.wrong_store_sweep();
                },

                () = self.wiggle_rest.elapsed() => {
                    self.advance_wiggle_pid().await;
                },

                _ = rx_term.changed() => {
                    region_warn!(self.tc.tag(), "collection caught termination signal");
                    break;
                },
            }
        }

        self.shutdown();
        Ok(self.tc)
    }

    fn shutdown(&mut self) {
        for (_, (handle, _)) in self.watchdogs.drain() {
            handle.abort();
        }
        for handle in self.watcher_tasks.drain(..) {
            handle.abort();
        }
        for (_, handle) in self.zero_left_loggers.drain() {
            handle.abort();
        }
        if let Some(task) = self.recruiter.candidate_task.take() {
            task.abort();
        }
        if let Some(rendezvous) = self.recruiter.rendezvous.take() {
            rendezvous.cancel();
        }
    }

    fn publish_flags(&mut self) {
        let zero_healthy = self.tc.zero_healthy();
        self.zero_healthy_tx.send_if_modified(|v| {
            let changed = *v != zero_healthy;
            *v = zero_healthy;
            changed
        });
        let zero_optimal = self.tc.optimal_team_count == 0;
        self.zero_optimal_tx.send_if_modified(|v| {
            let changed = *v != zero_optimal;
            *v = zero_optimal;
            changed
        });
        let stats = CollectionStats {
            servers: self.tc.server_count(),
            testing_servers: self.tc.testing_server_count(),
            machines: self.tc.machine_count(),
            teams: self.tc.team_count(),
            bad_teams: self.tc.bad_team_count(),
            machine_teams: self.tc.machine_team_count(),
            healthy_teams: self.tc.healthy_team_count(),
            optimal_teams: self.tc.optimal_team_count(),
            unhealthy_servers: self.tc.unhealthy_server_count(),
            zero_healthy,
        };
        self.stats_tx.send_if_modified(|v| {
            let changed = *v != stats;
            *v = stats;
            changed
        });
    }

    async fn handle_event(&mut self, event: TrackEvent) -> Result<(), BallastError> {
        match event {
            TrackEvent::FailureChanged { id, failed } => {
                if failed {
                    self.monitor_failed.insert(id);
                } else {
                    self.monitor_failed.remove(&id);
                }
                if self.tc.apply_failure(id, failed) {
                    self.after_server_status_change(id);
                    if failed {
                        self.restart_recruiting();
                    }
                }
            }

            TrackEvent::Drained { id } => {
                self.handle_drained(id).await?;
            }

            TrackEvent::Metrics { id, metrics } => {
                if self.tc.note_metrics(id, metrics) {
                    // lag state moved; it may have region-wide consequences
                    self.rederive_all_statuses();
                }
            }

            TrackEvent::StoreTypeLearned { id, store_type } => {
                if self.tc.note_store_type(id, store_type) {
                    self.wrong_store_sweep();
                }
            }

            TrackEvent::ServerListFetched { entries } => {
                self.handle_server_list(entries)?;
            }

            TrackEvent::RecruitCandidate { reply } => {
                self.recruiter.candidate_task = None;
                match reply {
                    Ok(reply) => self.handle_candidate(reply),
                    Err(e) => {
                        region_warn!(self.tc.tag(), "candidate query failed: {}", e);
                        self.restart_recruiting();
                    }
                }
            }

            TrackEvent::RecruitDone {
                address,
                added,
                is_testing,
            } => {
                self.handle_recruit_done(address, added, is_testing);
            }

            TrackEvent::ExclusionsChanged => {
                self.apply_exclusions_now().await?;
            }

            TrackEvent::HealthyZoneChanged => {
                let zone = self.env.keyspace.read_healthy_zone().await?;
                self.tc.set_healthy_zone(zone);
                // failures masked (or unmasked) by the zone must be replayed
                for id in self.monitor_failed.clone() {
                    if self.tc.apply_failure(id, true) {
                        self.after_server_status_change(id);
                    }
                }
                self.rederive_all_statuses();
            }

            TrackEvent::WiggleSwitchChanged => {
                self.handle_wiggle_switch().await?;
            }

            TrackEvent::WigglePidChanged => {
                self.handle_wiggle_pid().await?;
            }

            TrackEvent::SnapshotRequested => {
                self.tc.log_snapshot();
            }
        }
        Ok(())
    }

    /// A server (or testing server) has fully drained: delete its
    /// registration and tear it out of the registry.
    async fn handle_drained(&mut self, id: ServerId) -> Result<(), BallastError> {
        if let Err(e) = self.env.keyspace.remove_server_entry(id).await {
            if e == BallastError::MoveKeysConflict {
                // a competing key movement won; re-check whether
                // distribution is even enabled before bubbling out
                if self.env.keyspace.read_dd_mode().await.unwrap_or(0) == 0 {
                    region_warn!(self.tc.tag(),
                        "suppressing move-keys conflict: distribution disabled");
                    return Ok(());
                }
                return Err(e);
            }
            // transient; the drain poller will fire again
            region_warn!(self.tc.tag(), "removing server entry {} failed: {}",
                     id.short(), e);
            return Ok(());
        }
        self.monitor_failed.remove(&id);

        if self.tc.is_testing_server(id) {
            self.tc.remove_testing_server(id);
            self.drop_watchdog(id);
            self.restart_recruiting();
            return Ok(());
        }

        let pair = self.tc.testing_pair_of(id);
        let outcome = self.tc.remove_server(id);
        self.drop_watchdog(id);
        for team_id in &outcome.dropped_teams {
            if let Some(handle) = self.zero_left_loggers.remove(team_id) {
                handle.abort();
            }
        }

        // a testing server cannot outlive its pair
        if let Some(tss_id) = pair {
            region_info!(self.tc.tag(),
                "removing testing server {} with its pair", tss_id.short());
            let _ = self.env.keyspace.remove_server_entry(tss_id).await;
            self.tc.remove_testing_server(tss_id);
            self.drop_watchdog(tss_id);
        }

        // wiggle progress: the round ends when its last server is gone
        if self.wiggle.outstanding.remove(&id) && self.wiggle.outstanding.is_empty() {
            self.finish_wiggle_round().await?;
        }

        if outcome.had_wrong_store_type {
            self.wrong_store_sweep();
        }
        self.restart_recruiting();
        Ok(())
    }

    /// Diffs a fresh server-list read against the registry: new servers are
    /// added, changed interfaces are applied.
    fn handle_server_list(
        &mut self,
        entries: Vec<ServerListEntry>,
    ) -> Result<(), BallastError> {
        for entry in entries {
            let id = entry.interface.id;
            let known = self
                .tc
                .servers
                .get(&id)
                .or_else(|| self.tc.testing_servers.get(&id))
                .map(|info| info.interface.clone());
            match known {
                None => {
                    if self.tc.should_handle(&entry.interface)
                        && self
                            .tc
                            .add_server(entry.interface.clone(), entry.class, entry.added_version)
                            .is_ok()
                    {
                        self.ensure_watchdog(id);
                        self.restart_recruiting();
                    }
                }
                Some(ref old) if *old != entry.interface => {
                    let effects =
                        self.tc.interface_changed(id, entry.interface, entry.class);
                    // the watchdog watches the old address; restart it
                    self.ensure_watchdog(id);
                    self.after_server_status_change(id);
                    if effects.restart_recruiting {
                        self.restart_recruiting();
                    }
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Re-reads the exclusion lists and worker directory, re-derives every
    /// status, and restarts recruitment with the new exclusion set.
    async fn apply_exclusions_now(&mut self) -> Result<(), BallastError> {
        let lists = self.env.keyspace.read_exclusions().await?;
        let workers = self.env.keyspace.read_workers().await?;
        self.tc.apply_exclusion_lists(&lists, &workers);
        // reset failure bits to the monitor's truth first; a lifted failed
        // exclusion must not leave a live server marked failed
        let ids: Vec<ServerId> = self
            .tc
            .server_ids()
            .into_iter()
            .chain(self.tc.testing_server_ids())
            .collect();
        for id in ids {
            self.tc.apply_failure(id, self.monitor_failed.contains(&id));
        }
        self.rederive_all_statuses();
        self.restart_recruiting();
        Ok(())
    }

    /// Re-derives the status of every server (testing included), processes
    /// the side effects, and refreshes all teams once at the end.
    fn rederive_all_statuses(&mut self) {
        let ids: Vec<ServerId> = self
            .tc
            .server_ids()
            .into_iter()
            .chain(self.tc.testing_server_ids())
            .collect();
        let mut want_recruiting = false;
        for id in ids {
            let effects = self.tc.derive_server_status(id);
            want_recruiting |= effects.restart_recruiting;
            if effects.remove_failed {
                region_error!(self.tc.tag(),
                    "server {} in failed exclusion state; repairing its key \
                     ranges and draining", id.short());
            }
            for peer in effects.wake_peers {
                self.tc.derive_server_status(peer);
            }
            self.sync_unhealthy_watch(id);
        }
        let deltas = self.tc.refresh_all_teams();
        self.after_refresh(deltas);
        if want_recruiting {
            self.restart_recruiting();
        }
    }

    /// One server's status changed: push the unhealthy flag to its
    /// watchdog, re-derive its derived bits, and refresh its teams.
    fn after_server_status_change(&mut self, id: ServerId) {
        let effects = self.tc.derive_server_status(id);
        for peer in effects.wake_peers {
            self.tc.derive_server_status(peer);
            self.sync_unhealthy_watch(peer);
        }
        if effects.remove_failed {
            region_error!(self.tc.tag(),
                "server {} in failed exclusion state; repairing its key ranges \
                 and draining", id.short());
        }
        self.sync_unhealthy_watch(id);
        let deltas = self.tc.refresh_teams_of_server(id);
        self.after_refresh(deltas);
        if effects.restart_recruiting {
            self.restart_recruiting();
        }
    }

    fn sync_unhealthy_watch(&mut self, id: ServerId) {
        let unhealthy = self.tc.status(id).is_unhealthy();
        if let Some((_, unhealthy_tx)) = self.watchdogs.get(&id) {
            let _ = unhealthy_tx.send_if_modified(|v| {
                let changed = *v != unhealthy;
                *v = unhealthy;
                changed
            });
        }
    }

    /// Arms and disarms zero-servers-left loggers from refresh deltas.
    fn after_refresh(&mut self, deltas: Vec<(TeamId, team_tracker::TeamDelta)>) {
        for (team_id, delta) in deltas {
            if delta.left_zero_left {
                if let Some(handle) = self.zero_left_loggers.remove(&team_id) {
                    handle.abort();
                }
            }
            if delta.entered_zero_left {
                let team = match self.tc.team(team_id) {
                    Some(team) => team,
                    None => continue,
                };
                let handle = tokio::spawn(team_tracker::zero_left_logger(
                    self.tc.tag(),
                    team.desc(),
                    team.servers.clone(),
                    self.tc.region.is_primary(),
                    self.env.shards.clone(),
                    Duration::from_millis(self.tc.knobs.zero_left_log_delay_ms),
                ));
                self.zero_left_loggers.insert(team_id, handle);
            }
        }
    }

    /// Periodic health work: expire the maintenance zone, dispose of bad
    /// teams once settled, and drive the wiggle pause state.
    async fn health_check(&mut self) {
        // maintenance zones expire by version
        let zone_expiry = match &self.tc.healthy_zone {
            Some(HealthyZone::Zone { until_version, .. }) => Some(*until_version),
            _ => None,
        };
        if let Some(until_version) = zone_expiry {
            if let Ok(version) = self.env.keyspace.current_version().await {
                if version > until_version {
                    region_info!(self.tc.tag(), "maintenance zone expired");
                    self.tc.set_healthy_zone(None);
                    let _ = self.env.keyspace.clear_healthy_zone().await;
                    for id in self.monitor_failed.clone() {
                        if self.tc.apply_failure(id, true) {
                            self.after_server_status_change(id);
                        }
                    }
                }
            }
        }

        // drained bad teams are discarded once the region has settled
        if self.tc.is_settled_healthy() && self.tc.bad_team_count() > 0 {
            for team_id in self.tc.drop_bad_teams() {
                if let Some(handle) = self.zero_left_loggers.remove(&team_id) {
                    handle.abort();
                }
            }
        }

        self.wiggle_pause_check().await;
        self.maybe_update_replicas_key().await;
    }

    /// Publishes the per-datacenter replica target once the region first
    /// becomes healthy.
    async fn maybe_update_replicas_key(&mut self) {
        if self.replicas_key_updated
            || !self.tc.reaction_ready
            || self.tc.zero_healthy()
        {
            return;
        }
        for dc in self.tc.cfg.included_dcs.clone() {
            let current = self.env.keyspace.read_dc_replicas(&dc).await.ok().flatten();
            if current != Some(self.tc.cfg.team_size) {
                let _ = self
                    .env
                    .keyspace
                    .write_dc_replicas(&dc, self.tc.cfg.team_size)
                    .await;
            }
        }
        self.replicas_key_updated = true;
    }

    /// Sweeps for wrong-store-type servers; under aggressive migration one
    /// server per settled-healthy pass gets marked for removal.
    fn wrong_store_sweep(&mut self) {
        if !self.tc.is_settled_healthy() {
            return;
        }
        if let Some((id, marked)) = self.tc.find_wrong_store_type_server() {
            if marked {
                self.after_server_status_change(id);
                self.restart_recruiting();
            }
        }
    }

    // ---- recruitment ----------------------------------------------------

    /// Recomputes the candidate query and (re)issues it if it changed or no
    /// fetch is outstanding.
    fn restart_recruiting(&mut self) {
        let req = self.tc.recruitment_request(&self.recruiter.in_flight);
        let fetch_alive = self
            .recruiter
            .candidate_task
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false);
        if fetch_alive && self.recruiter.last_request.as_ref() == Some(&req) {
            return;
        }
        if let Some(task) = self.recruiter.candidate_task.take() {
            task.abort();
        }
        if req.critical {
            region_warn!(self.tc.tag(), "critical storage recruitment in progress");
        }
        self.recruiter.last_request = Some(req.clone());
        self.recruiter.candidate_task = Some(tokio::spawn(recruiter::fetch_candidate(
            self.env.clone(),
            req,
            self.tx_event.clone(),
        )));
    }

    /// Decides what to do with a candidate worker: start a testing-server
    /// rendezvous, pair it with a waiting testing server, or recruit a
    /// plain storage server.
    fn handle_candidate(&mut self, reply: RecruitStorageReply) {
        let worker = reply.worker;
        let address = worker.address;

        if self.recruiter.in_flight.contains(&address)
            || self.tc.servers_on_address(address) >= 2
        {
            // too many storage servers on one process invites trouble
            region_warn!(self.tc.tag(), "skipping candidate {}: address saturated",
                     address);
            self.restart_recruiting();
            return;
        }

        let deficit = self.tc.testing_deficit(self.recruiter.testing_in_progress);
        let retry = Duration::from_millis(self.tc.knobs.recruit_retry_ms);
        let pair_timeout = Duration::from_millis(self.tc.knobs.pair_timeout_ms);

        if self.tc.healthy_team_count() > 0
            && self.recruiter.rendezvous.is_none()
            && deficit > 0
        {
            // stash this candidate as the testing half of a new pair
            let (pair_tx, pair_rx) = oneshot::channel();
            let (tss_done_tx, tss_done_rx) = oneshot::channel();
            let task = tokio::spawn(recruiter::recruit_testing_server(
                self.tc.tag(),
                self.env.clone(),
                worker.clone(),
                self.tc.cfg.testing_store_type,
                retry,
                pair_rx,
                tss_done_tx,
                self.tx_event.clone(),
            ));
            self.recruiter.rendezvous = Some(PairRendezvous {
                dc: worker.locality.dc_id().map(|s| s.to_string()),
                data_hall: worker.locality.data_hall().map(|s| s.to_string()),
                pair_tx,
                tss_done_rx,
                task,
            });
            self.recruiter.testing_in_progress += 1;
            self.recruiter.in_flight.insert(address);
            self.restart_recruiting();
            return;
        }

        let pair_here = self
            .recruiter
            .rendezvous
            .as_ref()
            .map(|r| r.in_data_zone(&worker))
            .unwrap_or(false);
        let rendezvous = if pair_here {
            let r = self.recruiter.rendezvous.take().unwrap();
            Some((r.pair_tx, r.tss_done_rx))
        } else {
            None
        };
        self.recruiter.in_flight.insert(address);
        tokio::spawn(recruiter::recruit_storage_server(
            self.tc.tag(),
            self.env.clone(),
            worker,
            self.tc.cfg.store_type,
            retry,
            pair_timeout,
            rendezvous,
            self.tx_event.clone(),
        ));
        self.restart_recruiting();
    }

    fn handle_recruit_done(
        &mut self,
        address: SocketAddr,
        added: Option<AddedServer>,
        is_testing: bool,
    ) {
        self.recruiter.in_flight.remove(&address);
        if is_testing {
            self.recruiter.testing_in_progress =
                self.recruiter.testing_in_progress.saturating_sub(1);
            let stale = self
                .recruiter
                .rendezvous
                .as_ref()
                .map(|r| r.task.is_finished())
                .unwrap_or(false);
            if stale {
                self.recruiter.rendezvous = None;
            }
        }

        if let Some(added) = added {
            let id = added.interface.id;
            match self
                .tc
                .add_server(added.interface, added.class, added.added_version)
            {
                Ok(()) => {
                    self.ensure_watchdog(id);
                    if !is_testing {
                        self.tc.do_build_teams = true;
                    }
                }
                Err(e) => region_warn!(self.tc.tag(), "recruited {}: {}", id.short(), e),
            }
        }
        self.restart_recruiting();
    }

    /// Cancels testing recruitment and kills surplus testing servers when
    /// there are too many of them or no healthy team remains.
    async fn testing_surplus_check(&mut self) {
        let deficit = self.tc.testing_deficit(self.recruiter.testing_in_progress);
        let zero_healthy = self.tc.zero_healthy();

        if (deficit < 0 || zero_healthy) && self.recruiter.rendezvous.is_some() {
            region_warn!(self.tc.tag(), "cancelling testing-server recruitment ({})",
                     if zero_healthy { "zero healthy teams" } else { "surplus" });
            if let Some(rendezvous) = self.recruiter.rendezvous.take() {
                rendezvous.cancel();
            }
        }

        let excess = (-deficit).max(0) as usize;
        let to_kill = excess
            .max(if zero_healthy && self.tc.testing_server_count() > 0 {
                1
            } else {
                0
            })
            .min(self.tc.testing_server_count());
        if to_kill > 0 {
            // oldest first
            for id in self.tc.oldest_testing_servers(to_kill) {
                region_warn!(self.tc.tag(), "killing testing server {} ({})",
                         id.short(),
                         if zero_healthy { "zero healthy teams" } else { "surplus" });
                let _ = self.env.keyspace.remove_server_entry(id).await;
                self.tc.remove_testing_server(id);
                self.drop_watchdog(id);
            }
            self.restart_recruiting();
        }
    }

    // ---- wiggle ---------------------------------------------------------

    async fn handle_wiggle_switch(&mut self) -> Result<(), BallastError> {
        let enabled = self.env.keyspace.read_wiggle_switch().await?;
        if enabled == self.wiggle.enabled {
            return Ok(());
        }
        self.wiggle.enabled = enabled;
        if enabled {
            region_info!(self.tc.tag(), "perpetual storage wiggle enabled");
            self.wiggle.paused = false;
            // resume from the persisted pid, or start at the first
            let pid = match self.env.keyspace.read_wiggling_pid(self.tc.region).await? {
                Some(pid) => Some(pid),
                None => self.tc.next_wiggle_pid(None),
            };
            if let Some(pid) = pid {
                self.env
                    .keyspace
                    .write_wiggling_pid(self.tc.region, &pid)
                    .await?;
            }
        } else {
            region_info!(self.tc.tag(), "perpetual storage wiggle disabled");
            self.wiggle.paused = true;
            self.wiggle.outstanding.clear();
            self.wiggle.pending_advance = None;
            self.wiggle_rest.cancel();
            if self.tc.include_wiggled() {
                self.rederive_all_statuses();
            }
            self.tc.set_wiggling_pid(None);
            self.restart_recruiting();
        }
        Ok(())
    }

    async fn handle_wiggle_pid(&mut self) -> Result<(), BallastError> {
        if !self.wiggle.enabled {
            return Ok(());
        }
        let pid = match self.env.keyspace.read_wiggling_pid(self.tc.region).await? {
            Some(pid) => pid,
            None => return Ok(()),
        };
        self.tc.set_wiggling_pid(Some(pid.clone()));
        if !self.wiggle.paused {
            self.start_wiggle_round(&pid).await?;
        }
        Ok(())
    }

    async fn start_wiggle_round(&mut self, pid: &ProcessId) -> Result<(), BallastError> {
        let affected = self.tc.exclude_for_wiggle(pid);
        self.wiggle.outstanding = affected.iter().copied().collect();
        for id in &affected {
            let effects = self.tc.derive_server_status(*id);
            for peer in effects.wake_peers {
                self.tc.derive_server_status(peer);
            }
            self.sync_unhealthy_watch(*id);
            let deltas = self.tc.refresh_teams_of_server(*id);
            self.after_refresh(deltas);
        }
        self.restart_recruiting();
        if self.wiggle.outstanding.is_empty() {
            // nothing lives on this process; move right along
            self.finish_wiggle_round().await?;
        }
        Ok(())
    }

    /// Ends the current wiggle round: re-include the addresses, relax the
    /// pause margin, and arm the rest timer after which the next pid is
    /// persisted (resting longer while the cluster is too small to absorb
    /// wiggled data).
    async fn finish_wiggle_round(&mut self) -> Result<(), BallastError> {
        if self.tc.include_wiggled() {
            self.rederive_all_statuses();
        }
        let finished = self.tc.wiggling_pid().cloned();
        region_info!(self.tc.tag(), "wiggle round finished for process {:?}", finished);
        self.tc.set_wiggling_pid(None);
        self.wiggle.finish_round();
        self.tc.do_build_teams = true;
        self.restart_recruiting();

        if let Some(next) = self.tc.next_wiggle_pid(finished.as_ref()) {
            self.wiggle.pending_advance = Some(next);
            // too few servers to place wiggled data: rest much longer
            let small = self.tc.server_count() <= self.tc.cfg.team_size
                || self.tc.machine_count() < self.tc.cfg.team_size;
            if small {
                self.wiggle_rest.long_rest();
            } else {
                self.wiggle_rest.rest();
            }
        }
        Ok(())
    }

    /// The between-rounds rest elapsed; persist the next wiggling pid so
    /// the watcher kicks off the next round.
    async fn advance_wiggle_pid(&mut self) {
        if let Some(next) = self.wiggle.pending_advance.take() {
            if self.wiggle.enabled {
                let _ = self
                    .env
                    .keyspace
                    .write_wiggling_pid(self.tc.region, &next)
                    .await;
            }
        }
    }

    /// Applies the wiggle pause conditions and pauses/resumes the current
    /// round accordingly.
    async fn wiggle_pause_check(&mut self) {
        if !self.wiggle.enabled {
            return;
        }
        let unhealthy_moves = *self.unhealthy_relocations.borrow();
        let should_pause = self.wiggle.should_pause(
            &self.tc.knobs,
            unhealthy_moves,
            self.tc.healthy_team_count(),
            self.tc.team_count(),
            self.tc.stuck_team_selections,
        );

        if should_pause && !self.wiggle.paused {
            region_warn!(self.tc.tag(),
                "pausing storage wiggle (unhealthy moves={} healthy teams={} \
                 margin={})",
                unhealthy_moves, self.tc.healthy_team_count(),
                self.wiggle.extra_team_count);
            self.wiggle.paused = true;
            self.wiggle.outstanding.clear();
            if self.tc.include_wiggled() {
                self.rederive_all_statuses();
            }
            self.tc.do_build_teams = true;
        } else if !should_pause && self.wiggle.paused {
            region_info!(self.tc.tag(), "resuming storage wiggle");
            self.wiggle.paused = false;
            if let Some(pid) = self.tc.wiggling_pid().cloned() {
                let _ = self.start_wiggle_round(&pid).await;
            }
        }
    }
}


#[cfg(test)]
mod collection_tests {
    use super::*;

    #[test]
    fn knobs_parse_from_toml() -> Result<(), BallastError> {
        let knobs = CollectionKnobs::from_toml(None)?;
        assert_eq!(knobs, CollectionKnobs::default());

        let knobs = CollectionKnobs::from_toml(Some(
            "desired_teams_per_server = 3\nbest_of_attempts = 8",
        ))?;
        assert_eq!(knobs.desired_teams_per_server, 3);
        assert_eq!(knobs.best_of_attempts, 8);
        assert_eq!(knobs.overlap_penalty, 10_000);

        assert!(CollectionKnobs::from_toml(Some("no_such_knob = 1")).is_err());
        Ok(())
    }

    #[test]
    fn knobs_validation_rejects_unrunnable_combinations() {
        // the remover band would be inverted
        assert!(CollectionKnobs::from_toml(Some(
            "desired_teams_per_server = 8\nmax_teams_per_server = 4",
        ))
        .is_err());

        // lag hysteresis must open downward
        assert!(CollectionKnobs::from_toml(Some(
            "version_lag_to_fail = 100\nversion_lag_to_clear = 100",
        ))
        .is_err());

        // a zero-period interval would never tick
        assert!(CollectionKnobs::from_toml(Some("health_check_ms = 0")).is_err());
        assert!(CollectionKnobs::from_toml(Some("best_of_attempts = 0")).is_err());
    }

    #[test]
    fn empty_team_is_populate_region_placeholder() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 23);
        let tid = tc.add_team(&[], true, false);
        let team = tc.team(tid).unwrap();
        assert!(team.is_bad);
        assert_eq!(team.priority, crate::model::TeamPriority::PopulateRegion);
        Ok(())
    }
}

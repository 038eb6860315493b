//! In-memory implementations of the external collaborator traits, backing
//! unit tests and whole-region simulation runs. State lives behind plain
//! mutexes; watches are modeled as bumped version channels that wake
//! subscribers, who then re-read and diff exactly like keyspace watchers do
//! against the real store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Mutex};

use crate::external::{
    decode_server_list_value, encode_server_list_value, ClusterController,
    ExclusionLists, FailureMonitor, HealthyZone, InitializeStorageReply,
    InitializeStorageRequest, Key, KeyRange, KeyServersPage, RecruitStorageReply,
    RecruitStorageRequest, ServerListEntry, ShardAssignment, ShardTeam, ShardTracker,
    StorageClient, StorageInterface, StorageMetrics, StoreType, SystemKeyspace,
    WorkerClient, WorkerDescriptor,
};
use crate::model::{ProcessId, Region, ServerId, Version};
use crate::utils::BallastError;

use async_trait::async_trait;

use rangemap::RangeMap;

use tokio::sync::watch;

/// A bump-counter change signal. `changed()` resolves on the next bump after
/// subscription; callers re-read state afterwards, so a bump racing the
/// subscription is only ever a spurious extra wakeup for them.
#[derive(Debug)]
struct Signal {
    tx: watch::Sender<u64>,
}

impl Signal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Signal { tx }
    }

    fn bump(&self) {
        self.tx.send_modify(|v| *v += 1);
    }

    async fn changed(&self) {
        let mut rx = self.tx.subscribe();
        // error means the keyspace itself was dropped; nothing left to see
        let _ = rx.changed().await;
    }
}

/// Versions advance by a fixed stride per mutation, so version-margin logic
/// has something realistic to compare against.
const VERSION_STRIDE: Version = 100_000;

#[derive(Default)]
struct KeyspaceState {
    /// Stored in encoded form so the value codec is exercised on every read.
    server_list: BTreeMap<ServerId, Vec<u8>>,

    /// Key-server mapping, kept sorted by range begin.
    shards: Vec<ShardAssignment>,

    workers: Vec<WorkerDescriptor>,
    exclusions: ExclusionLists,
    healthy_zone: Option<HealthyZone>,
    dd_mode: i64,
    wiggle_switch: bool,
    wiggle_pids: HashMap<Region, ProcessId>,
    dc_replicas: HashMap<String, usize>,

    /// Servers the cluster would refuse to remove yet (still have data).
    not_removable: HashMap<ServerId, bool>,

    version: Version,
}

/// In-process system keyspace.
pub struct MemoryKeyspace {
    state: Mutex<KeyspaceState>,
    exclusions_signal: Signal,
    healthy_zone_signal: Signal,
    wiggle_switch_signal: Signal,
    wiggle_pid_primary_signal: Signal,
    wiggle_pid_remote_signal: Signal,
    snapshot_signal: Signal,
}

impl Default for MemoryKeyspace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKeyspace {
    pub fn new() -> Self {
        let state = KeyspaceState {
            dd_mode: 1,
            version: VERSION_STRIDE,
            ..Default::default()
        };
        MemoryKeyspace {
            state: Mutex::new(state),
            exclusions_signal: Signal::new(),
            healthy_zone_signal: Signal::new(),
            wiggle_switch_signal: Signal::new(),
            wiggle_pid_primary_signal: Signal::new(),
            wiggle_pid_remote_signal: Signal::new(),
            snapshot_signal: Signal::new(),
        }
    }

    fn wiggle_signal(&self, region: Region) -> &Signal {
        match region {
            Region::Primary => &self.wiggle_pid_primary_signal,
            Region::Remote => &self.wiggle_pid_remote_signal,
        }
    }

    /// Registers (or re-registers) a storage server in the server list.
    pub fn register_server(&self, entry: &ServerListEntry) -> Result<(), BallastError> {
        let raw = encode_server_list_value(entry)?;
        let mut state = self.state.lock().unwrap();
        state.server_list.insert(entry.interface.id, raw);
        state.version += VERSION_STRIDE;
        Ok(())
    }

    pub fn set_shards(&self, shards: Vec<ShardAssignment>) {
        let mut state = self.state.lock().unwrap();
        state.shards = shards;
        state.shards.sort_by(|a, b| a.range.begin.cmp(&b.range.begin));
        state.version += VERSION_STRIDE;
    }

    pub fn set_workers(&self, workers: Vec<WorkerDescriptor>) {
        let mut state = self.state.lock().unwrap();
        state.workers = workers;
        state.version += VERSION_STRIDE;
    }

    pub fn set_exclusions(&self, lists: ExclusionLists) {
        {
            let mut state = self.state.lock().unwrap();
            state.exclusions = lists;
            state.version += VERSION_STRIDE;
        }
        self.exclusions_signal.bump();
    }

    pub fn set_healthy_zone(&self, zone: Option<HealthyZone>) {
        {
            let mut state = self.state.lock().unwrap();
            state.healthy_zone = zone;
            state.version += VERSION_STRIDE;
        }
        self.healthy_zone_signal.bump();
    }

    pub fn set_dd_mode(&self, mode: i64) {
        let mut state = self.state.lock().unwrap();
        state.dd_mode = mode;
        state.version += VERSION_STRIDE;
    }

    pub fn set_wiggle_switch(&self, on: bool) {
        {
            let mut state = self.state.lock().unwrap();
            state.wiggle_switch = on;
            state.version += VERSION_STRIDE;
        }
        self.wiggle_switch_signal.bump();
    }

    pub fn set_not_removable(&self, id: ServerId, pinned: bool) {
        let mut state = self.state.lock().unwrap();
        state.not_removable.insert(id, pinned);
    }

    /// Lets tests push the read version forward past removal safety margins.
    pub fn advance_version(&self, by: Version) {
        let mut state = self.state.lock().unwrap();
        state.version += by;
    }

    pub fn trigger_snapshot(&self) {
        self.snapshot_signal.bump();
    }
}

#[async_trait]
impl SystemKeyspace for MemoryKeyspace {
    async fn read_server_list(&self) -> Result<Vec<ServerListEntry>, BallastError> {
        let raws: Vec<Vec<u8>> = {
            let state = self.state.lock().unwrap();
            state.server_list.values().cloned().collect()
        };
        let mut entries = Vec::with_capacity(raws.len());
        for raw in raws {
            entries.push(decode_server_list_value(&raw)?);
        }
        Ok(entries)
    }

    async fn read_key_servers(
        &self,
        begin: &Key,
        limit: usize,
    ) -> Result<KeyServersPage, BallastError> {
        let state = self.state.lock().unwrap();
        let mut page = KeyServersPage::default();
        for shard in state.shards.iter().filter(|s| s.range.begin >= *begin) {
            if page.assignments.len() >= limit {
                page.next = Some(shard.range.begin.clone());
                break;
            }
            page.assignments.push(shard.clone());
        }
        Ok(page)
    }

    async fn read_workers(&self) -> Result<Vec<WorkerDescriptor>, BallastError> {
        Ok(self.state.lock().unwrap().workers.clone())
    }

    async fn read_exclusions(&self) -> Result<ExclusionLists, BallastError> {
        Ok(self.state.lock().unwrap().exclusions.clone())
    }

    async fn watch_exclusions(&self) -> Result<(), BallastError> {
        self.exclusions_signal.changed().await;
        Ok(())
    }

    async fn read_healthy_zone(&self) -> Result<Option<HealthyZone>, BallastError> {
        Ok(self.state.lock().unwrap().healthy_zone.clone())
    }

    async fn watch_healthy_zone(&self) -> Result<(), BallastError> {
        self.healthy_zone_signal.changed().await;
        Ok(())
    }

    async fn clear_healthy_zone(&self) -> Result<(), BallastError> {
        self.set_healthy_zone(None);
        Ok(())
    }

    async fn read_dd_mode(&self) -> Result<i64, BallastError> {
        Ok(self.state.lock().unwrap().dd_mode)
    }

    async fn read_wiggle_switch(&self) -> Result<bool, BallastError> {
        Ok(self.state.lock().unwrap().wiggle_switch)
    }

    async fn watch_wiggle_switch(&self) -> Result<(), BallastError> {
        self.wiggle_switch_signal.changed().await;
        Ok(())
    }

    async fn read_wiggling_pid(
        &self,
        region: Region,
    ) -> Result<Option<ProcessId>, BallastError> {
        Ok(self.state.lock().unwrap().wiggle_pids.get(&region).cloned())
    }

    async fn write_wiggling_pid(
        &self,
        region: Region,
        pid: &ProcessId,
    ) -> Result<(), BallastError> {
        {
            let mut state = self.state.lock().unwrap();
            state.wiggle_pids.insert(region, pid.clone());
            state.version += VERSION_STRIDE;
        }
        self.wiggle_signal(region).bump();
        Ok(())
    }

    async fn watch_wiggling_pid(&self, region: Region) -> Result<(), BallastError> {
        self.wiggle_signal(region).changed().await;
        Ok(())
    }

    async fn read_dc_replicas(&self, dc: &str) -> Result<Option<usize>, BallastError> {
        Ok(self.state.lock().unwrap().dc_replicas.get(dc).copied())
    }

    async fn write_dc_replicas(
        &self,
        dc: &str,
        replicas: usize,
    ) -> Result<(), BallastError> {
        let mut state = self.state.lock().unwrap();
        state.dc_replicas.insert(dc.to_string(), replicas);
        state.version += VERSION_STRIDE;
        Ok(())
    }

    async fn remove_server_entry(&self, id: ServerId) -> Result<(), BallastError> {
        let mut state = self.state.lock().unwrap();
        state.server_list.remove(&id);
        state.version += VERSION_STRIDE;
        Ok(())
    }

    async fn can_remove_server(&self, id: ServerId) -> Result<bool, BallastError> {
        let state = self.state.lock().unwrap();
        Ok(!state.not_removable.get(&id).copied().unwrap_or(false))
    }

    async fn current_version(&self) -> Result<Version, BallastError> {
        Ok(self.state.lock().unwrap().version)
    }

    async fn watch_snapshot_trigger(&self) -> Result<(), BallastError> {
        self.snapshot_signal.changed().await;
        Ok(())
    }
}

/// What one key range maps to inside the in-memory shard tracker.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
struct ShardSlot {
    primary: Vec<ServerId>,
    remote: Vec<ServerId>,
    bytes: i64,
}

/// In-process shard tracker over a key-range map.
#[derive(Default)]
pub struct MemoryShardTracker {
    map: Mutex<RangeMap<Key, ShardSlot>>,
}

impl MemoryShardTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a range to the given primary (and optional remote) team.
    pub fn assign(
        &self,
        range: &KeyRange,
        primary: &[ServerId],
        remote: &[ServerId],
        bytes: i64,
    ) {
        if range.is_empty() {
            return;
        }
        let mut primary = primary.to_vec();
        let mut remote = remote.to_vec();
        primary.sort();
        remote.sort();
        self.map.lock().unwrap().insert(
            range.begin.clone()..range.end.clone(),
            ShardSlot {
                primary,
                remote,
                bytes,
            },
        );
    }

    /// Strips a server out of every slot, as if its shards had drained to
    /// the surviving members.
    pub fn remove_server(&self, id: ServerId) {
        let mut map = self.map.lock().unwrap();
        let slots: Vec<(Range<Key>, ShardSlot)> = map
            .iter()
            .map(|(range, slot)| (range.clone(), slot.clone()))
            .collect();
        for (range, mut slot) in slots {
            if slot.primary.contains(&id) || slot.remote.contains(&id) {
                slot.primary.retain(|&s| s != id);
                slot.remote.retain(|&s| s != id);
                map.insert(range, slot);
            }
        }
    }
}

#[async_trait]
impl ShardTracker for MemoryShardTracker {
    fn shards_for_team(&self, servers: &[ServerId], primary: bool) -> Vec<KeyRange> {
        let mut team = servers.to_vec();
        team.sort();
        let map = self.map.lock().unwrap();
        map.iter()
            .filter(|(_, slot)| {
                if primary {
                    slot.primary == team
                } else {
                    slot.remote == team
                }
            })
            .map(|(range, _)| KeyRange::new(&range.start, &range.end))
            .collect()
    }

    fn teams_for_shard(&self, range: &KeyRange) -> Vec<ShardTeam> {
        let span = range.begin.clone()..range.end.clone();
        let map = self.map.lock().unwrap();
        let mut teams = Vec::new();
        for (_, slot) in map.overlapping(&span) {
            teams.push(ShardTeam {
                servers: slot.primary.clone(),
                primary: true,
            });
            if !slot.remote.is_empty() {
                teams.push(ShardTeam {
                    servers: slot.remote.clone(),
                    primary: false,
                });
            }
        }
        teams
    }

    fn shard_count(&self, server: ServerId) -> usize {
        let map = self.map.lock().unwrap();
        map.iter()
            .filter(|(_, slot)| {
                slot.primary.contains(&server) || slot.remote.contains(&server)
            })
            .count()
    }

    async fn shard_bytes(&self, range: &KeyRange) -> Result<i64, BallastError> {
        let span = range.begin.clone()..range.end.clone();
        let map = self.map.lock().unwrap();
        Ok(map.overlapping(&span).map(|(_, slot)| slot.bytes).sum())
    }
}

#[derive(Default)]
struct ClusterState {
    offers: VecDeque<WorkerDescriptor>,
    failed: HashMap<SocketAddr, bool>,
    metrics: HashMap<ServerId, StorageMetrics>,
    store_types: HashMap<ServerId, StoreType>,
}

/// In-process stand-in for the cluster controller, worker fleet, storage
/// servers, and failure monitor, wired to a `MemoryKeyspace` so that
/// freshly initialized storage servers register themselves the way real
/// ones do.
pub struct MemoryCluster {
    keyspace: Arc<MemoryKeyspace>,
    state: Mutex<ClusterState>,
    offers_signal: Signal,
    failure_signal: Signal,
}

impl MemoryCluster {
    pub fn new(keyspace: Arc<MemoryKeyspace>) -> Self {
        MemoryCluster {
            keyspace,
            state: Mutex::new(ClusterState::default()),
            offers_signal: Signal::new(),
            failure_signal: Signal::new(),
        }
    }

    /// Makes a worker available for recruitment.
    pub fn offer_worker(&self, worker: WorkerDescriptor) {
        self.state.lock().unwrap().offers.push_back(worker);
        self.offers_signal.bump();
    }

    /// Flips a process's failure-monitor state.
    pub fn set_failed(&self, address: SocketAddr, failed: bool) {
        self.state.lock().unwrap().failed.insert(address, failed);
        self.failure_signal.bump();
    }

    pub fn set_metrics(&self, id: ServerId, metrics: StorageMetrics) {
        self.state.lock().unwrap().metrics.insert(id, metrics);
    }

    pub fn set_store_type(&self, id: ServerId, store_type: StoreType) {
        self.state.lock().unwrap().store_types.insert(id, store_type);
    }

    fn healthy_metrics() -> StorageMetrics {
        StorageMetrics {
            capacity_bytes: 1 << 40,
            available_bytes: (1 << 40) - (1 << 33),
            load_bytes: 1 << 33,
            version_lag: 0,
        }
    }
}

#[async_trait]
impl ClusterController for MemoryCluster {
    async fn recruit_storage(
        &self,
        req: RecruitStorageRequest,
    ) -> Result<RecruitStorageReply, BallastError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let found = state.offers.iter().position(|w| {
                    let excluded = req
                        .excluded_addresses
                        .iter()
                        .any(|e| e.matches(w.address));
                    let in_dc = req.included_dcs.is_empty()
                        || w.locality
                            .dc_id()
                            .map(|dc| req.included_dcs.iter().any(|d| d == dc))
                            .unwrap_or(false);
                    !excluded && in_dc
                });
                if let Some(idx) = found {
                    let worker = state.offers.remove(idx).unwrap();
                    return Ok(RecruitStorageReply { worker });
                }
            }
            self.offers_signal.changed().await;
        }
    }
}

#[async_trait]
impl WorkerClient for MemoryCluster {
    async fn initialize_storage(
        &self,
        worker: &WorkerDescriptor,
        req: InitializeStorageRequest,
    ) -> Result<InitializeStorageReply, BallastError> {
        let interface = StorageInterface {
            id: req.interface_id,
            address: worker.address,
            secondary_address: None,
            locality: worker.locality.clone(),
            pair_of: req.tss_pair.map(|(pair, _)| pair),
        };
        self.set_store_type(req.interface_id, req.store_type);
        self.set_metrics(req.interface_id, Self::healthy_metrics());

        // a real storage server registers itself once its store is durable
        let added_version = self.keyspace.current_version().await? + 1;
        self.keyspace.register_server(&ServerListEntry {
            interface: interface.clone(),
            class: worker.class,
            added_version,
        })?;

        Ok(InitializeStorageReply {
            interface,
            added_version,
        })
    }
}

#[async_trait]
impl StorageClient for MemoryCluster {
    async fn get_metrics(
        &self,
        interface: &StorageInterface,
    ) -> Result<StorageMetrics, BallastError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .metrics
            .get(&interface.id)
            .copied()
            .unwrap_or_else(Self::healthy_metrics))
    }

    async fn get_store_type(
        &self,
        interface: &StorageInterface,
    ) -> Result<StoreType, BallastError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .store_types
            .get(&interface.id)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl FailureMonitor for MemoryCluster {
    async fn wait_state(
        &self,
        address: SocketAddr,
        failed: bool,
    ) -> Result<(), BallastError> {
        loop {
            {
                let state = self.state.lock().unwrap();
                if state.failed.get(&address).copied().unwrap_or(false) == failed {
                    return Ok(());
                }
            }
            self.failure_signal.changed().await;
        }
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;
    use crate::model::{Locality, LOC_ZONEID};
    use crate::external::ProcessClass;

    fn interface(n: u64, addr: &str, zone: &str) -> StorageInterface {
        StorageInterface {
            id: ServerId::from(n),
            address: addr.parse().unwrap(),
            secondary_address: None,
            locality: Locality::new().with(LOC_ZONEID, zone),
            pair_of: None,
        }
    }

    #[tokio::test]
    async fn keyspace_server_list_roundtrip() -> Result<(), BallastError> {
        let ks = MemoryKeyspace::new();
        ks.register_server(&ServerListEntry {
            interface: interface(1, "10.0.0.1:4500", "z0"),
            class: ProcessClass::Storage,
            added_version: 7,
        })?;
        let list = ks.read_server_list().await?;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].interface.id, ServerId::from(1));

        ks.remove_server_entry(ServerId::from(1)).await?;
        assert!(ks.read_server_list().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn keyspace_key_server_paging() -> Result<(), BallastError> {
        let ks = MemoryKeyspace::new();
        let mut shards = Vec::new();
        for i in 0..5 {
            shards.push(ShardAssignment {
                range: KeyRange::new(&format!("k{}", i), &format!("k{}", i + 1)),
                src: vec![ServerId::from(i as u64)],
                dest: vec![],
            });
        }
        ks.set_shards(shards);

        let page = ks.read_key_servers(&"".to_string(), 3).await?;
        assert_eq!(page.assignments.len(), 3);
        let next = page.next.unwrap();
        let page = ks.read_key_servers(&next, 3).await?;
        assert_eq!(page.assignments.len(), 2);
        assert!(page.next.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn shard_tracker_lookup() -> Result<(), BallastError> {
        let tracker = MemoryShardTracker::new();
        let team: Vec<ServerId> = vec![1, 2, 3].into_iter().map(ServerId::from).collect();
        tracker.assign(&KeyRange::new("a", "m"), &team, &[], 4096);
        tracker.assign(&KeyRange::new("m", "z"), &team, &[], 1024);

        assert_eq!(tracker.shards_for_team(&team, true).len(), 2);
        assert_eq!(tracker.shard_count(ServerId::from(2)), 2);
        assert_eq!(
            tracker.shard_bytes(&KeyRange::new("a", "z")).await?,
            5120
        );

        tracker.remove_server(ServerId::from(2));
        assert_eq!(tracker.shard_count(ServerId::from(2)), 0);
        assert!(tracker.shards_for_team(&team, true).is_empty());

        let teams = tracker.teams_for_shard(&KeyRange::new("b", "c"));
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].servers.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn cluster_recruit_and_initialize() -> Result<(), BallastError> {
        let ks = Arc::new(MemoryKeyspace::new());
        let cluster = MemoryCluster::new(ks.clone());
        cluster.offer_worker(WorkerDescriptor {
            address: "10.0.0.9:4500".parse()?,
            locality: Locality::new().with(LOC_ZONEID, "z9").with("dcid", "dc0"),
            class: ProcessClass::Storage,
        });

        let reply = cluster
            .recruit_storage(RecruitStorageRequest::default())
            .await?;
        assert_eq!(reply.worker.address, "10.0.0.9:4500".parse()?);

        let init = cluster
            .initialize_storage(
                &reply.worker,
                InitializeStorageRequest {
                    store_type: StoreType::SsdBTree,
                    seed_tag: None,
                    req_id: ServerId::from(100),
                    interface_id: ServerId::from(100),
                    tss_pair: None,
                },
            )
            .await?;
        assert_eq!(init.interface.id, ServerId::from(100));

        // the new server registered itself
        let list = ks.read_server_list().await?;
        assert_eq!(list.len(), 1);
        Ok(())
    }
}

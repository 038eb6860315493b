//! The transactional system keyspace surface the placement controller reads,
//! watches, and (sparsely) writes. Values crossing this boundary are encoded
//! with MessagePack.

use crate::external::{
    ExclusionKey, Key, KeyRange, ProcessClass, StorageInterface, WorkerDescriptor,
};
use crate::model::{Locality, MachineId, ProcessId, Region, ServerId, Version};
use crate::utils::BallastError;

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

/// One entry of the server list: a storage server's registered interface and
/// the process class of its hosting worker.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ServerListEntry {
    pub interface: StorageInterface,
    pub class: ProcessClass,
    pub added_version: Version,
}

/// Encodes a server-list entry the way it is stored in the keyspace.
pub fn encode_server_list_value(entry: &ServerListEntry) -> Result<Vec<u8>, BallastError> {
    Ok(rmp_serde::to_vec(entry)?)
}

/// Decodes a server-list entry read from the keyspace.
pub fn decode_server_list_value(raw: &[u8]) -> Result<ServerListEntry, BallastError> {
    Ok(rmp_serde::from_slice(raw)?)
}

/// One shard of the key-server mapping: its range, the servers currently
/// holding it, and (mid-move) the servers it is headed to.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub range: KeyRange,
    pub src: Vec<ServerId>,
    pub dest: Vec<ServerId>,
}

/// One page of a key-server scan; `next` is the continuation key when the
/// scan could not finish within a single transaction.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct KeyServersPage {
    pub assignments: Vec<ShardAssignment>,
    pub next: Option<Key>,
}

/// A locality selector from the excluded/failed locality lists, matching
/// every process whose locality carries `key = value`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct LocalityMatch {
    pub key: String,
    pub value: String,
}

impl LocalityMatch {
    pub fn matches(&self, locality: &Locality) -> bool {
        locality.get(&self.key) == Some(self.value.as_str())
    }
}

/// The four operator-maintained exclusion lists.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct ExclusionLists {
    pub excluded_addresses: Vec<ExclusionKey>,
    pub failed_addresses: Vec<ExclusionKey>,
    pub excluded_localities: Vec<LocalityMatch>,
    pub failed_localities: Vec<LocalityMatch>,
}

/// Maintenance-zone marker. The original key overloads one string value to
/// also mean "ignore all storage failures"; the enum keeps both behaviors
/// but makes the overload explicit at the codec boundary.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum HealthyZone {
    /// Failures of servers in this zone are ignored until the version passes.
    Zone {
        zone: MachineId,
        until_version: Version,
    },

    /// Ignore every storage failure (and halt failure-triggered distribution).
    IgnoreFailures,
}

/// Read/watch/write access to the system keyspace. One implementation wraps
/// the real transactional store; `external::memory` provides an in-process
/// one for tests and simulation.
///
/// Watch methods resolve once the corresponding value may have changed since
/// the call; callers are expected to re-read and diff.
#[async_trait]
pub trait SystemKeyspace: Send + Sync {
    /// Reads the full server list, testing servers included.
    async fn read_server_list(&self) -> Result<Vec<ServerListEntry>, BallastError>;

    /// Reads one page of the key-server mapping starting at `begin`.
    async fn read_key_servers(
        &self,
        begin: &Key,
        limit: usize,
    ) -> Result<KeyServersPage, BallastError>;

    /// Reads the worker process directory (used to resolve locality-based
    /// exclusions to addresses).
    async fn read_workers(&self) -> Result<Vec<WorkerDescriptor>, BallastError>;

    async fn read_exclusions(&self) -> Result<ExclusionLists, BallastError>;
    async fn watch_exclusions(&self) -> Result<(), BallastError>;

    async fn read_healthy_zone(&self) -> Result<Option<HealthyZone>, BallastError>;
    async fn watch_healthy_zone(&self) -> Result<(), BallastError>;
    async fn clear_healthy_zone(&self) -> Result<(), BallastError>;

    /// Data-distribution mode flag; zero disables distribution entirely.
    async fn read_dd_mode(&self) -> Result<i64, BallastError>;

    /// Perpetual storage wiggle switch.
    async fn read_wiggle_switch(&self) -> Result<bool, BallastError>;
    async fn watch_wiggle_switch(&self) -> Result<(), BallastError>;

    /// Currently wiggling process id of a region.
    async fn read_wiggling_pid(
        &self,
        region: Region,
    ) -> Result<Option<ProcessId>, BallastError>;
    async fn write_wiggling_pid(
        &self,
        region: Region,
        pid: &ProcessId,
    ) -> Result<(), BallastError>;
    async fn watch_wiggling_pid(&self, region: Region) -> Result<(), BallastError>;

    /// Per-datacenter replica target.
    async fn read_dc_replicas(&self, dc: &str) -> Result<Option<usize>, BallastError>;
    async fn write_dc_replicas(&self, dc: &str, replicas: usize)
        -> Result<(), BallastError>;

    /// Deletes a storage server's registration once its shards have drained.
    async fn remove_server_entry(&self, id: ServerId) -> Result<(), BallastError>;

    /// Whether the cluster-side preconditions for removing a server hold.
    async fn can_remove_server(&self, id: ServerId) -> Result<bool, BallastError>;

    /// Current read version.
    async fn current_version(&self) -> Result<Version, BallastError>;

    /// Resolves when an external writer pokes the debug-snapshot trigger key.
    async fn watch_snapshot_trigger(&self) -> Result<(), BallastError>;
}

#[cfg(test)]
mod keyspace_tests {
    use super::*;
    use crate::model::LOC_ZONEID;

    #[test]
    fn server_list_value_codec() -> Result<(), BallastError> {
        let entry = ServerListEntry {
            interface: StorageInterface {
                id: ServerId::from(42),
                address: "10.1.2.3:4500".parse()?,
                secondary_address: None,
                locality: Locality::new().with(LOC_ZONEID, "z1"),
                pair_of: None,
            },
            class: ProcessClass::Storage,
            added_version: 1000,
        };
        let raw = encode_server_list_value(&entry)?;
        let back = decode_server_list_value(&raw)?;
        assert_eq!(back, entry);
        Ok(())
    }

    #[test]
    fn locality_match() {
        let sel = LocalityMatch {
            key: LOC_ZONEID.to_string(),
            value: "z2".to_string(),
        };
        assert!(sel.matches(&Locality::new().with(LOC_ZONEID, "z2")));
        assert!(!sel.matches(&Locality::new().with(LOC_ZONEID, "z3")));
        assert!(!sel.matches(&Locality::new()));
    }
}

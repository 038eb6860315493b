//! Request, reply, and event types exchanged with external collaborators:
//! the relocation queue, the cluster controller, and workers being recruited.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::model::{Locality, ServerId, TeamPriority, Version};

use serde::{Deserialize, Serialize};

/// Keys are opaque strings.
pub type Key = String;

/// Sentinel sorting after every real key.
pub const END_KEY: &str = "\u{10FFFF}";

/// Begin-inclusive, end-exclusive range of keys.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Serialize,
    Deserialize,
)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl KeyRange {
    pub fn new(begin: &str, end: &str) -> Self {
        KeyRange {
            begin: begin.to_string(),
            end: end.to_string(),
        }
    }

    /// The whole keyspace.
    pub fn all() -> Self {
        KeyRange::new("", END_KEY)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.begin.as_str() <= key && key < self.end.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

/// Canonical exclusion key: a full `(ip, port)` address, or an ip wildcard
/// matching every port on the host.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub struct ExclusionKey {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl ExclusionKey {
    pub fn wildcard(ip: IpAddr) -> Self {
        ExclusionKey { ip, port: None }
    }

    pub fn matches(&self, addr: SocketAddr) -> bool {
        self.ip == addr.ip() && self.port.map(|p| p == addr.port()).unwrap_or(true)
    }
}

impl From<SocketAddr> for ExclusionKey {
    fn from(addr: SocketAddr) -> Self {
        ExclusionKey {
            ip: addr.ip(),
            port: Some(addr.port()),
        }
    }
}

impl fmt::Display for ExclusionKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.ip, port),
            None => write!(f, "{}", self.ip),
        }
    }
}

/// Process class hint: what role the hosting process prefers to run.
#[derive(
    Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum ProcessClass {
    #[default]
    Unset,
    Storage,
    Transaction,
    Log,
    Stateless,
    Test,
}

/// How well a process class fits running a storage server; declaration order
/// is best-to-worst.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum StorageFitness {
    Best,
    Good,
    Unset,
    Worst,
}

impl ProcessClass {
    pub fn storage_fitness(&self) -> StorageFitness {
        match self {
            ProcessClass::Storage => StorageFitness::Best,
            ProcessClass::Test => StorageFitness::Good,
            ProcessClass::Unset => StorageFitness::Unset,
            ProcessClass::Transaction | ProcessClass::Log | ProcessClass::Stateless => {
                StorageFitness::Worst
            }
        }
    }

    /// A team of only best-fitness members is "optimal".
    pub fn fits_storage(&self) -> bool {
        self.storage_fitness() <= StorageFitness::Unset
    }
}

/// Storage engine type backing a storage server. A server's store type never
/// changes; replacing it means destroying the server and recruiting a new
/// one on the same address.
#[derive(
    Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub enum StoreType {
    Memory,
    #[default]
    SsdBTree,
    SsdRocks,
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            StoreType::Memory => "memory",
            StoreType::SsdBTree => "ssd-btree",
            StoreType::SsdRocks => "ssd-rocks",
        };
        write!(f, "{}", s)
    }
}

/// Last-known network interface of a storage server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct StorageInterface {
    pub id: ServerId,
    pub address: SocketAddr,
    pub secondary_address: Option<SocketAddr>,
    pub locality: Locality,

    /// Set only on testing servers: the regular server this one shadows.
    pub pair_of: Option<ServerId>,
}

impl StorageInterface {
    pub fn is_testing(&self) -> bool {
        self.pair_of.is_some()
    }
}

/// Storage metrics as last reported by a server.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub struct StorageMetrics {
    pub capacity_bytes: i64,
    pub available_bytes: i64,
    pub load_bytes: i64,

    /// How far the server's durable version trails the cluster.
    pub version_lag: i64,
}

/// Shard relocation request emitted onto the relocation queue.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RelocateShard {
    pub keys: KeyRange,
    pub priority: TeamPriority,
}

/// A worker process the cluster controller offered for recruitment.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub address: SocketAddr,
    pub locality: Locality,
    pub class: ProcessClass,
}

/// Candidate-worker query sent to the cluster controller.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RecruitStorageRequest {
    pub excluded_addresses: Vec<ExclusionKey>,
    pub included_dcs: Vec<String>,

    /// Set when no healthy team exists; the controller should answer even
    /// with otherwise unattractive workers.
    pub critical: bool,
}

/// Cluster controller's recruitment answer.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RecruitStorageReply {
    pub worker: WorkerDescriptor,
}

/// Request asking a worker to start a storage server.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct InitializeStorageRequest {
    pub store_type: StoreType,
    pub seed_tag: Option<u64>,
    pub req_id: ServerId,
    pub interface_id: ServerId,

    /// For testing-server recruitment: the paired server's id and the
    /// version at which the pair was created.
    pub tss_pair: Option<(ServerId, Version)>,
}

/// Worker's answer to `InitializeStorageRequest`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct InitializeStorageReply {
    pub interface: StorageInterface,
    pub added_version: Version,
}

#[cfg(test)]
mod events_tests {
    use super::*;

    #[test]
    fn key_range_contains() {
        let range = KeyRange::new("b", "f");
        assert!(range.contains("b"));
        assert!(range.contains("c"));
        assert!(!range.contains("f"));
        assert!(!range.contains("a"));
        assert!(KeyRange::all().contains("anything"));
    }

    #[test]
    fn key_range_overlap() {
        let ab = KeyRange::new("a", "b");
        let bc = KeyRange::new("b", "c");
        let ac = KeyRange::new("a", "c");
        assert!(!ab.overlaps(&bc));
        assert!(ab.overlaps(&ac));
        assert!(bc.overlaps(&ac));
    }

    #[test]
    fn exclusion_key_matching() {
        let addr: SocketAddr = "10.0.0.1:4500".parse().unwrap();
        let exact = ExclusionKey::from(addr);
        let wild = ExclusionKey::wildcard(addr.ip());
        let other: SocketAddr = "10.0.0.1:4501".parse().unwrap();
        assert!(exact.matches(addr));
        assert!(!exact.matches(other));
        assert!(wild.matches(addr));
        assert!(wild.matches(other));
    }

    #[test]
    fn storage_fitness_order() {
        assert!(ProcessClass::Storage.fits_storage());
        assert!(ProcessClass::Unset.fits_storage());
        assert!(!ProcessClass::Log.fits_storage());
        assert!(
            ProcessClass::Storage.storage_fitness()
                < ProcessClass::Stateless.storage_fitness()
        );
    }
}

//! External collaborator surfaces: typed events, the system keyspace, the
//! shard tracker, the cluster controller, workers, and the failure monitor.
//! The controller consumes these through object-safe traits so that real
//! cluster plumbing and the in-memory test environment are interchangeable.

mod events;
mod keyspace;
pub mod memory;

pub use events::{
    ExclusionKey, InitializeStorageReply, InitializeStorageRequest, Key, KeyRange,
    ProcessClass, RecruitStorageReply, RecruitStorageRequest, RelocateShard,
    StorageFitness, StorageInterface, StorageMetrics, StoreType, WorkerDescriptor,
    END_KEY,
};
pub use keyspace::{
    decode_server_list_value, encode_server_list_value, ExclusionLists, HealthyZone,
    KeyServersPage, LocalityMatch, ServerListEntry, ShardAssignment, SystemKeyspace,
};

use std::net::SocketAddr;

use crate::model::ServerId;
use crate::utils::BallastError;

use async_trait::async_trait;

/// One side of a shard's current team assignment as the shard tracker sees
/// it.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShardTeam {
    pub servers: Vec<ServerId>,
    pub primary: bool,
}

/// The shard tracker knows which key ranges every team currently serves.
/// The synchronous lookups are answered from its in-memory map; only byte
/// sizes require asking storage servers.
#[async_trait]
pub trait ShardTracker: Send + Sync {
    /// Key ranges currently assigned to the given (sorted) server team.
    fn shards_for_team(&self, servers: &[ServerId], primary: bool) -> Vec<KeyRange>;

    /// All teams (both regions) currently serving any part of the range.
    fn teams_for_shard(&self, range: &KeyRange) -> Vec<ShardTeam>;

    /// Number of shards currently placed on a server.
    fn shard_count(&self, server: ServerId) -> usize;

    /// Total bytes held in a range.
    async fn shard_bytes(&self, range: &KeyRange) -> Result<i64, BallastError>;
}

/// The cluster controller hands out candidate workers for recruitment.
#[async_trait]
pub trait ClusterController: Send + Sync {
    async fn recruit_storage(
        &self,
        req: RecruitStorageRequest,
    ) -> Result<RecruitStorageReply, BallastError>;
}

/// Direct line to a candidate worker for starting a storage server.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn initialize_storage(
        &self,
        worker: &WorkerDescriptor,
        req: InitializeStorageRequest,
    ) -> Result<InitializeStorageReply, BallastError>;
}

/// Queries answered by running storage servers.
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn get_metrics(
        &self,
        interface: &StorageInterface,
    ) -> Result<StorageMetrics, BallastError>;

    async fn get_store_type(
        &self,
        interface: &StorageInterface,
    ) -> Result<StoreType, BallastError>;
}

/// The cluster-wide failure monitor.
#[async_trait]
pub trait FailureMonitor: Send + Sync {
    /// Resolves once the observed failure state of the address equals
    /// `failed`. Resolves immediately if it already does.
    async fn wait_state(&self, address: SocketAddr, failed: bool)
        -> Result<(), BallastError>;
}

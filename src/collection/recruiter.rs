//! Storage-server recruitment: querying the cluster controller for
//! candidate workers, initializing storage on them, and the rendezvous
//! protocol that pairs each new testing server with a freshly recruited
//! regular server in the same failure domain.

use std::collections::{BTreeSet, HashSet};
use std::net::SocketAddr;

use crate::collection::{CollectionEnv, TeamCollection, TrackEvent};
use crate::external::{
    ExclusionKey, InitializeStorageRequest, ProcessClass, RecruitStorageRequest,
    StorageInterface, StoreType, WorkerDescriptor,
};
use crate::model::{ExclusionStatus, ServerId, Version};
use crate::utils::BallastError;

use rand::Rng;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// A successfully initialized server, ready to enter the registry.
#[derive(Debug, Clone)]
pub(crate) struct AddedServer {
    pub interface: StorageInterface,
    pub class: ProcessClass,
    pub added_version: Version,
}

/// The half-made testing-server pairing: the testing side is recruited and
/// waiting for a regular server in the same datacenter/data hall to hand it
/// a pair id and version.
pub(crate) struct PairRendezvous {
    pub dc: Option<String>,
    pub data_hall: Option<String>,
    pub pair_tx: oneshot::Sender<(ServerId, Version)>,
    pub tss_done_rx: oneshot::Receiver<bool>,
    pub task: JoinHandle<()>,
}

impl PairRendezvous {
    /// Whether a candidate worker lives in the same failure domain as the
    /// waiting testing server.
    pub fn in_data_zone(&self, worker: &WorkerDescriptor) -> bool {
        worker.locality.dc_id().map(|s| s.to_string()) == self.dc
            && worker.locality.data_hall().map(|s| s.to_string()) == self.data_hall
    }

    /// Cancels the pairing; the testing-server task sees its channel close
    /// and reports a failed recruitment.
    pub fn cancel(self) {
        drop(self.pair_tx);
    }
}

/// Supervisor-held recruitment state.
#[derive(Default)]
pub(crate) struct RecruiterState {
    /// Addresses with an `InitializeStorage` in flight.
    pub in_flight: HashSet<SocketAddr>,

    /// The last candidate query sent; a changed query replaces the fetch.
    pub last_request: Option<RecruitStorageRequest>,
    pub candidate_task: Option<JoinHandle<()>>,

    pub rendezvous: Option<PairRendezvous>,

    /// Testing-server recruitments in flight (the rendezvous side).
    pub testing_in_progress: usize,

    /// A surplus/zero-healthy check is already scheduled.
    pub pending_check: bool,
}

impl RecruiterState {
    pub fn is_testing_recruiting(&self) -> bool {
        self.rendezvous.is_some()
    }
}

impl TeamCollection {
    /// Builds the candidate query: the union of excluded addresses (status
    /// map, exclusion map, and requests in flight), the region's
    /// datacenters, and the criticality bit.
    pub(crate) fn recruitment_request(
        &self,
        in_flight: &HashSet<SocketAddr>,
    ) -> RecruitStorageRequest {
        let mut excluded: BTreeSet<ExclusionKey> = BTreeSet::new();
        for (id, info) in self.servers.iter().chain(self.testing_servers.iter()) {
            if self.server_status[id].exclude_on_recruit() {
                excluded.insert(ExclusionKey::from(info.interface.address));
            }
        }
        for addr in in_flight {
            excluded.insert(ExclusionKey::from(*addr));
        }
        for (key, status) in &self.exclusions {
            if *status != ExclusionStatus::None {
                excluded.insert(*key);
            }
        }

        RecruitStorageRequest {
            excluded_addresses: excluded.into_iter().collect(),
            included_dcs: self.cfg.included_dcs.clone(),
            critical: self.healthy_team_count == 0,
        }
    }

    /// How many servers (testing included) already live on an address.
    pub(crate) fn servers_on_address(&self, address: SocketAddr) -> usize {
        self.servers
            .values()
            .chain(self.testing_servers.values())
            .filter(|s| s.interface.address == address)
            .count()
    }

    /// Testing servers still to recruit (negative: too many). The target is
    /// split across regions, with the remainder landing in the primary.
    pub(crate) fn testing_deficit(&self, in_progress: usize) -> i64 {
        let mut target = self.cfg.desired_testing_servers as i64;
        if self.cfg.usable_regions > 1 {
            let regions = self.cfg.usable_regions as i64;
            target /= regions;
            if self.region.is_primary() {
                target += self.cfg.desired_testing_servers as i64 % regions;
            }
        }
        target - self.testing_servers.len() as i64 - in_progress as i64
    }

    /// The `n` oldest testing servers, by the version they were added at;
    /// surplus killing starts with these.
    pub(crate) fn oldest_testing_servers(&self, n: usize) -> Vec<ServerId> {
        let mut all: Vec<(&ServerId, &crate::collection::ServerInfo)> =
            self.testing_servers.iter().collect();
        all.sort_by_key(|(_, info)| info.added_version);
        all.into_iter().take(n).map(|(&id, _)| id).collect()
    }
}

/// Asks the cluster controller for one candidate worker and reports it back
/// as an event. Replaced (aborted) whenever the query changes. The short
/// pause keeps an instantly answering controller from spinning the
/// recruiter hot.
pub(crate) async fn fetch_candidate(
    env: CollectionEnv,
    req: RecruitStorageRequest,
    tx: mpsc::UnboundedSender<TrackEvent>,
) {
    time::sleep(Duration::from_millis(10)).await;
    let reply = env.controller.recruit_storage(req).await;
    let _ = tx.send(TrackEvent::RecruitCandidate { reply });
}

fn fresh_interface_id() -> ServerId {
    let mut rng = rand::thread_rng();
    ServerId(rng.gen(), rng.gen())
}

/// Initializes a regular storage server on a candidate worker. When a
/// testing server is waiting at the rendezvous, its pair id and creation
/// version are handed over after a successful init, and completion is held
/// (bounded) until the testing side finishes too.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn recruit_storage_server(
    tag: &'static str,
    env: CollectionEnv,
    worker: WorkerDescriptor,
    store_type: StoreType,
    retry: Duration,
    pair_timeout: Duration,
    rendezvous: Option<(oneshot::Sender<(ServerId, Version)>, oneshot::Receiver<bool>)>,
    tx: mpsc::UnboundedSender<TrackEvent>,
) {
    let interface_id = fresh_interface_id();
    let req = InitializeStorageRequest {
        store_type,
        seed_tag: None,
        req_id: interface_id,
        interface_id,
        tss_pair: None,
    };
    region_debug!(tag, "initializing storage on {} as {}", worker.address,
              interface_id.short());

    let mut added = None;
    match env.workers.initialize_storage(&worker, req).await {
        Ok(reply) => {
            if let Some((pair_tx, tss_done_rx)) = rendezvous {
                if pair_tx
                    .send((reply.interface.id, reply.added_version))
                    .is_ok()
                {
                    // give the testing side a bounded chance to finish with us
                    match time::timeout(pair_timeout, tss_done_rx).await {
                        Ok(Ok(true)) => {
                            region_debug!(tag, "testing pair of {} completed",
                                      reply.interface.id.short())
                        }
                        Ok(_) => region_warn!(tag, "testing pair recruitment failed"),
                        Err(_) => region_warn!(tag, "testing pair recruitment timed out"),
                    }
                }
            }
            added = Some(AddedServer {
                interface: reply.interface,
                class: worker.class,
                added_version: reply.added_version,
            });
        }
        Err(BallastError::RecruitmentFailed) | Err(BallastError::RequestMaybeDelivered) => {
            // transient; let the recruiter try this or another worker again
            time::sleep(retry).await;
        }
        Err(e) => {
            region_warn!(tag, "initialize storage on {} failed: {}", worker.address, e);
            time::sleep(retry).await;
        }
    }

    let _ = tx.send(TrackEvent::RecruitDone {
        address: worker.address,
        added,
        is_testing: false,
    });
}

/// Initializes a testing server: blocks until the paired regular server
/// hands over its id and version (or the rendezvous is cancelled), then
/// recruits with the pair baked into the request.
pub(crate) async fn recruit_testing_server(
    tag: &'static str,
    env: CollectionEnv,
    worker: WorkerDescriptor,
    store_type: StoreType,
    retry: Duration,
    pair_rx: oneshot::Receiver<(ServerId, Version)>,
    tss_done_tx: oneshot::Sender<bool>,
    tx: mpsc::UnboundedSender<TrackEvent>,
) {
    let interface_id = fresh_interface_id();
    region_debug!(tag, "testing server {} waiting for pair on {}",
              interface_id.short(), worker.address);

    let mut added = None;
    match pair_rx.await {
        Ok(pair) => {
            let req = InitializeStorageRequest {
                store_type,
                seed_tag: None,
                req_id: interface_id,
                interface_id,
                tss_pair: Some(pair),
            };
            match env.workers.initialize_storage(&worker, req).await {
                Ok(reply) => {
                    added = Some(AddedServer {
                        interface: reply.interface,
                        class: worker.class,
                        added_version: reply.added_version,
                    });
                }
                Err(BallastError::RecruitmentFailed)
                | Err(BallastError::RequestMaybeDelivered) => {
                    time::sleep(retry).await;
                }
                Err(e) => {
                    region_warn!(tag, "initialize testing storage on {} failed: {}",
                             worker.address, e);
                    time::sleep(retry).await;
                }
            }
        }
        Err(_) => {
            // pairing cancelled or the regular side failed
            region_warn!(tag, "testing server {} never got a pair", interface_id.short());
        }
    }

    let _ = tss_done_tx.send(added.is_some());
    let _ = tx.send(TrackEvent::RecruitDone {
        address: worker.address,
        added,
        is_testing: true,
    });
}

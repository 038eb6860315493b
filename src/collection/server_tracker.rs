//! Per-server tracking: deriving the status bits that drive team health,
//! folding in failure-monitor flips, storage metrics, store types, and
//! interface changes, plus the spawned watchdog task that feeds those
//! observations back to the supervisor.

use crate::collection::{CollectionEnv, TeamCollection, TrackEvent};
use crate::external::{
    ExclusionKey, ProcessClass, StorageInterface, StorageMetrics, StoreType,
};
use crate::model::{ExclusionStatus, ServerId, ServerStatus, Version};
use crate::policy::is_valid_locality;

use rand::Rng;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration};

/// What a status derivation asked the supervisor to do.
#[derive(Debug, Default)]
pub(crate) struct StatusEffects {
    pub changed: bool,
    pub restart_recruiting: bool,

    /// The server is in `Failed` exclusion state; escalate so its keys get
    /// repaired and it is removed once drained.
    pub remove_failed: bool,

    /// Same-address peers that should re-derive their own status.
    pub wake_peers: Vec<ServerId>,
}

/// Effects of an interface change.
#[derive(Debug, Default)]
pub(crate) struct InterfaceEffects {
    pub locality_changed: bool,
    pub machine_changed: bool,
    pub restart_recruiting: bool,

    /// Teams invalidated by the new locality and re-filed as bad.
    pub invalidated_teams: Vec<crate::model::TeamId>,
}

impl TeamCollection {
    pub(crate) fn is_testing_server(&self, id: ServerId) -> bool {
        self.testing_servers.contains_key(&id)
    }

    fn server_interface(&self, id: ServerId) -> Option<&StorageInterface> {
        self.servers
            .get(&id)
            .or_else(|| self.testing_servers.get(&id))
            .map(|s| &s.interface)
    }

    /// Writes a server's status, keeping the unhealthy-server counter in
    /// step (testing servers do not count).
    pub(crate) fn set_status(&mut self, id: ServerId, status: ServerStatus) -> bool {
        let prev = self.server_status.get(&id).cloned();
        let changed = prev.as_ref() != Some(&status);
        if !self.is_testing_server(id) {
            let was = prev.map(|p| p.is_unhealthy()).unwrap_or(false);
            let is = status.is_unhealthy();
            if was && !is {
                self.unhealthy_servers -= 1;
            } else if !was && is {
                self.unhealthy_servers += 1;
            }
        }
        self.server_status.insert(id, status);
        changed
    }

    /// Whether the maintenance zone forces failures of this server to be
    /// ignored.
    fn in_ignored_failure_zone(&self, id: ServerId) -> bool {
        use crate::external::HealthyZone;
        match (&self.healthy_zone, self.server_interface(id)) {
            (Some(HealthyZone::IgnoreFailures), _) => true,
            (Some(HealthyZone::Zone { zone, .. }), Some(interface)) => {
                interface.locality.zone_id().as_ref() == Some(zone)
            }
            _ => false,
        }
    }

    /// Applies a failure-monitor flip, honoring the maintenance zone.
    /// Returns true if the stored status actually changed.
    pub(crate) fn apply_failure(&mut self, id: ServerId, failed: bool) -> bool {
        let mut status = match self.server_status.get(&id) {
            Some(st) => st.clone(),
            None => return false,
        };
        let effective = failed && !self.in_ignored_failure_zone(id);
        if failed && !effective {
            region_info!(self.tag(), "ignoring failure of {} in maintenance zone",
                     id.short());
        }
        if status.is_failed == effective {
            return false;
        }
        status.is_failed = effective;
        let changed = self.set_status(id, status);

        if effective {
            // a hole in the fleet: go find a replacement
            region_warn!(self.tag(), "server {} marked failed", id.short());
        } else if !self.is_testing_server(id) {
            let under_target = self
                .servers
                .get(&id)
                .map(|s| s.teams.len() < self.target_teams_per_server())
                .unwrap_or(false);
            if under_target || self.last_build_teams_failed {
                self.do_build_teams = true;
            }
        }
        changed
    }

    fn exclusion_keys_of(interface: &StorageInterface) -> Vec<ExclusionKey> {
        let mut keys = vec![
            ExclusionKey::from(interface.address),
            ExclusionKey::wildcard(interface.address.ip()),
        ];
        if let Some(second) = interface.secondary_address {
            keys.push(ExclusionKey::from(second));
            keys.push(ExclusionKey::wildcard(second.ip()));
        }
        keys
    }

    /// Recomputes every derived status bit of one server (keeping its
    /// failure bit), per the rules of the tracker: same-address arbitration,
    /// process-class fitness, datacenter and locality validity, store type,
    /// exclusion and wiggle states.
    pub(crate) fn derive_server_status(&mut self, id: ServerId) -> StatusEffects {
        let mut effects = StatusEffects::default();
        let is_testing = self.is_testing_server(id);
        let info = match self
            .servers
            .get(&id)
            .or_else(|| self.testing_servers.get(&id))
        {
            Some(info) => info.clone(),
            None => return effects,
        };
        let prev = match self.server_status.get(&id) {
            Some(st) => st.clone(),
            None => return effects,
        };

        let mut status =
            ServerStatus::new(prev.is_failed, false, false, info.interface.locality.clone());

        // sustained version lag makes a server undesired, unless so many
        // zones lag that failing them all would be worse
        status.is_undesired = !self.disable_failing_lagging && info.version_too_far_behind;

        // another server on the exact same address: the one with fewer
        // shards is the stale incarnation and must go
        let my_shards = self.shards.shard_count(id);
        let peers: Vec<(ServerId, usize)> = self
            .servers
            .iter()
            .chain(self.testing_servers.iter())
            .filter(|(&oid, o)| {
                oid != id && o.interface.address == info.interface.address
            })
            .map(|(&oid, _)| (oid, self.shards.shard_count(oid)))
            .collect();
        for (peer, peer_shards) in peers {
            if self.server_status[&peer].is_unhealthy() {
                continue;
            }
            if peer_shards >= my_shards {
                region_warn!(self.tag(),
                    "server {} undesired: same-address peer {} has {} >= {} shards",
                    id.short(), peer.short(), peer_shards, my_shards);
                status.is_undesired = true;
            } else {
                effects.wake_peers.push(peer);
            }
        }

        // an unfit process class is tolerated only while no optimal team
        // exists (guarding on optimal, not healthy, avoids status bounce)
        if !info.class.fits_storage() && self.optimal_team_count > 0 {
            status.is_undesired = true;
        }

        let wrong_dc = !self.is_correct_dc(&info.interface);
        let invalid_locality =
            !is_valid_locality(&*self.cfg.policy, &info.interface.locality);
        if wrong_dc || invalid_locality {
            status.is_undesired = true;
            status.is_wrong_configuration = true;
        }

        if info.wrong_store_type_to_remove {
            status.is_undesired = true;
            status.is_wrong_configuration = true;
            effects.restart_recruiting = true;
        }

        // worst exclusion state across all of the server's address forms; a
        // wiggle mark whose pid is no longer the wiggling one is stale and
        // gets reset so the server can be re-included
        let mut worst = ExclusionStatus::None;
        for key in Self::exclusion_keys_of(&info.interface) {
            let mut state = self.exclusions.get(&key).copied().unwrap_or_default();
            if state == ExclusionStatus::Wiggling {
                let pid = info.interface.locality.process_id();
                if pid != self.wiggling_pid {
                    self.exclusions.insert(key, ExclusionStatus::None);
                    state = ExclusionStatus::None;
                }
            }
            worst = worst.max(state);
        }

        if worst != ExclusionStatus::None {
            status.is_undesired = true;
            status.is_wrong_configuration = true;
            match worst {
                ExclusionStatus::Wiggling if !is_testing => {
                    status.is_wiggling = true;
                }
                ExclusionStatus::Failed if !is_testing => {
                    // drain at top priority and escalate for key repair
                    status.is_failed = true;
                    effects.remove_failed = true;
                }
                _ => {}
            }
        }

        if wrong_dc || invalid_locality || info.wrong_store_type_to_remove {
            effects.restart_recruiting = true;
        }

        let became_healthy = prev.is_unhealthy() && !status.is_unhealthy();
        if status.is_failed && !prev.is_failed {
            effects.restart_recruiting = true;
        }
        effects.changed = self.set_status(id, status);
        if became_healthy && !is_testing {
            let under_target = self
                .servers
                .get(&id)
                .map(|s| s.teams.len() < self.target_teams_per_server())
                .unwrap_or(false);
            if under_target || self.last_build_teams_failed {
                self.do_build_teams = true;
            }
        }
        effects
    }

    pub(crate) fn is_correct_dc(&self, interface: &StorageInterface) -> bool {
        self.cfg.included_dcs.is_empty()
            || interface
                .locality
                .dc_id()
                .map(|dc| self.cfg.included_dcs.iter().any(|d| d == dc))
                .unwrap_or(false)
    }

    /// Folds in a fresh metrics reply; returns true when the lag-derived
    /// state moved (so statuses need re-deriving).
    pub(crate) fn note_metrics(&mut self, id: ServerId, metrics: StorageMetrics) -> bool {
        let (zone, was_behind, now_behind) = {
            let info = match self
                .servers
                .get_mut(&id)
                .or_else(|| self.testing_servers.get_mut(&id))
            {
                Some(info) => info,
                None => return false,
            };
            info.metrics = Some(metrics);
            let was = info.version_too_far_behind;
            let now = if metrics.version_lag > self.knobs.version_lag_to_fail {
                true
            } else if metrics.version_lag < self.knobs.version_lag_to_clear {
                false
            } else {
                was
            };
            info.version_too_far_behind = now;
            (info.interface.locality.zone_id(), was, now)
        };

        if was_behind == now_behind {
            return false;
        }
        if let Some(zone) = zone {
            if now_behind {
                region_warn!(self.tag(), "server {} version lag over limit", id.short());
                self.lagging_zones.insert(zone);
            } else {
                // the zone stops counting once no server in it lags
                let still_lagging = self.servers.values().any(|s| {
                    s.version_too_far_behind
                        && s.interface.locality.zone_id().as_ref() == Some(&zone)
                });
                if !still_lagging {
                    self.lagging_zones.remove(&zone);
                }
            }
        }
        let disable =
            self.lagging_zones.len() > std::cmp::max(1, self.cfg.team_size - 1);
        if disable != self.disable_failing_lagging {
            region_warn!(self.tag(),
                "{} failing of lagging servers ({} zones behind)",
                if disable { "disabling" } else { "enabling" },
                self.lagging_zones.len());
            self.disable_failing_lagging = disable;
        }
        true
    }

    /// Records a server's learned store type. Returns true when it differs
    /// from the configured one, so the wrong-store remover should run.
    pub(crate) fn note_store_type(&mut self, id: ServerId, store_type: StoreType) -> bool {
        let info = match self.servers.get_mut(&id) {
            Some(info) => info,
            None => return false,
        };
        info.store_type = Some(store_type);
        store_type != self.cfg.store_type
    }

    /// Applies an interface change: possibly moves the server between
    /// machines, re-validates its teams, and updates the process index.
    pub(crate) fn interface_changed(
        &mut self,
        id: ServerId,
        interface: StorageInterface,
        class: ProcessClass,
    ) -> InterfaceEffects {
        let mut effects = InterfaceEffects::default();
        let is_testing = self.is_testing_server(id);
        let old = match self
            .servers
            .get(&id)
            .or_else(|| self.testing_servers.get(&id))
        {
            Some(info) => info.interface.clone(),
            None => return effects,
        };

        effects.restart_recruiting = old.address != interface.address;
        effects.locality_changed = old.locality != interface.locality;
        effects.machine_changed = old.locality.zone_id() != interface.locality.zone_id();
        let pid_changed = old.locality.process_id() != interface.locality.process_id();

        {
            let info = self
                .servers
                .get_mut(&id)
                .or_else(|| self.testing_servers.get_mut(&id))
                .unwrap();
            info.interface = interface.clone();
            info.class = class;
        }

        if effects.locality_changed && !is_testing {
            region_info!(self.tag(),
                "server {} interface changed (machine moved: {})",
                id.short(), effects.machine_changed);

            if effects.machine_changed {
                // detach from the old machine first
                if let Some(old_machine) = self.servers[&id].machine.clone() {
                    let emptied = match self.machines.get_mut(&old_machine) {
                        Some(machine) => {
                            machine.servers.retain(|&s| s != id);
                            machine.servers.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        self.remove_machine(&old_machine);
                    }
                    self.servers.get_mut(&id).unwrap().machine = None;
                }
                let _ = self.check_and_create_machine(id);
            }

            if pid_changed {
                if let Some(old_pid) = old.locality.process_id() {
                    if let Some(vec) = self.pid_index.get_mut(&old_pid) {
                        vec.retain(|&s| s != id);
                        if vec.is_empty() {
                            self.pid_index.remove(&old_pid);
                        }
                    }
                }
                if let Some(new_pid) = interface.locality.process_id() {
                    self.pid_index.entry(new_pid).or_default().push(id);
                }
            }

            // the moved server may have broken some of its teams' policy
            // compliance; those get re-filed as bad and drained
            let team_ids = self.servers[&id].teams.clone();
            for team_id in team_ids {
                let members = self.teams[&team_id].servers.clone();
                if !self.satisfies_policy(&members) {
                    if let Some(team) = self.remove_team(team_id) {
                        let bad_id = self.add_team(&team.servers, true, false);
                        effects.invalidated_teams.push(bad_id);
                    }
                } else if effects.machine_changed {
                    let _ = self.check_and_create_machine_team(team_id);
                }
            }

            let in_desired = self.is_correct_dc(&interface);
            self.servers.get_mut(&id).unwrap().in_desired_dc = in_desired;
            self.do_build_teams = true;
        }

        // the store type belongs to the new incarnation; re-learn it
        if !is_testing {
            if let Some(info) = self.servers.get_mut(&id) {
                info.store_type = None;
            }
        }
        effects
    }
}

/// Per-server timing knobs handed to the watchdog task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WatchdogTimings {
    pub failure_reaction: Duration,
    pub metrics_poll: Duration,
    pub metrics_jitter: Duration,
    pub drain_poll: Duration,
    pub removal_version_margin: Version,
}

/// One spawned task per tracked server. Watches the failure monitor (with a
/// sustained-failure requirement), polls metrics with jitter, learns the
/// store type once per interface incarnation, and — while the server is
/// unhealthy — polls for full shard drain so the supervisor can finish the
/// removal. All observations flow back as events; this task never touches
/// collection state.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn server_watchdog(
    tag: &'static str,
    id: ServerId,
    interface: StorageInterface,
    added_version: Version,
    is_testing: bool,
    timings: WatchdogTimings,
    unhealthy_rx: watch::Receiver<bool>,
    env: CollectionEnv,
    tx: mpsc::UnboundedSender<TrackEvent>,
) {
    let address = interface.address;

    let failure_env = env.clone();
    let failure_tx = tx.clone();
    let failure_loop = async move {
        let mut failed = false;
        loop {
            if failure_env
                .failures
                .wait_state(address, !failed)
                .await
                .is_err()
            {
                futures::future::pending::<()>().await;
            }
            if !failed {
                // only a failure that outlives the reaction time counts
                tokio::select! {
                    _ = time::sleep(timings.failure_reaction) => {
                        failed = true;
                        let _ = failure_tx.send(TrackEvent::FailureChanged {
                            id,
                            failed: true,
                        });
                    }
                    _ = failure_env.failures.wait_state(address, false) => {}
                }
            } else {
                failed = false;
                let _ = failure_tx.send(TrackEvent::FailureChanged { id, failed: false });
            }
        }
    };

    let drain_env = env.clone();
    let drain_tx = tx.clone();
    let mut drain_rx = unhealthy_rx;
    let drain_loop = async move {
        loop {
            while !*drain_rx.borrow() {
                if drain_rx.changed().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }
            // unhealthy: keep checking whether everything has drained away
            loop {
                if !*drain_rx.borrow() {
                    break;
                }
                let can_remove = drain_env
                    .keyspace
                    .can_remove_server(id)
                    .await
                    .unwrap_or(false);
                let version = drain_env.keyspace.current_version().await.unwrap_or(0);
                // never remove a server the instant it was added; a badly
                // timed recovery could lose the mutations sent to it
                if can_remove
                    && version > added_version + timings.removal_version_margin
                    && drain_env.shards.shard_count(id) == 0
                {
                    // the supervisor aborts this task once the removal
                    // lands; until then keep offering it
                    let _ = drain_tx.send(TrackEvent::Drained { id });
                }
                tokio::select! {
                    _ = time::sleep(timings.drain_poll) => {}
                    res = drain_rx.changed() => {
                        if res.is_err() {
                            futures::future::pending::<()>().await;
                        }
                    }
                }
            }
        }
    };

    let metrics_env = env.clone();
    let metrics_tx = tx.clone();
    let metrics_interface = interface.clone();
    let metrics_loop = async move {
        loop {
            // jitter spreads the fleet's polls apart
            let jitter = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(
                    rng.gen_range(0..=timings.metrics_jitter.as_millis() as u64),
                )
            };
            time::sleep(timings.metrics_poll + jitter).await;
            match metrics_env.storage.get_metrics(&metrics_interface).await {
                Ok(metrics) => {
                    let _ = metrics_tx.send(TrackEvent::Metrics { id, metrics });
                }
                Err(e) => {
                    region_debug!(tag, "metrics poll of {} failed: {}", id.short(), e);
                }
            }
        }
    };

    let store_env = env;
    let store_tx = tx;
    let store_interface = interface;
    let store_once = async move {
        if !is_testing {
            loop {
                match store_env.storage.get_store_type(&store_interface).await {
                    Ok(store_type) => {
                        let _ = store_tx
                            .send(TrackEvent::StoreTypeLearned { id, store_type });
                        break;
                    }
                    Err(_) => time::sleep(timings.metrics_poll).await,
                }
            }
        }
        futures::future::pending::<()>().await
    };

    tokio::join!(failure_loop, drain_loop, metrics_loop, store_once);
}

#[cfg(test)]
mod server_tracker_tests {
    use super::*;
    use crate::collection::testkit;
    use crate::external::HealthyZone;
    use crate::model::MachineId;
    use crate::utils::BallastError;

    #[test]
    fn maintenance_zone_masks_failure() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 9);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1"), (3, "z2")])?;

        tc.set_healthy_zone(Some(HealthyZone::Zone {
            zone: MachineId::from("z0"),
            until_version: i64::MAX,
        }));
        assert!(!tc.apply_failure(ServerId::from(1), true));
        assert!(!tc.status(ServerId::from(1)).is_failed);

        // a server outside the zone still fails
        assert!(tc.apply_failure(ServerId::from(2), true));
        assert!(tc.status(ServerId::from(2)).is_failed);

        tc.set_healthy_zone(Some(HealthyZone::IgnoreFailures));
        assert!(!tc.apply_failure(ServerId::from(3), true));
        Ok(())
    }

    #[test]
    fn metrics_lag_latches_with_hysteresis() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 9);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1"), (3, "z2")])?;
        let lagging = StorageMetrics {
            version_lag: tc.knobs().version_lag_to_fail + 1,
            ..Default::default()
        };
        let middling = StorageMetrics {
            version_lag: tc.knobs().version_lag_to_clear + 1,
            ..Default::default()
        };
        let caught_up = StorageMetrics::default();

        assert!(tc.note_metrics(ServerId::from(1), lagging));
        tc.derive_server_status(ServerId::from(1));
        assert!(tc.status(ServerId::from(1)).is_undesired);

        // between the two thresholds nothing changes
        assert!(!tc.note_metrics(ServerId::from(1), middling));

        assert!(tc.note_metrics(ServerId::from(1), caught_up));
        tc.derive_server_status(ServerId::from(1));
        assert!(!tc.status(ServerId::from(1)).is_undesired);
        Ok(())
    }

    #[test]
    fn too_many_lagging_zones_disables_failing() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 9);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1"), (3, "z2")])?;
        let lagging = StorageMetrics {
            version_lag: tc.knobs().version_lag_to_fail + 1,
            ..Default::default()
        };

        tc.note_metrics(ServerId::from(1), lagging);
        tc.note_metrics(ServerId::from(2), lagging);
        // two zones lag: at the limit for team size 3, still failing
        tc.derive_server_status(ServerId::from(1));
        assert!(tc.status(ServerId::from(1)).is_undesired);

        tc.note_metrics(ServerId::from(3), lagging);
        // third zone trips the latch; nobody gets failed for lag anymore
        tc.derive_server_status(ServerId::from(1));
        assert!(!tc.status(ServerId::from(1)).is_undesired);
        Ok(())
    }

    #[test]
    fn failed_exclusion_fails_server_and_escalates() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 9);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1"), (3, "z2")])?;

        let addr = tc.server(ServerId::from(1)).unwrap().interface.address;
        tc.set_exclusion(ExclusionKey::from(addr), ExclusionStatus::Failed);
        let effects = tc.derive_server_status(ServerId::from(1));

        assert!(effects.remove_failed);
        let st = tc.status(ServerId::from(1));
        assert!(st.is_failed && st.is_undesired && st.is_wrong_configuration);
        Ok(())
    }

    #[test]
    fn machine_move_invalidates_broken_teams() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 9);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1"), (3, "z2"), (4, "z3")])?;
        tc.add_team(
            &[ServerId::from(1), ServerId::from(2), ServerId::from(3)],
            true,
            false,
        );
        assert_eq!(tc.team_count(), 1);

        // server 1 moves into z1, colliding with server 2's zone
        let mut moved = tc.server(ServerId::from(1)).unwrap().interface.clone();
        moved.locality.set(crate::model::LOC_ZONEID, "z1");
        let effects = tc.interface_changed(ServerId::from(1), moved, ProcessClass::Storage);

        assert!(effects.machine_changed);
        assert_eq!(effects.invalidated_teams.len(), 1);
        assert_eq!(tc.team_count(), 0);
        assert_eq!(tc.bad_team_count(), 1);
        assert!(tc.machine(&MachineId::from("z0")).is_none());
        tc.sanity_check()
    }
}

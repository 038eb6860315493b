//! Exclusion and wiggle control: translating the operator's exclusion lists
//! into per-address status, and walking process ids through the perpetual
//! storage wiggle one at a time.

use std::collections::BTreeSet;
use std::ops::Bound;

use crate::collection::{CollectionKnobs, TeamCollection};
use crate::external::{ExclusionKey, ExclusionLists, WorkerDescriptor};
use crate::model::{ExclusionStatus, ProcessId, ServerId};

impl TeamCollection {
    pub(crate) fn exclusion_status(&self, key: &ExclusionKey) -> ExclusionStatus {
        self.exclusions.get(key).copied().unwrap_or_default()
    }

    pub(crate) fn set_exclusion(&mut self, key: ExclusionKey, status: ExclusionStatus) {
        self.exclusions.insert(key, status);
    }

    /// Re-derives the exclusion map from freshly read lists. Locality
    /// selectors are resolved to addresses through the worker directory.
    /// Precedence is `Failed > Excluded > Wiggling > None`, and an existing
    /// `Wiggling` mark is never downgraded to `None` by this pass (only the
    /// wiggler itself re-includes its servers).
    pub(crate) fn apply_exclusion_lists(
        &mut self,
        lists: &ExclusionLists,
        workers: &[WorkerDescriptor],
    ) {
        let mut excluded: BTreeSet<ExclusionKey> =
            lists.excluded_addresses.iter().copied().collect();
        let mut failed: BTreeSet<ExclusionKey> =
            lists.failed_addresses.iter().copied().collect();

        for selector in &lists.excluded_localities {
            for worker in workers {
                if selector.matches(&worker.locality) {
                    excluded.insert(ExclusionKey::from(worker.address));
                }
            }
        }
        for selector in &lists.failed_localities {
            for worker in workers {
                if selector.matches(&worker.locality) {
                    failed.insert(ExclusionKey::from(worker.address));
                }
            }
        }

        // clear entries that fell off both lists
        let old_keys: Vec<ExclusionKey> = self.exclusions.keys().copied().collect();
        for key in old_keys {
            if !excluded.contains(&key)
                && !failed.contains(&key)
                && self.exclusions[&key] != ExclusionStatus::Wiggling
            {
                self.exclusions.insert(key, ExclusionStatus::None);
            }
        }
        for key in &excluded {
            if !failed.contains(key) {
                self.exclusions.insert(*key, ExclusionStatus::Excluded);
            }
        }
        for key in &failed {
            self.exclusions.insert(*key, ExclusionStatus::Failed);
        }

        region_info!(self.tag(), "exclusion lists applied: excluded={} failed={}",
                 excluded.len(), failed.len());
    }

    /// Marks every server of a process `Wiggling` so its teams start
    /// draining. Addresses already held by the exclusion lists are left
    /// alone. Returns the servers affected.
    pub(crate) fn exclude_for_wiggle(&mut self, pid: &ProcessId) -> Vec<ServerId> {
        let mut affected = Vec::new();
        let ids = match self.pid_index.get(pid) {
            Some(ids) => ids.clone(),
            None => return affected,
        };
        for id in ids {
            let key = ExclusionKey::from(self.servers[&id].interface.address);
            if self.exclusion_status(&key) != ExclusionStatus::None {
                continue;
            }
            self.wiggle_addresses.push(key);
            self.exclusions.insert(key, ExclusionStatus::Wiggling);
            affected.push(id);
        }
        if !affected.is_empty() {
            region_info!(self.tag(), "wiggling process {} ({} servers)",
                     pid, affected.len());
        }
        affected
    }

    /// Lifts the wiggle marks this region placed, making the addresses
    /// recruitable again. Returns true if anything was re-included.
    pub(crate) fn include_wiggled(&mut self) -> bool {
        let mut included = false;
        for key in std::mem::take(&mut self.wiggle_addresses) {
            if self.exclusion_status(&key) == ExclusionStatus::Wiggling {
                self.exclusions.insert(key, ExclusionStatus::None);
                included = true;
            }
        }
        included
    }

    /// The process id to wiggle after `current`: its successor in sorted
    /// order, wrapping to the first. `None` when no process is known.
    pub(crate) fn next_wiggle_pid(&self, current: Option<&ProcessId>) -> Option<ProcessId> {
        let first = self.pid_index.keys().next()?.clone();
        match current {
            Some(cur) => Some(
                self.pid_index
                    .range((Bound::Excluded(cur.clone()), Bound::Unbounded))
                    .next()
                    .map(|(pid, _)| pid.clone())
                    .unwrap_or(first),
            ),
            None => Some(first),
        }
    }

    pub(crate) fn set_wiggling_pid(&mut self, pid: Option<ProcessId>) {
        self.wiggling_pid = pid;
    }

    /// Fed by the relocation queue when team selection keeps failing; one of
    /// the wiggle pause triggers.
    pub fn note_team_selection_stuck(&mut self) {
        self.stuck_team_selections += 1;
    }
}

/// Wiggle driver state held by the supervisor.
#[derive(Debug)]
pub(crate) struct WiggleState {
    pub enabled: bool,
    pub paused: bool,

    /// Healthy-team margin required before wiggling resumes; grows when the
    /// wiggle pauses for health reasons, so resume/pause cannot ping-pong.
    pub extra_team_count: usize,
    pause_penalty: usize,

    /// Servers excluded by the current round, still waiting to drain away.
    pub outstanding: BTreeSet<ServerId>,

    /// Next pid to persist once the between-rounds rest elapses.
    pub pending_advance: Option<ProcessId>,
}

impl WiggleState {
    pub fn new() -> Self {
        WiggleState {
            enabled: false,
            paused: true,
            extra_team_count: 0,
            pause_penalty: 1,
            outstanding: BTreeSet::new(),
            pending_advance: None,
        }
    }

    /// Evaluates the pause conditions: (a) relocation queue busy with
    /// unhealthy moves, (b) not enough healthy teams beyond the earned
    /// margin, (c) team selection stuck for too long. Pausing for (b) or
    /// (c) grows the margin.
    pub fn should_pause(
        &mut self,
        knobs: &CollectionKnobs,
        unhealthy_relocations: usize,
        healthy_teams: usize,
        total_teams: usize,
        stuck_selections: u64,
    ) -> bool {
        let queue_busy = unhealthy_relocations >= knobs.wiggle_pause_threshold;
        let unhealthy_cluster = healthy_teams <= self.extra_team_count
            || stuck_selections > knobs.wiggle_stuck_threshold;

        if unhealthy_cluster && !self.paused {
            self.extra_team_count =
                (self.extra_team_count + self.pause_penalty).min(total_teams);
            self.pause_penalty = (self.pause_penalty * 2).min(total_teams.max(1));
        }
        queue_busy || unhealthy_cluster
    }

    /// A wiggle round completed; relax the earned margin a little.
    pub fn finish_round(&mut self) {
        self.extra_team_count = self.extra_team_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod exclusion_tests {
    use super::*;
    use crate::collection::testkit;
    use crate::external::LocalityMatch;
    use crate::model::{Locality, LOC_ZONEID};
    use crate::utils::BallastError;

    fn key(addr: &str) -> ExclusionKey {
        ExclusionKey::from(addr.parse::<std::net::SocketAddr>().unwrap())
    }

    #[test]
    fn failed_beats_excluded_beats_wiggling() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 11);
        let a = key("10.0.0.1:4500");

        tc.set_exclusion(a, ExclusionStatus::Wiggling);
        tc.apply_exclusion_lists(
            &ExclusionLists {
                excluded_addresses: vec![a],
                failed_addresses: vec![a],
                ..Default::default()
            },
            &[],
        );
        assert_eq!(tc.exclusion_status(&a), ExclusionStatus::Failed);
        Ok(())
    }

    #[test]
    fn list_pass_preserves_wiggle_marks() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 11);
        let wiggling = key("10.0.0.1:4500");
        let stale = key("10.0.0.2:4500");

        tc.set_exclusion(wiggling, ExclusionStatus::Wiggling);
        tc.set_exclusion(stale, ExclusionStatus::Excluded);
        tc.apply_exclusion_lists(&ExclusionLists::default(), &[]);

        // the wiggle mark survives; the stale exclusion clears
        assert_eq!(tc.exclusion_status(&wiggling), ExclusionStatus::Wiggling);
        assert_eq!(tc.exclusion_status(&stale), ExclusionStatus::None);
        Ok(())
    }

    #[test]
    fn locality_selectors_resolve_to_addresses() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 11);
        let workers = vec![
            WorkerDescriptor {
                address: "10.0.0.1:4500".parse()?,
                locality: Locality::new().with(LOC_ZONEID, "z0"),
                class: crate::external::ProcessClass::Storage,
            },
            WorkerDescriptor {
                address: "10.0.0.2:4500".parse()?,
                locality: Locality::new().with(LOC_ZONEID, "z1"),
                class: crate::external::ProcessClass::Storage,
            },
        ];
        tc.apply_exclusion_lists(
            &ExclusionLists {
                excluded_localities: vec![LocalityMatch {
                    key: LOC_ZONEID.to_string(),
                    value: "z0".to_string(),
                }],
                ..Default::default()
            },
            &workers,
        );
        assert_eq!(
            tc.exclusion_status(&key("10.0.0.1:4500")),
            ExclusionStatus::Excluded
        );
        assert_eq!(
            tc.exclusion_status(&key("10.0.0.2:4500")),
            ExclusionStatus::None
        );
        Ok(())
    }

    #[test]
    fn wiggle_round_trip_and_pid_order() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 11);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1"), (3, "z2")])?;

        // pids are p1, p2, p3 (one per server); sorted iteration wraps
        let p1 = ProcessId::from("p1");
        let p3 = ProcessId::from("p3");
        assert_eq!(tc.next_wiggle_pid(None), Some(p1.clone()));
        assert_eq!(tc.next_wiggle_pid(Some(&p1)), Some(ProcessId::from("p2")));
        assert_eq!(tc.next_wiggle_pid(Some(&p3)), Some(p1.clone()));

        tc.set_wiggling_pid(Some(p1.clone()));
        let affected = tc.exclude_for_wiggle(&p1);
        assert_eq!(affected, vec![ServerId::from(1)]);
        let addr = tc.server(ServerId::from(1)).unwrap().interface.address;
        assert_eq!(
            tc.exclusion_status(&ExclusionKey::from(addr)),
            ExclusionStatus::Wiggling
        );

        tc.derive_server_status(ServerId::from(1));
        assert!(tc.status(ServerId::from(1)).is_wiggling);

        assert!(tc.include_wiggled());
        assert_eq!(
            tc.exclusion_status(&ExclusionKey::from(addr)),
            ExclusionStatus::None
        );
        Ok(())
    }

    #[test]
    fn pause_margin_grows_on_health_pauses() {
        let knobs = CollectionKnobs::default();
        let mut wiggle = WiggleState::new();
        wiggle.paused = false;

        // plenty of healthy teams, quiet queue: keep going
        assert!(!wiggle.should_pause(&knobs, 0, 10, 20, 0));

        // unhealthy cluster pause earns a growing margin
        assert!(wiggle.should_pause(&knobs, 0, 0, 20, 0));
        assert_eq!(wiggle.extra_team_count, 1);
        assert!(wiggle.should_pause(&knobs, 0, 1, 20, 0));

        // queue pressure alone pauses without growing the margin
        let margin = wiggle.extra_team_count;
        wiggle.paused = true;
        assert!(wiggle.should_pause(&knobs, knobs.wiggle_pause_threshold, 10, 20, 0));
        assert_eq!(wiggle.extra_team_count, margin);

        wiggle.finish_round();
        assert_eq!(wiggle.extra_team_count, margin - 1);
    }
}

//! Team removers: prune redundant machine teams and server teams back
//! toward the desired counts, dispose of drained bad teams, and sweep
//! servers running the wrong storage engine.

use crate::collection::TeamCollection;
use crate::external::StoreType;
use crate::model::{MachineTeamId, ServerId, TeamId};

/// Storage-engine migration aggressiveness.
#[derive(
    Debug, Default, PartialEq, Eq, Clone, Copy, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StorageMigrationType {
    /// Wrong-store-type servers are left alone.
    Disabled,

    /// The wiggle replaces wrong-store-type servers as it comes around.
    #[default]
    Gradual,

    /// Wrong-store-type servers are marked for removal outright.
    Aggressive,
}

impl TeamCollection {
    /// Gate shared by both removers: act only while nothing is unhealthy, so
    /// removal never races the builder's repairs.
    pub(crate) fn is_settled_healthy(&self) -> bool {
        self.unhealthy_servers == 0 && self.healthy_team_count > 0
    }

    /// The machine team to remove, if any: its members' *minimum*
    /// machine-team count must exceed the per-machine target, maximal among
    /// candidates; and only while the total exceeds the desired count.
    pub(crate) fn pick_machine_team_to_remove(&self) -> Option<(MachineTeamId, usize)> {
        let desired = self.knobs.desired_teams_per_server * self.healthy_machine_count();
        if self.machine_teams.len() <= desired {
            return None;
        }
        let target = self.target_teams_per_server();
        let mut found: Option<(MachineTeamId, usize)> = None;
        for (&mt_id, mt) in &self.machine_teams {
            let representative = mt
                .machine_ids
                .iter()
                .map(|mid| {
                    self.machines
                        .get(mid)
                        .map(|m| m.machine_teams.len())
                        .unwrap_or(0)
                })
                .min()
                .unwrap_or(0);
            if representative > target
                && representative > found.map(|(_, n)| n).unwrap_or(0)
            {
                found = Some((mt_id, representative));
            }
        }
        found
    }

    /// The server team to remove, by the same representative-minimum rule.
    /// Anything at or below the target is off limits, else the builder would
    /// just rebuild it.
    pub(crate) fn pick_server_team_to_remove(&self) -> Option<(TeamId, usize)> {
        let desired = self.knobs.desired_teams_per_server * self.servers.len();
        if self.teams.len() <= desired {
            return None;
        }
        let target = self.target_teams_per_server();
        let mut found: Option<(TeamId, usize)> = None;
        for (&team_id, team) in &self.teams {
            let representative = team
                .servers
                .iter()
                .map(|sid| self.servers.get(sid).map(|s| s.teams.len()).unwrap_or(0))
                .min()
                .unwrap_or(0);
            if representative > target
                && representative > found.map(|(_, n)| n).unwrap_or(0)
            {
                found = Some((team_id, representative));
            }
        }
        found
    }

    /// Converts a live team into a redundant bad team, which its tracker
    /// will drain and the bad-team disposal will eventually discard.
    pub(crate) fn demote_team_to_redundant(&mut self, team_id: TeamId) -> Option<TeamId> {
        let team = self.remove_team(team_id)?;
        let bad_id = self.add_team(&team.servers, true, true);
        self.do_build_teams = true;
        Some(bad_id)
    }

    /// One pass of the machine-team remover. Returns true when a machine
    /// team was removed (its server teams demoted for draining).
    pub(crate) fn try_remove_one_machine_team(&mut self) -> bool {
        // every machine must be healthy, not merely every server
        if !self.is_settled_healthy()
            || self.healthy_machine_count() != self.machines.len()
        {
            return false;
        }
        let (mt_id, representative) = match self.pick_machine_team_to_remove() {
            Some(found) => found,
            None => return false,
        };

        let server_teams = self.machine_teams[&mt_id].server_teams.clone();
        for team_id in server_teams {
            self.demote_team_to_redundant(team_id);
        }
        let removed = self.remove_machine_team(mt_id);
        region_info!(self.tag(),
            "removed machine team {} (min member count {}); machine_teams={}",
            mt_id, representative, self.machine_teams.len());
        removed
    }

    /// One pass of the server-team remover.
    pub(crate) fn try_remove_one_server_team(&mut self) -> bool {
        if !self.is_settled_healthy() {
            return false;
        }
        let (team_id, representative) = match self.pick_server_team_to_remove() {
            Some(found) => found,
            None => return false,
        };
        let desc = self.teams[&team_id].desc();
        self.demote_team_to_redundant(team_id);
        region_info!(self.tag(),
            "removed server team {} (min member count {}); teams={}",
            desc, representative, self.teams.len());
        true
    }

    /// Discards every bad team once the region is healthy again; their
    /// shards have been relocated by now. Returns the ids so the supervisor
    /// can drop any armed loggers.
    pub(crate) fn drop_bad_teams(&mut self) -> Vec<TeamId> {
        let ids: Vec<TeamId> = self.bad_teams.keys().copied().collect();
        if !ids.is_empty() {
            region_info!(self.tag(), "dropping {} drained bad teams", ids.len());
            self.bad_teams.clear();
        }
        ids
    }

    /// Scans for a server whose learned store type contradicts the
    /// configuration. Under aggressive migration the server is marked for
    /// removal; otherwise it is left for the wiggle to replace. Returns the
    /// server found, if any, and whether it was marked.
    pub(crate) fn find_wrong_store_type_server(&mut self) -> Option<(ServerId, bool)> {
        let configured: StoreType = self.cfg.store_type;
        let found = self
            .servers
            .iter()
            .find(|(_, s)| !s.is_correct_store_type(configured))
            .map(|(&id, _)| id)?;

        let aggressive = self.cfg.migration == StorageMigrationType::Aggressive;
        if aggressive {
            self.servers.get_mut(&found).unwrap().wrong_store_type_to_remove = true;
            region_warn!(self.tag(), "server {} has wrong store type, marking for removal",
                     found.short());
        }
        Some((found, aggressive))
    }
}

#[cfg(test)]
mod remover_tests {
    use super::*;
    use crate::collection::testkit;
    use crate::utils::BallastError;

    /// All zone-distinct triples over five zones, one server per zone.
    fn fill_triples(tc: &mut crate::collection::TeamCollection) {
        for a in 1u64..=5 {
            for b in (a + 1)..=5 {
                for c in (b + 1)..=5 {
                    let members = vec![
                        ServerId::from(a),
                        ServerId::from(b),
                        ServerId::from(c),
                    ];
                    tc.add_team(&members, true, false);
                }
            }
        }
    }

    #[test]
    fn server_team_remover_trims_overfull() -> Result<(), BallastError> {
        let mut tc = testkit::collection_with(3, 13, |knobs| {
            knobs.desired_teams_per_server = 1;
            knobs.max_teams_per_server = 3;
        });
        testkit::add_servers(
            &mut tc,
            &[(1, "z0"), (2, "z1"), (3, "z2"), (4, "z3"), (5, "z4")],
        )?;
        fill_triples(&mut tc);
        // ten teams against a desired total of five
        assert_eq!(tc.team_count(), 10);

        assert!(tc.try_remove_one_server_team());
        assert_eq!(tc.team_count(), 9);
        assert_eq!(tc.bad_team_count(), 1);

        let mut guard = 0;
        while tc.try_remove_one_server_team() {
            guard += 1;
            assert!(guard < 20);
        }
        // either the total came down to desired, or every remaining team
        // has a member at the per-server target
        assert!(tc.team_count() <= 5 || tc.pick_server_team_to_remove().is_none());
        tc.sanity_check()
    }

    #[test]
    fn machine_team_remover_trims_overfull() -> Result<(), BallastError> {
        let mut tc = testkit::collection_with(3, 13, |knobs| {
            knobs.desired_teams_per_server = 1;
            knobs.max_teams_per_server = 3;
        });
        testkit::add_servers(
            &mut tc,
            &[(1, "z0"), (2, "z1"), (3, "z2"), (4, "z3"), (5, "z4")],
        )?;
        fill_triples(&mut tc);
        assert_eq!(tc.machine_team_count(), 10);

        assert!(tc.try_remove_one_machine_team());
        assert_eq!(tc.machine_team_count(), 9);
        // its server teams went bad and will drain
        assert!(tc.bad_team_count() >= 1);
        tc.sanity_check()
    }

    #[test]
    fn removers_respect_health_gate() -> Result<(), BallastError> {
        let mut tc = testkit::collection_with(3, 13, |knobs| {
            knobs.desired_teams_per_server = 1;
        });
        testkit::add_servers(
            &mut tc,
            &[(1, "z0"), (2, "z1"), (3, "z2"), (4, "z3")],
        )?;
        for triple in [[1u64, 2, 3], [1, 2, 4], [1, 3, 4], [2, 3, 4]] {
            let members: Vec<ServerId> =
                triple.iter().map(|&n| ServerId::from(n)).collect();
            tc.add_team(&members, true, false);
        }

        tc.apply_failure(ServerId::from(1), true);
        tc.refresh_teams_of_server(ServerId::from(1));
        assert!(!tc.try_remove_one_server_team());
        assert!(!tc.try_remove_one_machine_team());
        Ok(())
    }

    #[test]
    fn drop_bad_teams_clears_all() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 13);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1")])?;
        tc.add_team(&[ServerId::from(1), ServerId::from(2)], true, false);
        assert_eq!(tc.bad_team_count(), 1);

        let dropped = tc.drop_bad_teams();
        assert_eq!(dropped.len(), 1);
        assert_eq!(tc.bad_team_count(), 0);
        Ok(())
    }

    #[test]
    fn wrong_store_type_marked_only_when_aggressive() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 13);
        testkit::add_servers(&mut tc, &[(1, "z0")])?;
        tc.note_store_type(ServerId::from(1), StoreType::Memory);

        // default migration is gradual: found but not marked
        let (id, marked) = tc.find_wrong_store_type_server().unwrap();
        assert_eq!(id, ServerId::from(1));
        assert!(!marked);
        assert!(!tc.server(id).unwrap().wrong_store_type_to_remove);

        let mut tc = testkit::collection_with(3, 13, |_| {});
        tc.set_migration(StorageMigrationType::Aggressive);
        testkit::add_servers(&mut tc, &[(1, "z0")])?;
        tc.note_store_type(ServerId::from(1), StoreType::Memory);
        let (id, marked) = tc.find_wrong_store_type_server().unwrap();
        assert!(marked);
        assert!(tc.server(id).unwrap().wrong_store_type_to_remove);

        tc.derive_server_status(id);
        assert!(tc.status(id).is_undesired);
        assert!(tc.status(id).is_wrong_configuration);
        Ok(())
    }
}

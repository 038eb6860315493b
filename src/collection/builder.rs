//! Team builder: constructs machine teams and server teams to meet the
//! desired-per-server targets, choosing members so that team counts stay
//! balanced and overlap between teams stays low.

use std::collections::{BTreeSet, HashMap};

use crate::collection::TeamCollection;
use crate::model::{MachineId, ServerId};
use crate::policy::{is_valid_locality, LocalityGroup};

use rand::prelude::*;

/// Hard cap on best-of attempts, even after full-overlap retries earn
/// extra tries.
const MAX_TEAM_ATTEMPTS: usize = 100;

impl TeamCollection {
    pub fn healthy_server_count(&self) -> usize {
        self.servers
            .keys()
            .filter(|&id| !self.server_status[id].is_unhealthy())
            .count()
    }

    pub fn healthy_machine_count(&self) -> usize {
        self.machines
            .keys()
            .filter(|mid| self.is_machine_healthy(mid))
            .count()
    }

    pub fn healthy_machine_team_count(&self) -> usize {
        self.machine_teams
            .values()
            .filter(|mt| self.is_machine_team_healthy(mt))
            .count()
    }

    /// Per-server (and per-machine) team target: halfway between the desired
    /// knob and the ideal average, so the removers have room to rebalance.
    pub(crate) fn target_teams_per_server(&self) -> usize {
        (self.knobs.desired_teams_per_server * (self.cfg.team_size + 1)) / 2
    }

    /// True if some healthy server still has fewer teams than the target.
    pub(crate) fn not_enough_teams_for_a_server(&self) -> bool {
        let target = self.target_teams_per_server();
        self.servers.iter().any(|(id, server)| {
            server.teams.len() < target && !self.server_status[id].is_unhealthy()
        })
    }

    /// True if some healthy machine still has fewer machine teams than the
    /// target.
    pub(crate) fn not_enough_machine_teams_for_a_machine(&self) -> bool {
        let target = self.target_teams_per_server();
        self.machines.iter().any(|(mid, machine)| {
            machine.machine_teams.len() < target && self.is_machine_healthy(mid)
        })
    }

    /// Largest member overlap between the candidate (sorted) and any live
    /// server team.
    pub(crate) fn overlapping_members(&self, candidate: &[ServerId]) -> usize {
        self.teams
            .values()
            .map(|team| {
                candidate
                    .iter()
                    .filter(|id| team.servers.contains(id))
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    /// Largest machine overlap between the candidate (sorted) and any
    /// machine team.
    pub(crate) fn overlapping_machine_members(&self, candidate: &[MachineId]) -> usize {
        self.machine_teams
            .values()
            .map(|mt| {
                candidate
                    .iter()
                    .filter(|mid| mt.machine_ids.contains(mid))
                    .count()
            })
            .max()
            .unwrap_or(0)
    }

    /// The healthy, valid-locality server with the fewest teams; ties broken
    /// uniformly at random.
    fn find_one_least_used_server(&mut self) -> Option<ServerId> {
        let mut least_used: Vec<ServerId> = Vec::new();
        let mut min_teams = usize::MAX;
        for (id, server) in &self.servers {
            if self.server_status[id].is_unhealthy() {
                continue;
            }
            if !is_valid_locality(&*self.cfg.policy, &server.interface.locality) {
                continue;
            }
            let num_teams = server.teams.len();
            if num_teams < min_teams {
                min_teams = num_teams;
                least_used.clear();
            }
            if num_teams == min_teams {
                least_used.push(*id);
            }
        }
        if least_used.is_empty() {
            region_warn!(self.tag(), "no healthy server with valid locality to build on");
            return None;
        }
        least_used.choose(&mut self.rng).copied()
    }

    /// A uniformly random healthy machine team containing the server's
    /// machine. Choosing randomly (rather than least-used) avoids correlated
    /// picks when fresh machines join.
    fn find_random_machine_team_for(
        &mut self,
        server: ServerId,
    ) -> Option<crate::model::MachineTeamId> {
        let machine_id = self.servers.get(&server)?.machine.clone()?;
        let healthy: Vec<_> = self
            .machines
            .get(&machine_id)?
            .machine_teams
            .iter()
            .filter(|&mt_id| {
                self.machine_teams
                    .get(mt_id)
                    .map(|mt| self.is_machine_team_healthy(mt))
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        healthy.choose(&mut self.rng).copied()
    }

    /// Rebuilds the locality group over healthy machines, one representative
    /// server per machine. Returns the group plus the machine id behind each
    /// entry and the reverse index.
    fn rebuild_machine_locality_group(
        &self,
    ) -> (LocalityGroup, Vec<MachineId>, HashMap<MachineId, usize>) {
        let mut group = LocalityGroup::new();
        let mut entry_machines = Vec::new();
        let mut entry_of = HashMap::new();

        for (mid, machine) in &self.machines {
            if machine.servers.is_empty() || !self.is_machine_healthy(mid) {
                continue;
            }
            let representative = &self.servers[&machine.servers[0]];
            let locality = representative.interface.locality.clone();
            if !is_valid_locality(&*self.cfg.policy, &locality) {
                region_warn!(self.tag(),
                    "machine {} has locality {} unusable by policy {}",
                    mid, locality, self.cfg.policy.info());
                continue;
            }
            let entry = group.add(representative.id, locality);
            entry_machines.push(mid.clone());
            entry_of.insert(mid.clone(), entry);
        }
        (group, entry_machines, entry_of)
    }

    /// Builds up to `machine_teams_to_build` machine teams (and keeps going
    /// while some healthy machine is under target). One team per iteration:
    /// force the least-used machine into the policy's selection, score the
    /// candidate by member machine-team counts plus an overlap penalty, and
    /// keep the best of a bounded number of attempts.
    pub(crate) fn add_best_machine_teams(&mut self, machine_teams_to_build: usize) -> usize {
        let mut added = 0;

        if self.machines.len() < self.cfg.team_size {
            self.last_build_teams_failed = true;
            return 0;
        }

        let (group, entry_machines, entry_of) = self.rebuild_machine_locality_group();
        let all_entries = group.all_entries();
        let policy = self.cfg.policy.clone();

        while added < machine_teams_to_build || self.not_enough_machine_teams_for_a_machine()
        {
            // machines with the fewest machine teams, healthy and usable
            let mut least_used: Vec<MachineId> = Vec::new();
            let mut min_count = usize::MAX;
            for (mid, machine) in &self.machines {
                if !entry_of.contains_key(mid) {
                    continue;
                }
                let count = machine.machine_teams.len();
                if count < min_count {
                    min_count = count;
                    least_used.clear();
                }
                if count == min_count {
                    least_used.push(mid.clone());
                }
            }
            if least_used.is_empty() {
                self.last_build_teams_failed = true;
                break;
            }

            let mut best: Option<Vec<MachineId>> = None;
            let mut best_score = usize::MAX;
            let mut max_attempts = self.knobs.best_of_attempts;
            let mut attempt = 0;
            while attempt < max_attempts && attempt < MAX_TEAM_ATTEMPTS {
                attempt += 1;
                let chosen = least_used.choose(&mut self.rng).unwrap().clone();

                let mut member_machines: Vec<MachineId> = if self.cfg.team_size == 1 {
                    // single-machine teams bypass the policy entirely
                    vec![chosen.clone()]
                } else {
                    let forced = vec![entry_of[&chosen]];
                    let mut out = Vec::new();
                    if !policy.select_replicas(
                        &group,
                        &all_entries,
                        &forced,
                        &mut self.rng,
                        &mut out,
                    ) {
                        continue;
                    }
                    out.extend(forced);
                    out.iter().map(|&e| entry_machines[e].clone()).collect()
                };

                if member_machines.len() != self.cfg.team_size {
                    continue;
                }
                member_machines.sort();

                let overlap = self.overlapping_machine_members(&member_machines);
                if overlap == member_machines.len() {
                    // exact duplicate of an existing machine team
                    max_attempts = (max_attempts + 1).min(MAX_TEAM_ATTEMPTS);
                    continue;
                }

                let mut score = self.knobs.overlap_penalty * overlap;
                for mid in &member_machines {
                    score += self.machines[mid].machine_teams.len();
                }
                if score < best_score {
                    best_score = score;
                    best = Some(member_machines);
                }
            }

            match best {
                Some(member_machines) => {
                    self.add_machine_team(member_machines);
                    added += 1;
                }
                None => {
                    region_warn!(self.tag(), "unable to make a new machine team");
                    self.last_build_teams_failed = true;
                    break;
                }
            }
        }

        added
    }

    /// Builds up to `teams_to_build` server teams (and keeps going while
    /// some healthy server is under target), creating machine teams first
    /// when they are below their own target.
    pub(crate) fn add_teams_best_of(
        &mut self,
        teams_to_build: usize,
        desired_teams: usize,
        max_teams: usize,
    ) -> usize {
        let mut added = 0;

        let healthy_machines = self.healthy_machine_count();
        let desired_machine_teams = self.knobs.desired_teams_per_server * healthy_machines;
        let max_machine_teams = self.knobs.max_teams_per_server * healthy_machines;
        let healthy_machine_teams = self.healthy_machine_team_count();
        let machine_teams_to_build = desired_machine_teams
            .saturating_sub(healthy_machine_teams)
            .min(max_machine_teams.saturating_sub(self.machine_teams.len()));

        region_debug!(self.tag(),
            "machine teams: healthy={} desired={} max={} to_build={}",
            healthy_machine_teams, desired_machine_teams, max_machine_teams,
            machine_teams_to_build);
        if machine_teams_to_build > 0 || self.not_enough_machine_teams_for_a_machine() {
            self.add_best_machine_teams(machine_teams_to_build);
        }

        while added < teams_to_build || self.not_enough_teams_for_a_server() {
            let mut best: Option<Vec<ServerId>> = None;
            let mut best_score = usize::MAX;
            let mut early_quit = false;
            let mut max_attempts = self.knobs.best_of_attempts;
            let mut attempt = 0;
            while attempt < max_attempts && attempt < MAX_TEAM_ATTEMPTS {
                attempt += 1;

                let chosen = match self.find_one_least_used_server() {
                    Some(id) => id,
                    None => {
                        early_quit = true;
                        break;
                    }
                };
                let chosen_machine = self.servers[&chosen].machine.clone();
                let mt_id = match self.find_random_machine_team_for(chosen) {
                    Some(mt_id) => mt_id,
                    None => {
                        // temporarily no healthy machine team for this server
                        continue;
                    }
                };

                let mut candidate: Vec<ServerId> = Vec::new();
                let member_machines = self.machine_teams[&mt_id].machine_ids.clone();
                let mut usable = true;
                for mid in &member_machines {
                    if Some(mid) == chosen_machine.as_ref() {
                        candidate.push(chosen);
                        continue;
                    }
                    let healthy: Vec<ServerId> = self.machines[mid]
                        .servers
                        .iter()
                        .filter(|&sid| !self.server_status[sid].is_unhealthy())
                        .copied()
                        .collect();
                    match healthy.choose(&mut self.rng) {
                        Some(&sid) => candidate.push(sid),
                        None => {
                            usable = false;
                            break;
                        }
                    }
                }
                if !usable || candidate.len() != self.cfg.team_size {
                    continue;
                }
                candidate.sort();

                let overlap = self.overlapping_members(&candidate);
                if overlap == candidate.len() {
                    max_attempts = (max_attempts + 1).min(MAX_TEAM_ATTEMPTS);
                    continue;
                }

                // balance the number of teams per server; changing this
                // metric risks endless create/remove oscillation against the
                // removers
                let mut score = self.knobs.overlap_penalty * overlap;
                for sid in &candidate {
                    score += self.servers[sid].teams.len();
                }
                if score < best_score {
                    best_score = score;
                    best = Some(candidate);
                }
            }

            if early_quit {
                break;
            }
            match best {
                Some(candidate) => {
                    self.add_team(&candidate, false, false);
                    added += 1;
                }
                None => {
                    self.last_build_teams_failed = true;
                    break;
                }
            }
        }

        region_info!(self.tag(),
            "built {} teams (to_build={} desired={} max={}): teams={} machine_teams={}",
            added, teams_to_build, desired_teams, max_teams,
            self.teams.len(), self.machine_teams.len());
        added
    }

    /// Computes how many teams are missing and builds them. Teams are only
    /// ever added here; removal is the removers' and trackers' business.
    /// Soft-fails (setting `last_build_teams_failed`) when the topology
    /// cannot support new teams.
    pub fn build_teams(&mut self) {
        self.do_build_teams = false;

        let mut server_count = 0;
        let mut machines: BTreeSet<MachineId> = BTreeSet::new();
        for (id, server) in &self.servers {
            if !self.server_status[id].is_unhealthy() {
                server_count += 1;
                if let Some(zone) = server.interface.locality.zone_id() {
                    machines.insert(zone);
                }
            }
        }
        let unique_machines = machines.len();
        region_debug!(self.tag(),
            "build teams: servers={} unique_machines={} team_size={}",
            server_count, unique_machines, self.cfg.team_size);

        if unique_machines < self.cfg.team_size {
            // not enough machines to even form one correct team
            self.last_build_teams_failed = true;
            return;
        }

        let desired_teams = self.knobs.desired_teams_per_server * server_count;
        let max_teams = self.knobs.max_teams_per_server * server_count;

        // teams in the wrong configuration don't count toward targets
        let mut healthy_count = 0;
        let mut total_count = 0;
        for team in self.teams.values() {
            if !team.wrong_configuration {
                if team.healthy {
                    healthy_count += 1;
                }
                total_count += 1;
            }
        }

        // bounded from both sides so a transient all-unhealthy blip does not
        // over-build
        let teams_to_build = desired_teams
            .saturating_sub(healthy_count)
            .min(max_teams.saturating_sub(total_count));

        self.last_build_teams_failed = false;
        if teams_to_build > 0 || self.not_enough_teams_for_a_server() {
            let added = self.add_teams_best_of(teams_to_build, desired_teams, max_teams);
            if added == 0 && self.teams.is_empty() {
                region_warn!(self.tag(), "no server team after building");
            }
        }
    }
}

#[cfg(test)]
mod builder_tests {
    use super::*;
    use crate::collection::testkit;
    use crate::utils::BallastError;

    /// 60 processes over 12 zones, replication across 3 zones.
    #[test]
    fn build_from_scratch_spans_zones() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 42);
        let mut servers = Vec::new();
        for i in 0..60u64 {
            servers.push((i + 1, format!("z{}", i % 12)));
        }
        let refs: Vec<(u64, &str)> =
            servers.iter().map(|(i, z)| (*i, z.as_str())).collect();
        testkit::add_servers(&mut tc, &refs)?;

        tc.build_teams();

        let desired = 5 * 60;
        let max = 10 * 60;
        assert!(tc.team_count() >= desired.min(max));
        assert!(tc.team_count() <= max);
        assert!(!tc.last_build_teams_failed());

        // every team spans three distinct zones
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

        // every server belongs to at least one team
        for id in tc.server_ids() {
            assert!(!tc.server(id).unwrap().teams.is_empty());
        }
        tc.sanity_check()
    }

    #[test]
    fn build_is_idempotent_at_target() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 42);
        let mut servers = Vec::new();
        for i in 0..12u64 {
            servers.push((i + 1, format!("z{}", i % 4)));
        }
        let refs: Vec<(u64, &str)> =
            servers.iter().map(|(i, z)| (*i, z.as_str())).collect();
        testkit::add_servers(&mut tc, &refs)?;

        tc.build_teams();
        let first = tc.team_count();
        tc.build_teams();
        assert_eq!(tc.team_count(), first);
        tc.sanity_check()
    }

    #[test]
    fn too_few_machines_builds_nothing() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 42);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z0"), (3, "z1")])?;
        tc.build_teams();
        assert_eq!(tc.team_count(), 0);
        assert!(tc.last_build_teams_failed());
        Ok(())
    }

    #[test]
    fn replication_of_one_makes_singletons() -> Result<(), BallastError> {
        let mut tc = testkit::collection(1, 42);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z0"), (3, "z0")])?;
        tc.build_teams();

        assert!(tc.team_count() >= 3);
        for team in tc.teams() {
            assert_eq!(team.size(), 1);
        }
        tc.sanity_check()
    }

    #[test]
    fn teams_balance_across_servers() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 7);
        let mut servers = Vec::new();
        for i in 0..24u64 {
            servers.push((i + 1, format!("z{}", i % 8)));
        }
        let refs: Vec<(u64, &str)> =
            servers.iter().map(|(i, z)| (*i, z.as_str())).collect();
        testkit::add_servers(&mut tc, &refs)?;

        tc.build_teams();

        let target = tc.target_teams_per_server();
        for id in tc.server_ids() {
            assert!(tc.server(id).unwrap().teams.len() >= target);
        }
        tc.sanity_check()
    }
}

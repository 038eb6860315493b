//! Membership registry: servers, machines, server teams, machine teams, and
//! the edges between them. Every mutation here keeps the back-pointer
//! symmetry invariants; `sanity_check` is their executable statement.

use crate::collection::TeamCollection;
use crate::external::{ProcessClass, StorageInterface, StorageMetrics, StoreType};
use crate::model::{
    MachineId, MachineTeamId, ServerId, ServerStatus, TeamId, TeamPriority, Version,
};
use crate::utils::BallastError;

/// A storage server known to the registry.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: ServerId,
    pub interface: StorageInterface,
    pub class: ProcessClass,
    pub added_version: Version,

    /// Learned lazily from the server; `None` until its first reply.
    pub store_type: Option<StoreType>,
    pub in_desired_dc: bool,

    /// Machine this server currently counts toward; `None` only for testing
    /// servers and servers whose machine was just torn down mid-move.
    pub machine: Option<MachineId>,

    /// Every server team containing this server.
    pub teams: Vec<TeamId>,

    pub metrics: Option<StorageMetrics>,
    pub data_in_flight: i64,

    pub version_too_far_behind: bool,
    pub wrong_store_type_to_remove: bool,
}

impl ServerInfo {
    pub(crate) fn new(
        interface: StorageInterface,
        class: ProcessClass,
        added_version: Version,
        in_desired_dc: bool,
    ) -> Self {
        ServerInfo {
            id: interface.id,
            interface,
            class,
            added_version,
            store_type: None,
            in_desired_dc,
            machine: None,
            teams: Vec::new(),
            metrics: None,
            data_in_flight: 0,
            version_too_far_behind: false,
            wrong_store_type_to_remove: false,
        }
    }

    /// A freshly recruited server may not have reported its store type yet;
    /// only a reported mismatch counts as wrong.
    pub fn is_correct_store_type(&self, configured: StoreType) -> bool {
        match self.store_type {
            Some(st) => st == configured,
            None => true,
        }
    }
}

/// A machine: the servers sharing one zone/machine identity.
#[derive(Debug, Clone, Default)]
pub struct MachineInfo {
    pub id: MachineId,
    pub servers: Vec<ServerId>,
    pub machine_teams: Vec<MachineTeamId>,
}

/// A server team. Member list is kept sorted by server id; equality between
/// teams is equality of those sorted lists.
#[derive(Debug, Clone)]
pub struct TeamInfo {
    pub id: TeamId,
    pub servers: Vec<ServerId>,
    pub machine_team: Option<MachineTeamId>,

    // cached tracker state
    pub healthy: bool,
    pub optimal: bool,
    pub wrong_configuration: bool,
    pub priority: TeamPriority,

    pub is_bad: bool,
    pub is_redundant: bool,
}

impl TeamInfo {
    pub(crate) fn new(id: TeamId, mut servers: Vec<ServerId>) -> Self {
        servers.sort();
        TeamInfo {
            id,
            servers,
            machine_team: None,
            healthy: false,
            optimal: false,
            wrong_configuration: false,
            priority: TeamPriority::Healthy,
            is_bad: false,
            is_redundant: false,
        }
    }

    pub fn size(&self) -> usize {
        self.servers.len()
    }

    pub fn desc(&self) -> String {
        let ids: Vec<String> = self.servers.iter().map(|s| s.short()).collect();
        format!("{}[{}]", self.id, ids.join(" "))
    }
}

/// A machine team: the projection of server teams onto machines. Member
/// machine ids are kept sorted.
#[derive(Debug, Clone)]
pub struct MachineTeamInfo {
    pub id: MachineTeamId,
    pub machine_ids: Vec<MachineId>,
    pub server_teams: Vec<TeamId>,
}

impl MachineTeamInfo {
    pub(crate) fn new(id: MachineTeamId, mut machine_ids: Vec<MachineId>) -> Self {
        machine_ids.sort();
        MachineTeamInfo {
            id,
            machine_ids,
            server_teams: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.machine_ids.len()
    }
}

/// Side effects of a server removal the supervisor must act on.
#[derive(Debug, Default)]
pub struct RemovalOutcome {
    /// Teams (live and bad) that went away with the server.
    pub dropped_teams: Vec<TeamId>,

    /// Machine that became empty and was torn down.
    pub removed_machine: Option<MachineId>,

    /// The removed server had been marked for wrong-store-type removal;
    /// another scan pass may be due.
    pub had_wrong_store_type: bool,
}

impl TeamCollection {
    /// Whether this region's collection is responsible for a server at all.
    pub(crate) fn should_handle(&self, interface: &StorageInterface) -> bool {
        if self.cfg.included_dcs.is_empty() {
            return true;
        }
        match interface.locality.dc_id() {
            Some(dc) => self.cfg.included_dcs.iter().any(|d| d == dc),
            None => true,
        }
    }

    /// Adds a newly discovered or recruited server. Testing servers join no
    /// machine and no team; they only link to their pair. Rejects duplicate
    /// ids with a warning.
    pub fn add_server(
        &mut self,
        interface: StorageInterface,
        class: ProcessClass,
        added_version: Version,
    ) -> Result<(), BallastError> {
        if !self.should_handle(&interface) {
            return Ok(());
        }
        let id = interface.id;
        if self.servers.contains_key(&id) || self.testing_servers.contains_key(&id) {
            return region_fail!(self.tag(), "add of duplicate server {}", id);
        }

        let in_desired_dc = self.cfg.included_dcs.is_empty()
            || interface
                .locality
                .dc_id()
                .map(|dc| self.cfg.included_dcs.iter().any(|d| d == dc))
                .unwrap_or(false);
        let locality = interface.locality.clone();
        let is_testing = interface.is_testing();
        let info = ServerInfo::new(interface, class, added_version, in_desired_dc);

        region_info!(self.tag(), "added {} server {} on {} at {}",
                 if is_testing { "testing" } else { "storage" },
                 id.short(), locality, info.interface.address);

        if is_testing {
            let pair = info.interface.pair_of.unwrap();
            self.testing_by_pair.insert(pair, id);
            self.testing_servers.insert(id, info);
        } else {
            if let Some(pid) = locality.process_id() {
                self.pid_index.entry(pid).or_default().push(id);
            }
            self.servers.insert(id, info);
            self.check_and_create_machine(id)?;
            // adding a server is what makes new teams possible
            self.do_build_teams = true;
        }

        self.server_status
            .insert(id, ServerStatus::new(false, false, false, locality));
        Ok(())
    }

    /// Ensures the server's machine exists and that both directions of the
    /// server ↔ machine link are set.
    pub fn check_and_create_machine(
        &mut self,
        id: ServerId,
    ) -> Result<MachineId, BallastError> {
        let machine_id = {
            let server = self
                .servers
                .get(&id)
                .ok_or_else(|| BallastError::msg(format!("unknown server {}", id)))?;
            server.interface.locality.zone_id().ok_or_else(|| {
                BallastError::msg(format!("server {} has no zone locality", id))
            })?
        };

        let machine = self.machines.entry(machine_id.clone()).or_insert_with(|| {
            MachineInfo {
                id: machine_id.clone(),
                ..Default::default()
            }
        });
        if !machine.servers.contains(&id) {
            machine.servers.push(id);
        }
        self.servers.get_mut(&id).unwrap().machine = Some(machine_id.clone());
        Ok(machine_id)
    }

    /// Looks up a machine team by its sorted member machine ids.
    pub fn find_machine_team(&self, machine_ids: &[MachineId]) -> Option<MachineTeamId> {
        self.machine_teams
            .values()
            .find(|mt| mt.machine_ids == machine_ids)
            .map(|mt| mt.id)
    }

    /// Creates a machine team over the given machines and wires it to them.
    pub fn add_machine_team(&mut self, mut machine_ids: Vec<MachineId>) -> MachineTeamId {
        machine_ids.sort();
        let id = MachineTeamId(self.next_machine_team_id);
        self.next_machine_team_id += 1;

        for mid in &machine_ids {
            match self.machines.get_mut(mid) {
                Some(machine) => machine.machine_teams.push(id),
                None => {
                    region_warn!(self.tag(), "machine team member {} does not exist", mid)
                }
            }
        }
        self.machine_teams
            .insert(id, MachineTeamInfo::new(id, machine_ids));
        id
    }

    /// Finds (or creates) the machine team matching a server team's members.
    pub fn check_and_create_machine_team(
        &mut self,
        team_id: TeamId,
    ) -> Result<MachineTeamId, BallastError> {
        let mut machine_ids = Vec::new();
        let members = self.teams[&team_id].servers.clone();
        for sid in &members {
            match self.servers.get(sid).and_then(|s| s.machine.clone()) {
                Some(mid) => machine_ids.push(mid),
                None => {
                    return region_fail!(self.tag(),
                        "team {} member {} has no machine", team_id, sid);
                }
            }
        }
        machine_ids.sort();

        let mt_id = match self.find_machine_team(&machine_ids) {
            Some(mt_id) => mt_id,
            None => self.add_machine_team(machine_ids),
        };
        if !self.machine_teams[&mt_id].server_teams.contains(&team_id) {
            self.machine_teams
                .get_mut(&mt_id)
                .unwrap()
                .server_teams
                .push(team_id);
        }
        self.teams.get_mut(&team_id).unwrap().machine_team = Some(mt_id);
        Ok(mt_id)
    }

    /// Adds a server team. Teams of the wrong size, teams violating the
    /// policy, and explicitly redundant teams become bad teams: tracked for
    /// draining but not wired into the membership graph.
    pub fn add_team(
        &mut self,
        members: &[ServerId],
        is_initial: bool,
        redundant: bool,
    ) -> TeamId {
        let members: Vec<ServerId> = members
            .iter()
            .filter(|&id| self.servers.contains_key(id))
            .copied()
            .collect();

        let id = TeamId(self.next_team_id);
        self.next_team_id += 1;
        let mut team = TeamInfo::new(id, members);

        let bad = redundant
            || team.size() != self.cfg.team_size
            || !self.satisfies_policy(&team.servers);
        team.is_bad = bad;
        team.is_redundant = redundant;

        if bad {
            if team.size() != self.cfg.team_size && !redundant && !is_initial {
                region_warn!(self.tag(), "built team {} with wrong size {}",
                         team.desc(), team.size());
            }
            self.bad_teams.insert(id, team);
            self.refresh_team_status(id);
            return id;
        }

        for sid in team.servers.clone() {
            self.servers.get_mut(&sid).unwrap().teams.push(id);
        }
        self.teams.insert(id, team);

        if let Err(e) = self.check_and_create_machine_team(id) {
            // only an empty initial team may legitimately lack machines
            region_warn!(self.tag(), "no machine team for {}: {}", id, e);
        }

        self.refresh_team_status(id);
        id
    }

    /// Whether the (sorted) member localities satisfy the replication policy.
    /// A team size of one bypasses the policy entirely.
    pub fn satisfies_policy(&self, members: &[ServerId]) -> bool {
        if self.cfg.team_size == 1 {
            return !members.is_empty();
        }
        let localities: Vec<_> = members
            .iter()
            .filter_map(|id| self.servers.get(id))
            .map(|s| &s.interface.locality)
            .collect();
        if localities.len() != members.len() {
            return false;
        }
        self.cfg.policy.satisfied_by(&localities)
    }

    /// Unwires a live team from servers and its machine team and returns it.
    /// The caller decides whether it comes back as a bad team or disappears.
    pub fn remove_team(&mut self, team_id: TeamId) -> Option<TeamInfo> {
        let team = self.teams.remove(&team_id)?;

        for sid in &team.servers {
            if let Some(server) = self.servers.get_mut(sid) {
                server.teams.retain(|&t| t != team_id);
            }
        }
        if let Some(mt_id) = team.machine_team {
            if let Some(mt) = self.machine_teams.get_mut(&mt_id) {
                mt.server_teams.retain(|&t| t != team_id);
            }
        }

        // retire cached tracker state
        if team.healthy {
            self.healthy_team_count -= 1;
        }
        if team.optimal {
            self.optimal_team_count -= 1;
        }
        self.board.forget(self.region, &team.servers);

        region_debug!(self.tag(), "removed server team {}", team.desc());
        Some(team)
    }

    /// Removes a machine team, unwiring it from its machines. Any server
    /// team still pointing at it loses its projection.
    pub fn remove_machine_team(&mut self, mt_id: MachineTeamId) -> bool {
        let mt = match self.machine_teams.remove(&mt_id) {
            Some(mt) => mt,
            None => return false,
        };
        for mid in &mt.machine_ids {
            if let Some(machine) = self.machines.get_mut(mid) {
                machine.machine_teams.retain(|&t| t != mt_id);
            }
        }
        for team_id in &mt.server_teams {
            if let Some(team) = self.teams.get_mut(team_id) {
                team.machine_team = None;
            }
        }
        true
    }

    /// Removes a machine and every machine team containing it.
    pub fn remove_machine(&mut self, machine_id: &MachineId) {
        let machine = match self.machines.remove(machine_id) {
            Some(m) => m,
            None => return,
        };
        for mt_id in machine.machine_teams {
            self.remove_machine_team(mt_id);
        }
        region_debug!(self.tag(), "removed machine {}", machine_id);
    }

    /// Permanently removes a regular server: teams first, then machine, then
    /// the machine's teams if it became empty. Unknown ids are a warned
    /// no-op.
    pub fn remove_server(&mut self, id: ServerId) -> RemovalOutcome {
        let mut outcome = RemovalOutcome::default();
        let info = match self.servers.get(&id) {
            Some(info) => info.clone(),
            None => {
                region_warn!(self.tag(), "remove of unknown server {}", id);
                return outcome;
            }
        };

        // process-id index
        if let Some(pid) = info.interface.locality.process_id() {
            if let Some(vec) = self.pid_index.get_mut(&pid) {
                vec.retain(|&s| s != id);
                if vec.is_empty() {
                    self.pid_index.remove(&pid);
                }
            }
        }

        // teams containing the server go first
        for team_id in info.teams.clone() {
            if self.remove_team(team_id).is_some() {
                outcome.dropped_teams.push(team_id);
            }
        }
        let bad_with_server: Vec<TeamId> = self
            .bad_teams
            .iter()
            .filter(|(_, t)| t.servers.contains(&id))
            .map(|(&tid, _)| tid)
            .collect();
        for team_id in bad_with_server {
            self.bad_teams.remove(&team_id);
            outcome.dropped_teams.push(team_id);
        }

        // then the machine link
        if let Some(machine_id) = info.machine {
            let emptied = match self.machines.get_mut(&machine_id) {
                Some(machine) => {
                    machine.servers.retain(|&s| s != id);
                    machine.servers.is_empty()
                }
                None => false,
            };
            if emptied {
                self.remove_machine(&machine_id);
                outcome.removed_machine = Some(machine_id);
            }
        }

        outcome.had_wrong_store_type = info.wrong_store_type_to_remove;

        if self
            .server_status
            .remove(&id)
            .map(|st| st.is_unhealthy())
            .unwrap_or(false)
        {
            self.unhealthy_servers -= 1;
        }
        self.servers.remove(&id);

        self.do_build_teams = true;
        region_info!(self.tag(), "removed storage server {}; teams={} machines={}",
                 id.short(), self.teams.len(), self.machines.len());
        outcome
    }

    /// Removes a testing server. It participates in no team, so this only
    /// clears the pair link and the status entry.
    pub fn remove_testing_server(&mut self, id: ServerId) {
        let info = match self.testing_servers.remove(&id) {
            Some(info) => info,
            None => {
                region_warn!(self.tag(), "remove of unknown testing server {}", id);
                return;
            }
        };
        if let Some(pair) = info.interface.pair_of {
            self.testing_by_pair.remove(&pair);
        }
        if self
            .server_status
            .remove(&id)
            .map(|st| st.is_unhealthy())
            .unwrap_or(false)
        {
            self.unhealthy_servers -= 1;
        }
        region_info!(self.tag(), "removed testing server {}", id.short());
    }

    /// A machine is healthy iff at least one of its servers is neither
    /// failed nor undesired.
    pub fn is_machine_healthy(&self, machine_id: &MachineId) -> bool {
        match self.machines.get(machine_id) {
            Some(machine) if !machine.servers.is_empty() => machine
                .servers
                .iter()
                .any(|sid| !self.server_status[sid].is_unhealthy()),
            _ => false,
        }
    }

    /// A machine team is healthy iff it has the configured size and every
    /// member machine is healthy.
    pub fn is_machine_team_healthy(&self, mt: &MachineTeamInfo) -> bool {
        mt.size() == self.cfg.team_size
            && mt.machine_ids.iter().all(|m| self.is_machine_healthy(m))
    }

    /// Verifies the registry invariants; returns an error naming the first
    /// violated one.
    pub fn sanity_check(&self) -> Result<(), BallastError> {
        let mut teams_per_server: usize = 0;
        for (id, server) in &self.servers {
            for team_id in &server.teams {
                let team = self.teams.get(team_id).ok_or_else(|| {
                    BallastError::msg(format!("server {} points at dead team", id))
                })?;
                if !team.servers.contains(id) {
                    return region_fail!(self.tag(),
                        "back-pointer asymmetry between {} and {}", id, team_id);
                }
            }
            teams_per_server += server.teams.len();
        }

        for (team_id, team) in &self.teams {
            let mut sorted = team.servers.clone();
            sorted.sort();
            if sorted != team.servers {
                return region_fail!(self.tag(), "team {} members unsorted", team_id);
            }
            if team.size() != self.cfg.team_size {
                return region_fail!(self.tag(),
                    "live team {} has size {}", team_id, team.size());
            }
            if !self.satisfies_policy(&team.servers) {
                return region_fail!(self.tag(),
                    "live team {} violates policy", team_id);
            }
            for sid in &team.servers {
                if !self.servers[sid].teams.contains(team_id) {
                    return region_fail!(self.tag(),
                        "server {} missing team {}", sid, team_id);
                }
            }

            // machine team projection
            let mt_id = team.machine_team.ok_or_else(|| {
                BallastError::msg(format!("team {} has no machine team", team_id))
            })?;
            let mt = &self.machine_teams[&mt_id];
            let mut expected: Vec<MachineId> = team
                .servers
                .iter()
                .filter_map(|sid| self.servers[sid].machine.clone())
                .collect();
            expected.sort();
            if expected != mt.machine_ids {
                return region_fail!(self.tag(),
                    "team {} projection mismatch with {}", team_id, mt_id);
            }
            if !mt.server_teams.contains(team_id) {
                return region_fail!(self.tag(),
                    "machine team {} missing server team {}", mt_id, team_id);
            }
        }

        if teams_per_server != self.cfg.team_size * self.teams.len() {
            return region_fail!(self.tag(),
                "team membership total {} != {} x {}",
                teams_per_server, self.cfg.team_size, self.teams.len());
        }

        for (mid, machine) in &self.machines {
            for sid in &machine.servers {
                if self.servers[sid].machine.as_ref() != Some(mid) {
                    return region_fail!(self.tag(),
                        "machine {} and server {} disagree", mid, sid);
                }
            }
            for mt_id in &machine.machine_teams {
                if !self.machine_teams[mt_id].machine_ids.contains(mid) {
                    return region_fail!(self.tag(),
                        "machine {} points at foreign machine team {}", mid, mt_id);
                }
            }
        }

        let healthy = self.teams.values().filter(|t| t.healthy).count();
        if healthy != self.healthy_team_count {
            return region_fail!(self.tag(),
                "healthy team counter {} != {}", self.healthy_team_count, healthy);
        }

        Ok(())
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::collection::testkit;

    #[test]
    fn add_remove_server_round_trip() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 1);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z0"), (3, "z1")])?;
        assert_eq!(tc.server_count(), 3);
        assert_eq!(tc.machine_count(), 2);

        // removing one server of a shared machine keeps the machine
        tc.remove_server(ServerId::from(1));
        assert_eq!(tc.machine_count(), 2);

        // removing the last server on a machine removes the machine
        tc.remove_server(ServerId::from(2));
        assert_eq!(tc.machine_count(), 1);
        tc.sanity_check()
    }

    #[test]
    fn duplicate_add_rejected() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 1);
        testkit::add_servers(&mut tc, &[(1, "z0")])?;
        let interface = testkit::interface(1, "z0");
        assert!(tc
            .add_server(interface, ProcessClass::Storage, 0)
            .is_err());
        Ok(())
    }

    #[test]
    fn remove_unknown_is_noop() {
        let mut tc = testkit::collection(3, 1);
        let outcome = tc.remove_server(ServerId::from(99));
        assert!(outcome.dropped_teams.is_empty());
        assert!(outcome.removed_machine.is_none());
    }

    #[test]
    fn add_team_wires_graph_both_ways() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 1);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1"), (3, "z2")])?;
        let team_id = tc.add_team(
            &[ServerId::from(1), ServerId::from(2), ServerId::from(3)],
            true,
            false,
        );
        assert_eq!(tc.team_count(), 1);
        assert_eq!(tc.machine_team_count(), 1);
        tc.sanity_check()?;

        let team = tc.team(team_id).unwrap().clone();
        tc.remove_team(team_id);
        assert_eq!(tc.team_count(), 0);
        for sid in &team.servers {
            assert!(tc.server(*sid).unwrap().teams.is_empty());
        }
        tc.sanity_check()
    }

    #[test]
    fn undersized_team_goes_bad() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 1);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z1")])?;
        tc.add_team(&[ServerId::from(1), ServerId::from(2)], true, false);
        assert_eq!(tc.team_count(), 0);
        assert_eq!(tc.bad_team_count(), 1);
        tc.sanity_check()
    }

    #[test]
    fn policy_violating_team_goes_bad() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 1);
        testkit::add_servers(&mut tc, &[(1, "z0"), (2, "z0"), (3, "z1")])?;
        tc.add_team(
            &[ServerId::from(1), ServerId::from(2), ServerId::from(3)],
            true,
            false,
        );
        assert_eq!(tc.team_count(), 0);
        assert_eq!(tc.bad_team_count(), 1);
        Ok(())
    }

    #[test]
    fn removing_server_removes_its_teams_and_machine_teams() -> Result<(), BallastError>
    {
        let mut tc = testkit::collection(3, 1);
        testkit::add_servers(
            &mut tc,
            &[(1, "z0"), (2, "z1"), (3, "z2"), (4, "z3")],
        )?;
        tc.add_team(
            &[ServerId::from(1), ServerId::from(2), ServerId::from(3)],
            true,
            false,
        );
        tc.add_team(
            &[ServerId::from(2), ServerId::from(3), ServerId::from(4)],
            true,
            false,
        );
        assert_eq!(tc.team_count(), 2);
        assert_eq!(tc.machine_team_count(), 2);

        let outcome = tc.remove_server(ServerId::from(2));
        assert_eq!(outcome.dropped_teams.len(), 2);
        assert_eq!(tc.team_count(), 0);
        // machine z1 became empty, taking its machine teams with it
        assert_eq!(outcome.removed_machine, Some(MachineId::from("z1")));
        assert_eq!(tc.machine_team_count(), 0);
        tc.sanity_check()
    }

    #[test]
    fn testing_server_joins_nothing() -> Result<(), BallastError> {
        let mut tc = testkit::collection(3, 1);
        testkit::add_servers(&mut tc, &[(1, "z0")])?;

        let mut interface = testkit::interface(100, "z0");
        interface.pair_of = Some(ServerId::from(1));
        tc.add_server(interface, ProcessClass::Storage, 0)?;

        assert_eq!(tc.server_count(), 1);
        assert_eq!(tc.testing_server_count(), 1);
        assert_eq!(tc.machine_count(), 1);
        assert_eq!(tc.testing_pair_of(ServerId::from(1)), Some(ServerId::from(100)));

        tc.remove_testing_server(ServerId::from(100));
        assert_eq!(tc.testing_server_count(), 0);
        assert_eq!(tc.testing_pair_of(ServerId::from(1)), None);
        Ok(())
    }
}

//! Per-team health tracking: recomputes a team's cached status bits and its
//! relocation priority whenever a member's status may have changed, emits
//! `RelocateShard` requests on degradation, and maintains the region-wide
//! healthy/optimal team counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::collection::TeamCollection;
use crate::external::{KeyRange, RelocateShard, ShardTracker};
use crate::model::{Region, ServerId, ServerStatus, TeamId, TeamPriority};

use tokio::time::{self, Duration};

/// Cross-region team-priority lookaside. Each region publishes only its own
/// teams; lookups from the sibling region are read-only and may find
/// nothing, in which case callers fall back to a pessimistic priority.
#[derive(Debug, Default)]
pub struct PriorityBoard {
    map: Mutex<HashMap<(Region, Vec<ServerId>), TeamPriority>>,
}

impl PriorityBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, region: Region, servers: &[ServerId], priority: TeamPriority) {
        let mut key = servers.to_vec();
        key.sort();
        self.map.lock().unwrap().insert((region, key), priority);
    }

    pub fn forget(&self, region: Region, servers: &[ServerId]) {
        let mut key = servers.to_vec();
        key.sort();
        self.map.lock().unwrap().remove(&(region, key));
    }

    pub fn lookup(&self, region: Region, servers: &[ServerId]) -> Option<TeamPriority> {
        let mut key = servers.to_vec();
        key.sort();
        self.map.lock().unwrap().get(&(region, key)).copied()
    }
}

/// What a refresh pass observed about one team.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TeamDelta {
    pub priority_changed: bool,

    /// The team just lost its last live member.
    pub entered_zero_left: bool,

    /// The team regained a member after having none.
    pub left_zero_left: bool,
}

impl TeamCollection {
    fn status_of(&self, id: &ServerId) -> ServerStatus {
        // a member whose status entry is gone is as good as failed
        self.server_status.get(id).cloned().unwrap_or_else(|| {
            let mut st = ServerStatus::default();
            st.is_failed = true;
            st
        })
    }

    /// Whether any member's address sits in `Failed` exclusion state.
    pub fn team_contains_failed(&self, members: &[ServerId]) -> bool {
        use crate::external::ExclusionKey;
        use crate::model::ExclusionStatus;

        for sid in members {
            let interface = match self.servers.get(sid) {
                Some(s) => &s.interface,
                None => continue,
            };
            let mut keys = vec![
                ExclusionKey::from(interface.address),
                ExclusionKey::wildcard(interface.address.ip()),
            ];
            if let Some(second) = interface.secondary_address {
                keys.push(ExclusionKey::from(second));
                keys.push(ExclusionKey::wildcard(second.ip()));
            }
            if keys.iter().any(|k| {
                self.exclusions.get(k).copied().unwrap_or_default()
                    == ExclusionStatus::Failed
            }) {
                return true;
            }
        }
        false
    }

    /// Recomputes one team's cached bits and priority from the status map,
    /// updates the healthy/optimal counters on transitions, and emits
    /// relocations when the degradation level changed.
    pub(crate) fn refresh_team_status(&mut self, team_id: TeamId) -> TeamDelta {
        let mut delta = TeamDelta::default();
        let (members, is_bad, is_redundant, old_healthy, old_optimal, old_priority) = {
            let team = match self.teams.get(&team_id).or_else(|| self.bad_teams.get(&team_id)) {
                Some(team) => team,
                None => return delta,
            };
            (
                team.servers.clone(),
                team.is_bad,
                team.is_redundant,
                team.healthy,
                team.optimal,
                team.priority,
            )
        };

        let mut servers_left = 0;
        let mut undesired = 0;
        let mut wrong_configuration = 0;
        let mut wiggling = 0;
        for sid in &members {
            let st = self.status_of(sid);
            if !st.is_failed {
                servers_left += 1;
            }
            if st.is_undesired {
                undesired += 1;
            }
            if st.is_wrong_configuration {
                wrong_configuration += 1;
            }
            if st.is_wiggling {
                wiggling += 1;
            }
        }
        let any_undesired = undesired > 0;
        let any_wrong = wrong_configuration > 0;
        let any_wiggling = wiggling > 0;

        let healthy =
            !is_bad && !any_undesired && servers_left == self.cfg.team_size;
        let optimal = healthy
            && members.iter().all(|sid| {
                self.servers
                    .get(sid)
                    .map(|s| s.class.fits_storage())
                    .unwrap_or(false)
            });
        let contains_failed = self.team_contains_failed(&members);

        if healthy != old_healthy {
            if healthy {
                self.healthy_team_count += 1;
            } else {
                self.healthy_team_count -= 1;
                if self.healthy_team_count == 0 {
                    region_warn!(self.tag(), "zero healthy server teams left, signalling");
                }
            }
        }
        if optimal != old_optimal {
            if optimal {
                self.optimal_team_count += 1;
            } else {
                self.optimal_team_count -= 1;
            }
        }

        let priority = if members.is_empty() {
            TeamPriority::PopulateRegion
        } else if servers_left < self.cfg.team_size {
            match servers_left {
                0 => TeamPriority::ZeroLeft,
                1 => TeamPriority::OneLeft,
                2 => TeamPriority::TwoLeft,
                _ => TeamPriority::Unhealthy,
            }
        } else if !is_bad
            && any_wiggling
            && wiggling == wrong_configuration
            && wiggling == undesired
        {
            // the only wrong-configured, undesired members are the wiggling
            // ones; this is a rolling restart, not a failure
            TeamPriority::Wiggle
        } else if is_bad || any_wrong {
            if is_redundant {
                TeamPriority::Redundant
            } else {
                TeamPriority::Unhealthy
            }
        } else if any_undesired {
            TeamPriority::ContainsUndesired
        } else {
            TeamPriority::Healthy
        };
        // a member in failed exclusion state pins the team at least at the
        // failed level, whatever the ladder said
        let priority = if contains_failed {
            priority.max(TeamPriority::Failed)
        } else {
            priority
        };

        delta.priority_changed = priority != old_priority;
        delta.entered_zero_left =
            priority == TeamPriority::ZeroLeft && old_priority != TeamPriority::ZeroLeft;
        delta.left_zero_left =
            old_priority == TeamPriority::ZeroLeft && priority != TeamPriority::ZeroLeft;

        // write the cached bits back
        {
            let team = self
                .teams
                .get_mut(&team_id)
                .or_else(|| self.bad_teams.get_mut(&team_id))
                .unwrap();
            team.healthy = healthy;
            team.optimal = optimal;
            team.wrong_configuration = any_wrong;
            team.priority = priority;
        }
        if !is_bad {
            self.board.publish(self.region, &members, priority);
        }

        if delta.priority_changed {
            let severity_zero = priority == TeamPriority::ZeroLeft;
            if severity_zero {
                region_error!(self.tag(),
                    "team {} priority now {}: no replicas remain of some data",
                    team_id, priority);
            } else {
                region_debug!(self.tag(), "team {} priority {} -> {}",
                          team_id, old_priority, priority);
            }
        }

        // emit relocations on degradation-level changes; a failed member
        // bypasses the initial-reaction and zero-healthy gates
        let gate_open =
            (self.reaction_ready && self.healthy_team_count > 0) || contains_failed;
        if (delta.priority_changed || contains_failed) && gate_open {
            self.emit_relocations(&members, priority, is_redundant, contains_failed);
        }

        delta
    }

    /// Emits one `RelocateShard` per shard currently assigned to the team.
    fn emit_relocations(
        &mut self,
        members: &[ServerId],
        own_priority: TeamPriority,
        redundant: bool,
        contains_failed: bool,
    ) {
        let ranges = self
            .shards
            .shards_for_team(members, self.region.is_primary());
        for range in ranges {
            let priority = self.relocation_priority(
                &range,
                own_priority,
                redundant,
                contains_failed,
            );
            region_debug!(self.tag(), "relocating {} at priority {}", range, priority);
            let _ = self.relocations.send(RelocateShard {
                keys: range,
                priority,
            });
        }
    }

    /// A shard may be mapped to several teams (mid-move, or in the sibling
    /// region); its relocation priority is the worst across all of them. A
    /// failed member forces the failed level outright.
    fn relocation_priority(
        &self,
        range: &KeyRange,
        own_priority: TeamPriority,
        redundant: bool,
        contains_failed: bool,
    ) -> TeamPriority {
        if contains_failed {
            return TeamPriority::Failed;
        }
        let mut max_priority = own_priority;
        for team in self.shards.teams_for_shard(range) {
            if max_priority >= TeamPriority::Failed {
                break;
            }
            if team.servers.is_empty() {
                max_priority = max_priority.max(TeamPriority::PopulateRegion);
                continue;
            }
            let region = if team.primary {
                Region::Primary
            } else {
                Region::Remote
            };
            let found = self.board.lookup(region, &team.servers);
            let p = found.unwrap_or(if redundant {
                TeamPriority::Redundant
            } else {
                TeamPriority::Unhealthy
            });
            max_priority = max_priority.max(p);
        }
        max_priority
    }

    /// Refreshes every team (live and bad) containing the server. Returns
    /// per-team deltas so the supervisor can arm or disarm loggers.
    pub(crate) fn refresh_teams_of_server(
        &mut self,
        id: ServerId,
    ) -> Vec<(TeamId, TeamDelta)> {
        let mut team_ids: Vec<TeamId> = self
            .servers
            .get(&id)
            .map(|s| s.teams.clone())
            .unwrap_or_default();
        team_ids.extend(
            self.bad_teams
                .iter()
                .filter(|(_, t)| t.servers.contains(&id))
                .map(|(&tid, _)| tid),
        );
        team_ids
            .into_iter()
            .map(|tid| (tid, self.refresh_team_status(tid)))
            .collect()
    }

    /// Refreshes all teams; used after events with region-wide reach
    /// (exclusion list changes, the initial reaction delay elapsing).
    pub(crate) fn refresh_all_teams(&mut self) -> Vec<(TeamId, TeamDelta)> {
        let team_ids: Vec<TeamId> = self
            .teams
            .keys()
            .chain(self.bad_teams.keys())
            .copied()
            .collect();
        team_ids
            .into_iter()
            .map(|tid| (tid, self.refresh_team_status(tid)))
            .collect()
    }
}

/// Delayed data-loss report: armed when a team reaches zero live members,
/// aborted if any member comes back before the grace period ends.
pub(crate) async fn zero_left_logger(
    tag: &'static str,
    team_desc: String,
    members: Vec<ServerId>,
    primary: bool,
    shards: Arc<dyn ShardTracker>,
    grace: Duration,
) {
    time::sleep(grace).await;

    let ranges = shards.shards_for_team(&members, primary);
    let mut bytes_lost: i64 = 0;
    for range in &ranges {
        region_warn!(tag, "shard {} lost with team {}", range, team_desc);
        bytes_lost += shards.shard_bytes(range).await.unwrap_or(0);
    }
    region_error!(tag, "zero servers left in team {}: {} bytes lost across {} shards",
              team_desc, bytes_lost, ranges.len());
}

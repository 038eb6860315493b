//! External bootstrap: reads the server list and the key-server mapping out
//! of the system keyspace and reconstructs the initial team placements this
//! region starts from. Scanning is paged so a huge mapping never has to fit
//! in one transaction.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::external::{
    HealthyZone, Key, KeyRange, ServerListEntry, ShardAssignment, SystemKeyspace,
    END_KEY,
};
use crate::model::ServerId;
use crate::utils::BallastError;

use tokio::task;

/// Everything the supervisor needs to seed a fresh collection.
#[derive(Debug, Default)]
pub struct InitialClusterState {
    /// Data-distribution mode; zero means distribution is disabled and the
    /// rest of the state was not read.
    pub mode: i64,

    pub healthy_zone: Option<HealthyZone>,

    /// Regular storage servers from the server list.
    pub servers: Vec<ServerListEntry>,

    /// Testing servers, added to the registry only after teams are formed.
    pub testing_servers: Vec<ServerListEntry>,

    /// Observed placements, classified by datacenter. Teams of unusual size
    /// are preserved; the collection files them as initial teams.
    pub primary_teams: BTreeSet<Vec<ServerId>>,
    pub remote_teams: BTreeSet<Vec<ServerId>>,

    /// The raw shard map, ending with a dummy end-of-range shard.
    pub shards: Vec<ShardAssignment>,
}

/// Splits a server set into (primary, remote) halves by datacenter.
fn classify(
    ids: &[ServerId],
    server_dc: &HashMap<ServerId, Option<String>>,
    remote_dcs: &[String],
) -> (Vec<ServerId>, Vec<ServerId>) {
    let mut primary = Vec::new();
    let mut remote = Vec::new();
    for id in ids {
        let dc = server_dc.get(id).cloned().flatten();
        let is_remote = dc
            .map(|dc| remote_dcs.iter().any(|d| *d == dc))
            .unwrap_or(false);
        if is_remote {
            remote.push(*id);
        } else {
            primary.push(*id);
        }
    }
    primary.sort();
    remote.sort();
    (primary, remote)
}

/// Reads the initial cluster state. `remote_dcs` names the datacenters of
/// the remote region; when empty, every observed team is a primary team.
pub async fn load_initial_state(
    keyspace: &Arc<dyn SystemKeyspace>,
    remote_dcs: &[String],
    page_limit: usize,
) -> Result<InitialClusterState, BallastError> {
    let mut state = InitialClusterState::default();

    // an expired maintenance zone is as good as none
    let current = keyspace.current_version().await?;
    state.healthy_zone = match keyspace.read_healthy_zone().await? {
        Some(HealthyZone::Zone { zone, until_version }) if until_version > current => {
            Some(HealthyZone::Zone {
                zone,
                until_version,
            })
        }
        Some(HealthyZone::IgnoreFailures) => Some(HealthyZone::IgnoreFailures),
        _ => None,
    };

    state.mode = keyspace.read_dd_mode().await?;
    if state.mode == 0 {
        return Ok(state);
    }

    let mut server_dc: HashMap<ServerId, Option<String>> = HashMap::new();
    for entry in keyspace.read_server_list().await? {
        if entry.interface.is_testing() {
            state.testing_servers.push(entry);
        } else {
            server_dc.insert(
                entry.interface.id,
                entry.interface.locality.dc_id().map(|s| s.to_string()),
            );
            state.servers.push(entry);
        }
    }

    // walk the key-server mapping page by page, caching classifications so
    // repeated teams cost one split
    let mut team_cache: HashMap<Vec<ServerId>, (Vec<ServerId>, Vec<ServerId>)> =
        HashMap::new();
    let mut classify_cached = |ids: &[ServerId],
                               state: &mut InitialClusterState| {
        if ids.is_empty() {
            return;
        }
        let key = ids.to_vec();
        if team_cache.contains_key(&key) {
            return;
        }
        let (primary, remote) = classify(ids, &server_dc, remote_dcs);
        // an empty half still becomes a placeholder team; it is what makes
        // the region bootstrap path (populate-region priority) fire
        state.primary_teams.insert(primary.clone());
        if !remote_dcs.is_empty() {
            state.remote_teams.insert(remote.clone());
        }
        team_cache.insert(key, (primary, remote));
    };

    let mut begin: Key = Key::default();
    loop {
        let page = keyspace.read_key_servers(&begin, page_limit).await?;
        for shard in page.assignments {
            classify_cached(&shard.src, &mut state);
            classify_cached(&shard.dest, &mut state);
            state.shards.push(shard);
        }
        match page.next {
            Some(next) => {
                begin = next;
                // stay cooperative between pages
                task::yield_now().await;
            }
            None => break,
        }
    }

    // a dummy end-of-range shard simplifies every downstream range walk
    state.shards.push(ShardAssignment {
        range: KeyRange::new(END_KEY, END_KEY),
        src: Vec::new(),
        dest: Vec::new(),
    });

    Ok(state)
}

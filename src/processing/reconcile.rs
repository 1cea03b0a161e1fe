use std::collections::HashMap;

use serde::Serialize;
use tracing::debug;

use super::status::{PlayerRef, StatusResponse};
use crate::{session::query::QueryResponse, status::UnifiedStatus};

/// Extra information that only the query protocol gives us. It's kept apart
/// from the status fields since query's version and motd are less detailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryInfo {
    pub hostname: String,
    pub gametype: String,
    pub game_id: Option<String>,
    pub version: Option<String>,
    pub map: String,
    pub num_players: u32,
    pub max_players: u32,
    pub software_name: Option<String>,
    pub plugins: Vec<String>,
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
}

impl From<&QueryResponse> for QueryInfo {
    fn from(q: &QueryResponse) -> Self {
        Self {
            hostname: q.hostname.clone(),
            gametype: q.gametype.clone(),
            game_id: q.game_id.clone(),
            version: q.version.clone(),
            map: q.map.clone(),
            num_players: q.num_players,
            max_players: q.max_players,
            software_name: q.software_name.clone(),
            plugins: q.plugins.clone(),
            host_ip: q.host_ip.clone(),
            host_port: q.host_port,
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Merge a status response with an optional query response.
///
/// The status response stays authoritative for everything it has. When query
/// returned players, its list decides who's online, but players we know the
/// uuid of from the status sample keep their uuid.
pub fn reconcile(mut status: StatusResponse, query: Option<QueryResponse>) -> UnifiedStatus {
    let Some(query) = query else {
        return UnifiedStatus::online(status, None);
    };

    if !query.player_names.is_empty() {
        status.player_sample = merge_player_sample(&status.player_sample, &query.player_names);
    }

    let info = QueryInfo::from(&query);
    UnifiedStatus::online(status, Some(info))
}

pub fn merge_player_sample(sample: &[PlayerRef], query_names: &[String]) -> Vec<PlayerRef> {
    let known: HashMap<String, &PlayerRef> = sample
        .iter()
        .filter(|p| p.uuid().is_some())
        .map(|p| (normalize_name(p.name()), p))
        .collect();

    let merged = query_names
        .iter()
        .map(|name| match known.get(&normalize_name(name)) {
            Some(&player) => player.clone(),
            None => PlayerRef::Name(name.clone()),
        })
        .collect::<Vec<_>>();

    debug!(
        "merged {} query players with {} sample players ({} with uuids)",
        query_names.len(),
        sample.len(),
        merged.iter().filter(|p| p.uuid().is_some()).count()
    );
    merged
}

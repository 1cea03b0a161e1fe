use serde::{Deserialize, Serialize};
use simd_json::{
    OwnedValue,
    derived::{ValueObjectAccess, ValueObjectAccessAsArray, ValueObjectAccessAsScalar},
};
use uuid::Uuid;

use super::modpack::{ModEntry, ModpackInfo};
use crate::error::ProtocolError;

pub const ANONYMOUS_PLAYER_NAME: &str = "Anonymous Player";

/// A player from a player sample. Serializes as either `{"name", "uuid"}` or
/// just the name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PlayerRef {
    Identified { name: String, uuid: String },
    Name(String),
}

impl PlayerRef {
    pub fn name(&self) -> &str {
        match self {
            Self::Identified { name, .. } => name,
            Self::Name(name) => name,
        }
    }

    pub fn uuid(&self) -> Option<&str> {
        match self {
            Self::Identified { uuid, .. } => Some(uuid),
            Self::Name(_) => None,
        }
    }
}

/// The parsed json from a server list ping status response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub version_name: Option<String>,
    pub protocol_version: Option<i32>,
    pub players_online: Option<i32>,
    pub players_max: Option<i32>,
    pub player_sample: Vec<PlayerRef>,
    /// The description exactly as the server sent it, usually a chat
    /// component.
    pub description: Option<OwnedValue>,
    /// The description with formatting stripped.
    pub motd: String,
    pub favicon: Option<String>,
    pub enforces_secure_chat: Option<bool>,
    pub previews_chat: Option<bool>,
    pub modpack_info: Option<ModpackInfo>,
}

pub fn parse_status_response(json: &str) -> Result<StatusResponse, ProtocolError> {
    let mut d = json.as_bytes().to_vec();

    let v = match simd_json::to_owned_value(&mut d) {
        Ok(v) => v,
        Err(err) => return Err(ProtocolError::MalformedStatusJson(err.to_string())),
    };
    if !matches!(v, OwnedValue::Object(_)) {
        return Err(ProtocolError::MalformedStatusJson(
            "status isn't a json object".to_string(),
        ));
    }

    let description = v.get("description");
    let version = v.get("version");
    let players = v.get("players");

    if description.is_none() && version.is_none() && players.is_none() {
        // some servers are missing one of these fields (even description isn't
        // technically required), but if they're missing all three then it's
        // probably not even a minecraft server
        return Err(ProtocolError::MalformedStatusJson(
            "missing description, version, and players fields".to_string(),
        ));
    }

    let motd = description
        .map(|description| {
            azalea_chat::FormattedText::deserialize(description)
                .unwrap_or_default()
                .to_string()
        })
        .unwrap_or_default();

    let version_name = version.get_str("name").map(str::to_owned);
    let protocol_version = version.get_i32("protocol");

    let favicon = v.get_str("favicon").map(str::to_owned);
    // filter out bad favicons
    let favicon = favicon.filter(|f| f.starts_with("data:image/png;base64,"));

    let player_sample = players
        .get_array("sample")
        .map(|a| {
            a.iter()
                .filter_map(|p| {
                    // name is required
                    let name = p.get_str("name")?.to_owned();
                    Some(sample_player(name, p.get_str("id")))
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(StatusResponse {
        version_name,
        protocol_version,
        players_online: players.get_i32("online"),
        players_max: players.get_i32("max"),
        player_sample,
        description: description.cloned(),
        motd,
        favicon,
        enforces_secure_chat: v.get_bool("enforcesSecureChat"),
        previews_chat: v.get_bool("previewsChat"),
        modpack_info: modpack_from_status(&v),
    })
}

fn sample_player(name: String, id: Option<&str>) -> PlayerRef {
    let Some(id) = id.map(str::trim).filter(|id| !id.is_empty()) else {
        return PlayerRef::Name(name);
    };
    match Uuid::parse_str(id) {
        // the anonymous player (and some plugins) use the nil uuid, which
        // doesn't identify anyone
        Ok(uuid) if uuid.is_nil() => PlayerRef::Name(name),
        Ok(uuid) => PlayerRef::Identified {
            name,
            uuid: uuid.hyphenated().to_string(),
        },
        // keep whatever the server gave us rather than dropping it
        Err(_) => PlayerRef::Identified {
            name,
            uuid: id.to_owned(),
        },
    }
}

/// Collect modpack information from the non-vanilla fields that modded
/// servers add to their status.
fn modpack_from_status(v: &OwnedValue) -> Option<ModpackInfo> {
    // bettercompatibilitychecker
    let modpack_data = v.get("modpackData");
    // forge 1.13+
    let forge_data = v.get("forgeData");
    // old forge servers
    let mod_info = v.get("modinfo");

    let mut mods = Vec::new();
    if let Some(forge_mods) = forge_data.get_array("mods") {
        for m in forge_mods {
            if let Some(id) = m.get_str("modId") {
                mods.push(ModEntry {
                    id: id.to_owned(),
                    version: m.get_str("modmarker").map(str::to_owned),
                });
            }
        }
    } else if let Some(mod_list) = mod_info.get_array("modList") {
        for m in mod_list {
            if let Some(id) = m.get_str("modid") {
                mods.push(ModEntry {
                    id: id.to_owned(),
                    version: m.get_str("version").map(str::to_owned),
                });
            }
        }
    }

    let kind = if let Some(kind) = mod_info.get_str("type") {
        kind.to_owned()
    } else if forge_data.is_some() {
        "FML2".to_owned()
    } else if modpack_data.is_some() {
        "modpack".to_owned()
    } else if v.get_bool("isModded") == Some(true) {
        "neoforge".to_owned()
    } else {
        return None;
    };

    Some(ModpackInfo {
        kind,
        name: modpack_data.get_str("name").map(str::to_owned),
        version: modpack_data.get_str("version").map(str::to_owned),
        project_id: modpack_data.get_i64("projectID"),
        mod_count: mods.len(),
        mods,
    })
}

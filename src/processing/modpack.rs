use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModpackInfo {
    /// Where the info came from, like `FML2` for modern forge or `FML` for
    /// legacy forge.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: Option<String>,
    pub version: Option<String>,
    #[serde(rename = "projectID")]
    pub project_id: Option<i64>,
    pub mod_count: usize,
    pub mods: Vec<ModEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModEntry {
    pub id: String,
    pub version: Option<String>,
}

/// Modpack metadata maintained by the server owner, which is usually more
/// accurate than whatever the server advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ModpackMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "projectID")]
    pub project_id: Option<i64>,
}

impl ModpackMetadata {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.version.is_none() && self.project_id.is_none()
    }
}

/// The fields can either be at the top level or in a `[modpack]` table.
#[derive(Deserialize)]
struct ModpackFile {
    #[serde(default)]
    modpack: Option<ModpackMetadata>,
    #[serde(flatten)]
    top_level: ModpackMetadata,
}

pub fn parse_modpack_metadata(input: &str) -> eyre::Result<Option<ModpackMetadata>> {
    let file: ModpackFile = toml::from_str(input)?;
    let metadata = file
        .modpack
        .filter(|m| !m.is_empty())
        .unwrap_or(file.top_level);
    Ok((!metadata.is_empty()).then_some(metadata))
}

/// Read the modpack metadata file. A missing or broken file never fails a
/// status request, it just means there's nothing to override.
pub fn read_modpack_metadata(path: &Path) -> Option<ModpackMetadata> {
    let input = match fs::read_to_string(path) {
        Ok(input) => input,
        Err(err) => {
            debug!("no modpack metadata at {}: {err}", path.display());
            return None;
        }
    };
    match parse_modpack_metadata(&input) {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!("failed to parse modpack metadata at {}: {err}", path.display());
            None
        }
    }
}

/// Apply the owner's metadata on top of what the server advertised. Fields
/// from the metadata win, missing ones fall back to the protocol.
pub fn merge_modpack(
    protocol: Option<ModpackInfo>,
    metadata: Option<&ModpackMetadata>,
) -> Option<ModpackInfo> {
    let Some(metadata) = metadata else {
        return protocol;
    };

    match protocol {
        Some(mut info) => {
            if let Some(name) = &metadata.name {
                info.name = Some(name.clone());
            }
            if let Some(version) = &metadata.version {
                info.version = Some(version.clone());
            }
            if let Some(project_id) = metadata.project_id {
                info.project_id = Some(project_id);
            }
            Some(info)
        }
        None => metadata.name.as_ref().map(|name| ModpackInfo {
            kind: "metadata".to_owned(),
            name: Some(name.clone()),
            version: metadata.version.clone(),
            project_id: metadata.project_id,
            mod_count: 0,
            mods: Vec::new(),
        }),
    }
}

//! The configuration document consumed by the gateway containers
//!
//! The operator keeps its record of what has been applied as JSON inside the
//! gateway's ConfigMap. The containers read the same file, so the key names
//! here are a wire format and must not change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use iscsi_common::{Error, Result};

/// ConfigMap key holding the document
pub const CONFIG_JSON_KEY: &str = "config.json";

/// Disk name to disk size
pub type DiskTable = BTreeMap<String, String>;

/// Pool name to the disks exported from it
pub type PoolTable = BTreeMap<String, DiskTable>;

/// Initiator name to its CHAP settings and LUNs
pub type HostTable = BTreeMap<String, HostInfo>;

/// The persisted gateway configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Exported target IQN
    #[serde(rename = "targetname", default, skip_serializing_if = "String::is_empty")]
    pub target_name: String,

    /// Exported disks by pool
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: PoolTable,

    /// Initiators allowed to log in
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: HostTable,

    /// Gateway-wide defaults
    #[serde(default, skip_serializing_if = "Globals::is_empty")]
    pub globals: Globals,
}

/// The `globals` section: a single entry under the literal key "globals"
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Globals {
    /// The gateway-wide options, absent until first reconciled
    #[serde(rename = "globals", default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<GlobalConfig>,
}

impl Globals {
    /// True when no globals entry has been written yet
    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }
}

/// Options applied to every host that does not override them
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GlobalConfig {
    #[serde(default)]
    pub options: GlobalOptions,
}

/// Default initiator identity and CHAP credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GlobalOptions {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Per-initiator settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct HostInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// `pool/disk` references, in the order they were declared
    #[serde(rename = "lun", default, skip_serializing_if = "Vec::is_empty")]
    pub luns: Vec<String>,
}

impl ContainerConfig {
    /// Parse a persisted document. Absent or blank documents are the empty
    /// configuration.
    pub fn from_document(document: Option<&str>) -> Result<Self> {
        match document {
            Some(doc) if !doc.trim().is_empty() => serde_json::from_str(doc).map_err(|e| {
                Error::serialization_for_kind(
                    "ConfigMap",
                    format!("invalid {}: {}", CONFIG_JSON_KEY, e),
                )
            }),
            _ => Ok(Self::default()),
        }
    }

    /// Render the document the way it is stored in the ConfigMap
    pub fn to_document(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            Error::serialization_for_kind("ConfigMap", format!("encoding {}: {}", CONFIG_JSON_KEY, e))
        })
    }
}

//! Operator-wide settings
//!
//! `OperatorConfig` holds the defaults every gateway inherits: the container
//! image and names used in pod templates, the iSCSI global CHAP settings
//! written into each persisted configuration, and the shared state PVC size.
//! It is loaded once at startup and handed to the controller context.

use std::path::{Path, PathBuf};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Default gateway container image
pub const DEFAULT_CONTAINER_IMAGE: &str = "docker.com/ruohwai/iscsi:v17.2.2";

/// Locations searched for a config file when none is given explicitly
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/etc/iscsi-operator/iscsi-operator.yaml",
    "./iscsi-operator.yaml",
];

/// Settings shared by every gateway this operator manages
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorConfig {
    /// Image for the gateway, init and tcmu-runner containers
    pub container_image: String,
    /// Name of the main gateway container
    pub container_name: String,
    /// Pull policy for gateway images
    pub image_pull_policy: String,
    /// Port of rbd-target-api, probed for liveness and readiness
    pub api_port: u16,
    /// Default initiator name written to the globals section
    pub hostname: String,
    /// Default CHAP user written to the globals section
    pub username: String,
    /// Default CHAP password written to the globals section
    pub password: String,
    /// Size request of the `<gateway>-state` PVC
    pub state_pvc_size: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            container_image: DEFAULT_CONTAINER_IMAGE.to_string(),
            container_name: "iscsi".to_string(),
            image_pull_policy: "IfNotPresent".to_string(),
            api_port: 5000,
            hostname: "iqn.0000.default:client".to_string(),
            username: "IscsiUser".to_string(),
            password: "1234".to_string(),
            state_pvc_size: "1Gi".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Parse a YAML document. Missing keys keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid operator config: {e}")))
    }

    /// Load configuration from `path`, or from the first default location
    /// that exists. Returns defaults when no file is found and no explicit
    /// path was requested.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let candidate: Option<PathBuf> = match path {
            Some(p) => Some(p.to_path_buf()),
            None => DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file()),
        };

        let Some(file) = candidate else {
            debug!("No operator config file found, using defaults");
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(&file).map_err(|e| {
            Error::config(format!("failed to read {}: {}", file.display(), e))
        })?;
        debug!(path = %file.display(), "Loaded operator config file");
        Self::from_yaml(&content)
    }

    /// Check the settings that pod templates cannot do without
    pub fn validate(&self) -> Result<()> {
        if self.container_image.trim().is_empty() {
            return Err(Error::config("containerImage must not be empty"));
        }
        if self.container_name.trim().is_empty() {
            return Err(Error::config("containerName must not be empty"));
        }
        if self.api_port == 0 {
            return Err(Error::config("apiPort must not be 0"));
        }
        if !is_quantity(&self.state_pvc_size) {
            return Err(Error::config(format!(
                "statePvcSize '{}' is not a valid quantity",
                self.state_pvc_size
            )));
        }
        Ok(())
    }

    /// The state PVC size as a Kubernetes quantity
    pub fn state_pvc_quantity(&self) -> Quantity {
        Quantity(self.state_pvc_size.clone())
    }
}

/// Loose check for Kubernetes quantity syntax: digits, an optional fraction,
/// and an optional binary or decimal suffix.
fn is_quantity(s: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        "", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "k", "M", "G", "T", "P", "E", "m",
    ];
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    !number.is_empty()
        && number.chars().filter(|c| *c == '.').count() <= 1
        && number.chars().any(|c| c.is_ascii_digit())
        && SUFFIXES.contains(&suffix)
}

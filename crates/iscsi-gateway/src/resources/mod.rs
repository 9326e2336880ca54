//! Child resource templates
//!
//! Pure builders turning an [`InstanceConfiguration`] into the Kubernetes
//! objects a gateway needs. Nothing here talks to the API server.
//!
//! [`InstanceConfiguration`]: crate::planner::InstanceConfiguration

mod config_map;
mod daemon_set;
mod pod;
mod pool;
mod pvc;
mod stateful_set;
mod volumes;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use iscsi_common::{MANAGED_BY, MANAGED_BY_LABEL};

use crate::planner::InstanceConfiguration;

pub use config_map::{build_config_map, read_container_config, write_container_config};
pub use daemon_set::{build_daemon_set, TCMU_RUNNER_NAME};
pub use pod::{build_clustered_pod_spec, build_tcmu_runner_pod_spec, image_pull_policy};
pub use pool::build_pool;
pub use pvc::build_state_pvc;
pub use stateful_set::{build_stateful_set, labels_for_gateway, label_value};
pub use volumes::{VolumeKeeper, VolumeWithMount};

/// Label linking a child to the gateway that created it
pub const GATEWAY_LABEL: &str = "iscsi.ruohwai/gateway";

/// Labels every gateway-owned child carries
fn managed_labels(instance: &InstanceConfiguration<'_>) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (GATEWAY_LABEL.to_string(), label_value(&[&instance.instance_name()])),
    ])
}

/// Metadata for a child owned solely by this gateway
fn owned_metadata(
    instance: &InstanceConfiguration<'_>,
    name: String,
    labels: BTreeMap<String, String>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: instance.namespace(),
        labels: Some(labels),
        owner_references: instance.controller_reference().map(|r| vec![r]),
        ..Default::default()
    }
}

//! The per-node tcmu-runner DaemonSet
//!
//! One DaemonSet serves every gateway in a namespace. It carries no
//! controller reference; gateways claim plain ownership of it instead.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use iscsi_common::{Result, MANAGED_BY, MANAGED_BY_LABEL};

use super::pod::build_tcmu_runner_pod_spec;
use crate::planner::InstanceConfiguration;

/// Name of the DaemonSet and of its only container
pub const TCMU_RUNNER_NAME: &str = "tcmu-runner";

fn tcmu_runner_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), TCMU_RUNNER_NAME.to_string()),
        ("app.kubernetes.io/name".to_string(), TCMU_RUNNER_NAME.to_string()),
        ("app.kubernetes.io/instance".to_string(), TCMU_RUNNER_NAME.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

pub fn build_daemon_set(instance: &InstanceConfiguration<'_>) -> Result<DaemonSet> {
    let labels = tcmu_runner_labels();
    let pod_spec = build_tcmu_runner_pod_spec(instance)?;

    Ok(DaemonSet {
        metadata: ObjectMeta {
            name: Some(TCMU_RUNNER_NAME.to_string()),
            namespace: instance.namespace(),
            labels: Some(labels.clone()),
            owner_references: instance.owner_reference().map(|r| vec![r]),
            ..Default::default()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

//! The clustered gateway StatefulSet

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use iscsi_common::{Result, MANAGED_BY, MANAGED_BY_LABEL};

use super::owned_metadata;
use super::pod::build_clustered_pod_spec;
use crate::planner::InstanceConfiguration;

const APP_NAME: &str = "iscsi";
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Join `parts` with dashes and fit the result in a label value
pub fn label_value(parts: &[&str]) -> String {
    let mut value = parts.join("-");
    if value.len() > MAX_LABEL_VALUE_LEN {
        let mut end = MAX_LABEL_VALUE_LEN;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}

/// Selector and pod labels for the gateway named `name`
pub fn labels_for_gateway(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), APP_NAME.to_string()),
        ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
        (
            "app.kubernetes.io/instance".to_string(),
            label_value(&[APP_NAME, name]),
        ),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
    ])
}

pub fn build_stateful_set(instance: &InstanceConfiguration<'_>) -> Result<StatefulSet> {
    let labels = labels_for_gateway(&instance.instance_name());
    let pod_spec = build_clustered_pod_spec(instance)?;

    let main = instance.config.container_name.clone();
    let annotations = BTreeMap::from([
        (
            "kubectl.kubernetes.io/default-logs-container".to_string(),
            main.clone(),
        ),
        ("kubectl.kubernetes.io/default-container".to_string(), main),
    ]);

    Ok(StatefulSet {
        metadata: owned_metadata(instance, instance.instance_name(), labels.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(instance.scale()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

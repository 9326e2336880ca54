//! The gateway's ConfigMap, which doubles as the persisted container config

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;

use iscsi_common::Result;

use super::{managed_labels, owned_metadata};
use crate::container_config::{ContainerConfig, CONFIG_JSON_KEY};
use crate::planner::InstanceConfiguration;

/// A fresh ConfigMap holding the empty configuration document
pub fn build_config_map(instance: &InstanceConfiguration<'_>) -> Result<ConfigMap> {
    let document = ContainerConfig::default().to_document()?;
    Ok(ConfigMap {
        metadata: owned_metadata(instance, instance.instance_name(), managed_labels(instance)),
        data: Some(BTreeMap::from([(CONFIG_JSON_KEY.to_string(), document)])),
        ..Default::default()
    })
}

/// Decode the configuration stored in `cm`
pub fn read_container_config(cm: &ConfigMap) -> Result<ContainerConfig> {
    let document = cm
        .data
        .as_ref()
        .and_then(|data| data.get(CONFIG_JSON_KEY))
        .map(String::as_str);
    ContainerConfig::from_document(document)
}

/// Store `config` in `cm`, leaving any other keys alone
pub fn write_container_config(cm: &mut ConfigMap, config: &ContainerConfig) -> Result<()> {
    let document = config.to_document()?;
    cm.data
        .get_or_insert_with(BTreeMap::new)
        .insert(CONFIG_JSON_KEY.to_string(), document);
    Ok(())
}

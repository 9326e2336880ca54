//! Shared state volume for clustered gateways

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};

use super::{managed_labels, owned_metadata};
use crate::planner::InstanceConfiguration;

const READ_WRITE_MANY: &str = "ReadWriteMany";

pub fn build_state_pvc(instance: &InstanceConfiguration<'_>) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: owned_metadata(instance, instance.state_pvc_name(), managed_labels(instance)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![READ_WRITE_MANY.to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    instance.config.state_pvc_quantity(),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

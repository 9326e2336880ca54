//! Volumes and their mounts, kept in pairs
//!
//! Every gateway container mounts every volume, so volumes are collected
//! together with their mount and validated as a set before use.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, EmptyDirVolumeSource, HostPathVolumeSource, Volume, VolumeMount,
};

use iscsi_common::{Error, Result};

use crate::planner::{
    InstanceConfiguration, CEPH_MOUNT_PATH, CONFIG_MOUNT_PATH, DEV_MOUNT_PATH,
    LIB_MODULES_MOUNT_PATH, STATE_DIR,
};

const CONFIG_VOLUME: &str = "iscsi-container-config";
const STATE_VOLUME: &str = "iscsi-state-dir";
const CEPH_VOLUME: &str = "iscsi-ceph-config-dir";
const DEV_VOLUME: &str = "dev-vol-dir";
const LIB_VOLUME: &str = "lib-vol-dir";

/// A volume and the mount that exposes it
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeWithMount {
    pub volume: Volume,
    pub mount: VolumeMount,
}

impl VolumeWithMount {
    fn new(name: &str, mount_path: &str, volume: Volume) -> Self {
        Self {
            volume: Volume {
                name: name.to_string(),
                ..volume
            },
            mount: VolumeMount {
                name: name.to_string(),
                mount_path: mount_path.to_string(),
                ..Default::default()
            },
        }
    }

    fn config_map(name: &str, mount_path: &str, config_map: &str) -> Self {
        Self::new(
            name,
            mount_path,
            Volume {
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
    }

    fn host_dir(name: &str, path: &str) -> Self {
        Self::new(
            name,
            path,
            Volume {
                host_path: Some(HostPathVolumeSource {
                    path: path.to_string(),
                    type_: Some("Directory".to_string()),
                }),
                ..Default::default()
            },
        )
    }
}

/// Ceph client configuration from the gateway's externalConfigRef
pub fn ceph_volume(instance: &InstanceConfiguration<'_>) -> VolumeWithMount {
    VolumeWithMount::config_map(CEPH_VOLUME, CEPH_MOUNT_PATH, instance.ceph_config_name())
}

/// The generated container configuration (the gateway's own ConfigMap)
pub fn config_volume(instance: &InstanceConfiguration<'_>) -> VolumeWithMount {
    VolumeWithMount::config_map(CONFIG_VOLUME, CONFIG_MOUNT_PATH, &instance.instance_name())
}

/// Scratch state shared between the init and main containers of a pod
pub fn state_volume() -> VolumeWithMount {
    VolumeWithMount::new(
        STATE_VOLUME,
        STATE_DIR,
        Volume {
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    )
}

pub fn dev_volume() -> VolumeWithMount {
    VolumeWithMount::host_dir(DEV_VOLUME, DEV_MOUNT_PATH)
}

pub fn lib_modules_volume() -> VolumeWithMount {
    VolumeWithMount::host_dir(LIB_VOLUME, LIB_MODULES_MOUNT_PATH)
}

/// Ordered set of volume/mount pairs
#[derive(Clone, Debug, Default)]
pub struct VolumeKeeper {
    vols: Vec<VolumeWithMount>,
}

impl VolumeKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, vol: VolumeWithMount) -> &mut Self {
        self.vols.push(vol);
        self
    }

    /// Volume and mount names must agree and be unique
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for vm in &self.vols {
            if vm.volume.name != vm.mount.name {
                return Err(Error::internal_with_context(
                    "template",
                    format!(
                        "volume/mount name mismatch: {} != {}",
                        vm.volume.name, vm.mount.name
                    ),
                ));
            }
            if !seen.insert(vm.volume.name.as_str()) {
                return Err(Error::internal_with_context(
                    "template",
                    format!("duplicate volume name found: {}", vm.volume.name),
                ));
            }
        }
        Ok(())
    }

    pub fn volumes(&self) -> Vec<Volume> {
        self.vols.iter().map(|v| v.volume.clone()).collect()
    }

    pub fn mounts(&self) -> Vec<VolumeMount> {
        self.vols.iter().map(|v| v.mount.clone()).collect()
    }
}

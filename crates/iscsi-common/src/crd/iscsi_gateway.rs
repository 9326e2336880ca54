//! IscsiGateway CRD: desired state of an iSCSI gateway cluster
//!
//! An IscsiGateway declares which Ceph pools and disks to export, which
//! initiator hosts may log in, the LUNs each host sees, and how many gateway
//! replicas should serve the target.

use std::collections::HashSet;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::ceph_block_pool::PoolSpec;
use crate::{Error, Result};

/// IscsiGateway defines an iSCSI target backed by Ceph RBD images.
///
/// Example:
/// ```yaml
/// apiVersion: iscsi.ruohwai/v1alpha1
/// kind: IscsiGateway
/// metadata:
///   name: gw1
/// spec:
///   scale: 2
///   externalConfigRef: ceph-client-conf
///   storage:
///     - poolname: rbd
///       disks:
///         - diskname: disk1
///           disksize: 10G
///   hosts:
///     - hostName: iqn.1994-05.com.redhat:client1
///       userName: alice
///       password: secret
///       luns:
///         - poolname: rbd
///           diskname: disk1
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "iscsi.ruohwai",
    version = "v1alpha1",
    kind = "IscsiGateway",
    plural = "iscsigateways",
    shortname = "iscsigw",
    namespaced,
    status = "IscsiGatewayStatus",
    printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetname"}"#,
    printcolumn = r#"{"name":"Scale","type":"integer","jsonPath":".spec.scale"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IscsiGatewaySpec {
    /// IQN to export. Derived from the gateway name when empty.
    #[serde(rename = "targetname", default)]
    pub target_name: String,

    /// Pools and the RBD images to export from each
    #[serde(default)]
    pub storage: Vec<IscsiStorageSpec>,

    /// Initiators allowed to log in and the LUNs each one sees
    #[serde(default)]
    pub hosts: Vec<IscsiHostSpec>,

    /// Gateway replica count. 0 means 1.
    #[serde(default)]
    pub scale: i32,

    /// Name of the ConfigMap holding ceph.conf and the keyring
    #[serde(default)]
    pub external_config_ref: String,
}

/// A pool and the disks exported from it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IscsiStorageSpec {
    /// Ceph pool name
    #[serde(rename = "poolname")]
    pub pool_name: String,

    /// RBD images in the pool
    #[serde(default)]
    pub disks: Vec<IscsiDiskSpec>,

    /// Settings for the CephBlockPool created for this pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_spec: Option<PoolSpec>,
}

/// An RBD image
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct IscsiDiskSpec {
    /// Image name
    #[serde(rename = "diskname")]
    pub disk_name: String,

    /// Image size, e.g. "10G"
    #[serde(rename = "disksize")]
    pub disk_size: String,
}

/// An initiator host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct IscsiHostSpec {
    /// Initiator IQN
    #[serde(rename = "hostName")]
    pub host_name: String,

    /// CHAP user
    #[serde(rename = "userName", default)]
    pub username: String,

    /// CHAP password
    #[serde(default)]
    pub password: String,

    /// Disks mapped to this host
    #[serde(default)]
    pub luns: Vec<IscsiLunSpec>,
}

/// A pool/disk pair mapped to a host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct IscsiLunSpec {
    /// Pool holding the disk
    #[serde(rename = "poolname")]
    pub pool_name: String,

    /// Disk name
    #[serde(rename = "diskname")]
    pub disk_name: String,
}

impl IscsiLunSpec {
    /// The `pool/disk` reference stored in the persisted configuration
    pub fn reference(&self) -> String {
        format!("{}/{}", self.pool_name, self.disk_name)
    }
}

/// Observed state of an IscsiGateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IscsiGatewayStatus {
    /// Name of the StatefulSet serving this gateway
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_group: String,
}

impl IscsiGatewaySpec {
    /// Validate the uniqueness and naming rules the diff engine relies on
    pub fn validate(&self, gateway: &str) -> Result<()> {
        if self.scale < 0 {
            return Err(Error::validation_for_field(
                gateway,
                "spec.scale",
                format!("scale must not be negative, got {}", self.scale),
            ));
        }

        let mut pools = HashSet::new();
        for (i, pool) in self.storage.iter().enumerate() {
            if pool.pool_name.is_empty() {
                return Err(Error::validation_for_field(
                    gateway,
                    format!("spec.storage[{i}].poolname"),
                    "pool name must not be empty",
                ));
            }
            if !pools.insert(pool.pool_name.as_str()) {
                return Err(Error::validation_for_field(
                    gateway,
                    format!("spec.storage[{i}].poolname"),
                    format!("duplicate pool '{}'", pool.pool_name),
                ));
            }

            let mut disks = HashSet::new();
            for (j, disk) in pool.disks.iter().enumerate() {
                let field = format!("spec.storage[{i}].disks[{j}].diskname");
                if disk.disk_name.is_empty() {
                    return Err(Error::validation_for_field(
                        gateway,
                        field,
                        "disk name must not be empty",
                    ));
                }
                if !disks.insert(disk.disk_name.as_str()) {
                    return Err(Error::validation_for_field(
                        gateway,
                        field,
                        format!(
                            "duplicate disk '{}' in pool '{}'",
                            disk.disk_name, pool.pool_name
                        ),
                    ));
                }
            }
        }

        let mut hosts = HashSet::new();
        for (i, host) in self.hosts.iter().enumerate() {
            let field = format!("spec.hosts[{i}].hostName");
            if host.host_name.is_empty() {
                return Err(Error::validation_for_field(
                    gateway,
                    field,
                    "host name must not be empty",
                ));
            }
            if !hosts.insert(host.host_name.as_str()) {
                return Err(Error::validation_for_field(
                    gateway,
                    field,
                    format!("duplicate host '{}'", host.host_name),
                ));
            }

            let mut luns = HashSet::new();
            for (j, lun) in host.luns.iter().enumerate() {
                let reference = lun.reference();
                if !luns.insert(reference.clone()) {
                    return Err(Error::validation_for_field(
                        gateway,
                        format!("spec.hosts[{i}].luns[{j}]"),
                        format!(
                            "duplicate lun '{}' for host '{}'",
                            reference, host.host_name
                        ),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Where an IscsiGateway is in the cooperative deletion protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Not being deleted
    Active,
    /// A deletion timestamp is set
    PendingDeletion {
        /// Whether the gateway finalizer is still present
        has_finalizer: bool,
    },
}

impl IscsiGateway {
    /// Classify this gateway for the deletion protocol
    pub fn lifecycle_state(&self) -> LifecycleState {
        if self.metadata.deletion_timestamp.is_none() {
            return LifecycleState::Active;
        }
        LifecycleState::PendingDeletion {
            has_finalizer: self.finalizers().iter().any(|f| f == crate::GATEWAY_FINALIZER),
        }
    }
}

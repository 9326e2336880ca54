//! Resolved view of one gateway: the IscsiGateway plus operator defaults
//!
//! Everything the templates need to know about a gateway is answered here,
//! so builders never read the CRD or the operator config directly.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use iscsi_common::crd::IscsiGateway;
use iscsi_common::kube_utils::owner_reference;
use iscsi_common::OperatorConfig;

/// Mount point of the generated container configuration
pub const CONFIG_MOUNT_PATH: &str = "/etc/container-config";
/// Directory holding gateway runtime state
pub const STATE_DIR: &str = "/var/lib/iscsi";
/// Mount point of the Ceph client configuration
pub const CEPH_MOUNT_PATH: &str = "/etc/ceph";
/// Host device directory
pub const DEV_MOUNT_PATH: &str = "/dev";
/// Host kernel modules directory
pub const LIB_MODULES_MOUNT_PATH: &str = "/lib/modules";

/// A gateway together with the operator defaults that apply to it
#[derive(Clone, Copy, Debug)]
pub struct InstanceConfiguration<'a> {
    pub gateway: &'a IscsiGateway,
    pub config: &'a OperatorConfig,
}

impl<'a> InstanceConfiguration<'a> {
    pub fn new(gateway: &'a IscsiGateway, config: &'a OperatorConfig) -> Self {
        Self { gateway, config }
    }

    pub fn instance_name(&self) -> String {
        self.gateway.name_any()
    }

    pub fn namespace(&self) -> Option<String> {
        self.gateway.namespace()
    }

    /// Desired replica count. An unset scale means a single gateway.
    pub fn scale(&self) -> i32 {
        match self.gateway.spec.scale {
            0 => 1,
            n => n,
        }
    }

    /// Gateways with more than one replica run the clustered init flow
    pub fn is_clustered(&self) -> bool {
        self.scale() != 1
    }

    pub fn ceph_config_name(&self) -> &str {
        &self.gateway.spec.external_config_ref
    }

    pub fn state_pvc_name(&self) -> String {
        format!("{}-state", self.instance_name())
    }

    /// Path of the configuration document inside the containers
    pub fn container_config_path(&self) -> String {
        format!("{}/{}", CONFIG_MOUNT_PATH, crate::container_config::CONFIG_JSON_KEY)
    }

    /// Controller reference used on every child this gateway creates alone
    pub fn controller_reference(&self) -> Option<OwnerReference> {
        owner_reference(self.gateway, true)
    }

    /// Plain reference used when claiming a shared child
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        owner_reference(self.gateway, false)
    }

    // =========================================================================
    // Container arguments
    // =========================================================================

    /// Arguments for the one-shot initializer
    pub fn initializer_args(&self, cmd: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(2);
        if self.is_clustered() {
            args.push("--skip-if-already-init".to_string());
        }
        args.push(cmd.to_string());
        args
    }

    pub fn set_node_args(&self) -> Vec<String> {
        vec!["set-node".to_string(), "--hostname=$(HOSTNAME)".to_string()]
    }

    pub fn update_config_watch_args(&self) -> Vec<String> {
        vec!["update-config".to_string(), "--watch".to_string()]
    }
}

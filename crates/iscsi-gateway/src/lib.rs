//! IscsiGateway reconciliation for the iSCSI gateway operator
//!
//! - `container_config`: the JSON document the gateway containers consume
//! - `planner`: pure diff of that document against an IscsiGateway spec
//! - `resources`: templates for every child object
//! - `controller`: the reconcile loop tying them together

pub mod container_config;
pub mod controller;
pub mod planner;
pub mod resources;
pub mod result;

// Re-export controller types
pub use controller::{
    error_policy, reconcile, Context, ContextBuilder, GatewayKubeClient, KubeClientImpl,
    CONTROLLER_NAME,
};

pub use container_config::ContainerConfig;
pub use planner::{InstanceConfiguration, Planner};
pub use result::ReconcileResult;

// Re-export common error types
pub use iscsi_common::{Error, Result};

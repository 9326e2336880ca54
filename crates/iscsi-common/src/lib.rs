//! Common types for the iSCSI gateway operator: CRDs, errors, configuration
//! and the ownership/finalizer policy shared by controllers.

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use config::OperatorConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "iscsi-operator";

/// Value of the `app.kubernetes.io/managed-by` label on every managed child
pub const MANAGED_BY: &str = "iscsi-operator";

/// Standard Kubernetes "managed-by" label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Finalizer placed on every IscsiGateway so pool protection can be released
/// before the gateway disappears
pub const GATEWAY_FINALIZER: &str = "iscsi.ruohwai/gateway-finalizer";

/// Finalizer placed on CephBlockPools created for a gateway
pub const POOL_FINALIZER: &str = "iscsi.ruohwai/pool-protection";

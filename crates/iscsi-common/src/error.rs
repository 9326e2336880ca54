//! Error types for the iSCSI gateway operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the gateway, resource kind or pool involved so that a
//! failed reconcile can be explained from a single log line or event.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for gateway operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Optimistic concurrency conflict on update
    #[error("conflict updating {kind}/{name}: object was modified")]
    Conflict {
        /// Kind of the object being written
        kind: String,
        /// Name of the object being written
        name: String,
    },

    /// A resource the gateway depends on but does not manage is absent
    #[error("prerequisite {kind}/{name} for gateway {gateway} not found")]
    PrerequisiteMissing {
        /// Gateway that needs the prerequisite
        gateway: String,
        /// Kind of the missing resource
        kind: String,
        /// Name of the missing resource
        name: String,
    },

    /// A pool resource with the desired name belongs to another gateway
    #[error("pool {pool} is already owned by {owner}")]
    PoolConflict {
        /// Pool name
        pool: String,
        /// Name of the owner currently holding the pool
        owner: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {gateway}: {message}")]
    Validation {
        /// Name of the gateway with invalid configuration
        gateway: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.storage[0].poolname")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Operator configuration error
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "template", "controller")
        context: String,
    },
}

impl Error {
    /// Create an update conflict error
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a missing-prerequisite error
    pub fn prerequisite_missing(
        gateway: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::PrerequisiteMissing {
            gateway: gateway.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a pool ownership conflict error
    pub fn pool_conflict(pool: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::PoolConflict {
            pool: pool.into(),
            owner: owner.into(),
        }
    }

    /// Create a validation error with gateway context
    pub fn validation_for(gateway: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            gateway: gateway.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with gateway context and field path
    pub fn validation_for_field(
        gateway: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            gateway: gateway.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Errors that need a human to change the gateway spec, the persisted
    /// document or the operator deployment are not retryable. A missing
    /// prerequisite is retried because someone may create it at any time.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // 409 and 429 clear up on their own; other 4xx need a fix
                match source {
                    kube::Error::Api(ae) => {
                        !(400..500).contains(&ae.code) || ae.code == 409 || ae.code == 429
                    }
                    _ => true,
                }
            }
            Error::Conflict { .. } => true,
            Error::PrerequisiteMissing { .. } => true,
            Error::PoolConflict { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Config { .. } => false,
            Error::Internal { .. } => false,
        }
    }

    /// True for optimistic-concurrency conflicts, which callers treat as requeue
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

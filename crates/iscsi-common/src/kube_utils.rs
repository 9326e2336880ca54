//! Kubernetes helpers: client construction and the ownership/finalizer policy
//!
//! The policy functions are pure. They inspect or mutate an `ObjectMeta` and
//! report whether anything changed. Persisting the change is up to the caller.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};

use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the config is inferred (in-cluster service account first,
/// then `$KUBECONFIG` / `~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Group part of an apiVersion ("" for the core group)
pub fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

// =============================================================================
// Ownership
// =============================================================================

/// Build an owner reference pointing at `owner`.
///
/// `controller` marks the reference as the managing controller and blocks
/// foreground deletion of the owner until the child is gone. Returns `None`
/// when the owner has not been persisted yet (no name or uid).
pub fn owner_reference<K>(owner: &K, controller: bool) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let meta = owner.meta();
    Some(OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: meta.name.clone()?,
        uid: meta.uid.clone()?,
        controller: controller.then_some(true),
        block_owner_deletion: controller.then_some(true),
    })
}

/// True when `meta` already lists an owner with the same group, kind and name
///
/// The version and uid are ignored so that a re-created owner or an API
/// version bump does not produce a second reference.
pub fn has_owner_reference(meta: &ObjectMeta, owner: &OwnerReference) -> bool {
    let group = api_group(&owner.api_version);
    meta.owner_references.iter().flatten().any(|r| {
        api_group(&r.api_version) == group && r.kind == owner.kind && r.name == owner.name
    })
}

/// Append `owner` unless an equivalent reference exists. Returns whether
/// `meta` changed.
pub fn append_owner_reference(meta: &mut ObjectMeta, owner: OwnerReference) -> bool {
    if has_owner_reference(meta, &owner) {
        return false;
    }
    meta.owner_references.get_or_insert_with(Vec::new).push(owner);
    true
}

/// The owner reference flagged as controller, if any
pub fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .iter()
        .flatten()
        .find(|r| r.controller == Some(true))
}

// =============================================================================
// Finalizers
// =============================================================================

/// Check whether `meta` carries the finalizer `key`
pub fn has_finalizer(meta: &ObjectMeta, key: &str) -> bool {
    meta.finalizers.iter().flatten().any(|f| f == key)
}

/// Add finalizer `key` if absent. Returns whether `meta` changed.
pub fn add_finalizer(meta: &mut ObjectMeta, key: &str) -> bool {
    if has_finalizer(meta, key) {
        return false;
    }
    meta.finalizers
        .get_or_insert_with(Vec::new)
        .push(key.to_string());
    true
}

/// Remove finalizer `key` if present. Returns whether `meta` changed.
pub fn remove_finalizer(meta: &mut ObjectMeta, key: &str) -> bool {
    let Some(finalizers) = meta.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != key);
    finalizers.len() != before
}

//! IscsiGateway controller implementation
//!
//! Each pass re-reads the gateway and walks it toward its desired state one
//! write at a time: every step that changes the cluster ends the pass with a
//! requeue so the next pass observes the result. The steps themselves live in
//! [`manager`].

mod manager;

#[cfg(test)]
mod tests;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use iscsi_common::crd::{CephBlockPool, IscsiGateway, IscsiGatewayStatus};
use iscsi_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use iscsi_common::{Error, OperatorConfig, Result, FIELD_MANAGER};

use crate::result::ReconcileResult;

pub use manager::GatewayManager;

/// Name the controller reports events under
pub const CONTROLLER_NAME: &str = "iscsi-gateway-controller";

/// Backoff for retryable errors
const RETRY_DELAY: Duration = Duration::from_secs(30);
/// Backoff while an external prerequisite is missing
const PREREQUISITE_RETRY_DELAY: Duration = Duration::from_secs(60);

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Trait abstracting the Kubernetes operations a gateway pass performs
///
/// Reads map NotFound to `None`. Creates treat AlreadyExists as success.
/// Replaces report optimistic-concurrency conflicts as [`Error::Conflict`]
/// and return the stored object so later writes in the same pass carry the
/// new resourceVersion.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayKubeClient: Send + Sync {
    /// Get an IscsiGateway by name and namespace
    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<IscsiGateway>>;

    /// Replace an IscsiGateway (metadata and spec)
    async fn replace_gateway(&self, gateway: &IscsiGateway) -> Result<IscsiGateway>;

    /// Merge-patch the status subresource of an IscsiGateway
    async fn patch_gateway_status(
        &self,
        name: &str,
        namespace: &str,
        status: &IscsiGatewayStatus,
    ) -> Result<()>;

    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>>;
    async fn create_config_map(&self, cm: &ConfigMap) -> Result<()>;
    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap>;

    async fn get_pvc(&self, name: &str, namespace: &str) -> Result<Option<PersistentVolumeClaim>>;
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()>;

    async fn get_daemon_set(&self, name: &str, namespace: &str) -> Result<Option<DaemonSet>>;
    async fn create_daemon_set(&self, ds: &DaemonSet) -> Result<()>;
    async fn replace_daemon_set(&self, ds: &DaemonSet) -> Result<DaemonSet>;

    async fn get_stateful_set(&self, name: &str, namespace: &str) -> Result<Option<StatefulSet>>;
    async fn create_stateful_set(&self, sts: &StatefulSet) -> Result<()>;
    async fn replace_stateful_set(&self, sts: &StatefulSet) -> Result<StatefulSet>;

    async fn get_pool(&self, name: &str, namespace: &str) -> Result<Option<CephBlockPool>>;
    async fn create_pool(&self, pool: &CephBlockPool) -> Result<()>;
    async fn replace_pool(&self, pool: &CephBlockPool) -> Result<CephBlockPool>;
    /// Delete a pool. A pool that is already gone is not an error.
    async fn delete_pool(&self, name: &str, namespace: &str) -> Result<()>;
    async fn list_pools(&self, namespace: &str) -> Result<Vec<CephBlockPool>>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get<K>(&self, name: &str, namespace: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        Ok(self.api::<K>(namespace).get_opt(name).await?)
    }

    async fn create<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let (name, namespace) = identity(obj)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.api::<K>(namespace).create(&params, obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(kind = %K::kind(&()), name, "already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn replace<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
    {
        let (name, namespace) = identity(obj)?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self.api::<K>(namespace).replace(name, &params, obj).await {
            Ok(stored) => Ok(stored),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::conflict(K::kind(&()), name)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Name and namespace of an object about to be written
fn identity<K: Resource>(obj: &K) -> Result<(&str, &str)> {
    let meta = obj.meta();
    match (meta.name.as_deref(), meta.namespace.as_deref()) {
        (Some(name), Some(namespace)) => Ok((name, namespace)),
        _ => Err(Error::internal_with_context(
            "controller",
            "object is missing a name or namespace",
        )),
    }
}

#[async_trait]
impl GatewayKubeClient for KubeClientImpl {
    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<IscsiGateway>> {
        self.get(name, namespace).await
    }

    async fn replace_gateway(&self, gateway: &IscsiGateway) -> Result<IscsiGateway> {
        self.replace(gateway).await
    }

    async fn patch_gateway_status(
        &self,
        name: &str,
        namespace: &str,
        status: &IscsiGatewayStatus,
    ) -> Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api::<IscsiGateway>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_config_map(&self, name: &str, namespace: &str) -> Result<Option<ConfigMap>> {
        self.get(name, namespace).await
    }

    async fn create_config_map(&self, cm: &ConfigMap) -> Result<()> {
        self.create(cm).await
    }

    async fn replace_config_map(&self, cm: &ConfigMap) -> Result<ConfigMap> {
        self.replace(cm).await
    }

    async fn get_pvc(&self, name: &str, namespace: &str) -> Result<Option<PersistentVolumeClaim>> {
        self.get(name, namespace).await
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.create(pvc).await
    }

    async fn get_daemon_set(&self, name: &str, namespace: &str) -> Result<Option<DaemonSet>> {
        self.get(name, namespace).await
    }

    async fn create_daemon_set(&self, ds: &DaemonSet) -> Result<()> {
        self.create(ds).await
    }

    async fn replace_daemon_set(&self, ds: &DaemonSet) -> Result<DaemonSet> {
        self.replace(ds).await
    }

    async fn get_stateful_set(&self, name: &str, namespace: &str) -> Result<Option<StatefulSet>> {
        self.get(name, namespace).await
    }

    async fn create_stateful_set(&self, sts: &StatefulSet) -> Result<()> {
        self.create(sts).await
    }

    async fn replace_stateful_set(&self, sts: &StatefulSet) -> Result<StatefulSet> {
        self.replace(sts).await
    }

    async fn get_pool(&self, name: &str, namespace: &str) -> Result<Option<CephBlockPool>> {
        self.get(name, namespace).await
    }

    async fn create_pool(&self, pool: &CephBlockPool) -> Result<()> {
        self.create(pool).await
    }

    async fn replace_pool(&self, pool: &CephBlockPool) -> Result<CephBlockPool> {
        self.replace(pool).await
    }

    async fn delete_pool(&self, name: &str, namespace: &str) -> Result<()> {
        match self
            .api::<CephBlockPool>(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_pools(&self, namespace: &str) -> Result<Vec<CephBlockPool>> {
        let pools = self
            .api::<CephBlockPool>(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(pools.items)
    }
}

// =============================================================================
// Controller context
// =============================================================================

fn utc_today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Shared state for every reconcile pass
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(operator_config)
///     .build();
/// ```
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn GatewayKubeClient>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Operator-wide defaults applied to every gateway
    pub config: Arc<OperatorConfig>,
    /// Source of the current date used to derive target names
    pub today: fn() -> NaiveDate,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with a mock client
    ///
    /// Events go nowhere and the date is pinned to 2024-03-07.
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn GatewayKubeClient>) -> Self {
        Self {
            kube,
            events: Arc::new(iscsi_common::events::NoopEventPublisher),
            config: Arc::new(OperatorConfig::default()),
            today: || NaiveDate::from_ymd_opt(2024, 3, 7).unwrap_or_default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn GatewayKubeClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: OperatorConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            events: None,
            config: OperatorConfig::default(),
        }
    }

    /// Operator defaults for every gateway
    pub fn config(mut self, config: OperatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the Kubernetes client
    pub fn kube_client(mut self, kube: Arc<dyn GatewayKubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Context {
        let kube = self
            .kube
            .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone())));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client, CONTROLLER_NAME)));
        Context {
            kube,
            events,
            config: Arc::new(self.config),
            today: utc_today,
        }
    }
}

// =============================================================================
// IscsiGateway reconciliation
// =============================================================================

/// Reconcile an IscsiGateway
///
/// The object handed in by the watcher only identifies the gateway. The pass
/// works on a fresh read so it never acts on a stale cache entry.
#[instrument(skip(gateway, ctx), fields(gateway = %gateway.name_any()))]
pub async fn reconcile(gateway: Arc<IscsiGateway>, ctx: Arc<Context>) -> Result<Action> {
    let name = gateway.name_any();
    let Some(namespace) = gateway.namespace() else {
        return Err(Error::validation_for(&name, "IscsiGateway must be namespaced"));
    };
    info!("reconciling gateway");

    let result = match ctx.kube.get_gateway(&name, &namespace).await {
        Ok(Some(current)) => GatewayManager::new(&ctx, current).process().await,
        Ok(None) => {
            debug!("gateway no longer exists");
            ReconcileResult::Done
        }
        Err(e) => e.into(),
    };

    if let Some(e) = result.err() {
        ctx.events
            .publish(
                &gateway.object_ref(&()),
                EventType::Warning,
                failure_reason(e),
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
    }
    result.into_action()
}

/// Event reason for a failed pass
fn failure_reason(error: &Error) -> &'static str {
    match error {
        Error::PrerequisiteMissing { .. } => reasons::PREREQUISITE_MISSING,
        Error::PoolConflict { .. } => reasons::POOL_CONFLICT,
        Error::Validation { .. } => reasons::VALIDATION_FAILED,
        _ => reasons::RECONCILE_FAILED,
    }
}

/// Error policy for the controller
///
/// - Missing prerequisites: retry after 60 seconds
/// - Other retryable errors: retry after 30 seconds
/// - Non-retryable errors: await a spec change
pub fn error_policy(gateway: Arc<IscsiGateway>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        gateway = %gateway.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    match error {
        Error::PrerequisiteMissing { .. } => Action::requeue(PREREQUISITE_RETRY_DELAY),
        e if e.is_retryable() => Action::requeue(RETRY_DELAY),
        _ => Action::await_change(),
    }
}

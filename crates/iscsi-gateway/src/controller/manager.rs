//! The steps of a gateway pass
//!
//! A pass runs, in order: prerequisite check, finalizer, pools, configuration
//! ConfigMap, tcmu-runner DaemonSet and, for clustered gateways, the state PVC
//! and StatefulSet. Any step that writes ends the pass with a requeue.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use iscsi_common::crd::{CephBlockPool, IscsiGateway, IscsiGatewayStatus, LifecycleState};
use iscsi_common::events::{actions, reasons};
use iscsi_common::kube_utils::{
    add_finalizer, api_group, append_owner_reference, controller_owner, remove_finalizer,
};
use iscsi_common::{Error, Result, GATEWAY_FINALIZER, POOL_FINALIZER};

use super::Context;
use crate::container_config::ContainerConfig;
use crate::planner::{InstanceConfiguration, Planner};
use crate::resources::{
    build_config_map, build_daemon_set, build_pool, build_state_pvc, build_stateful_set,
    read_container_config, write_container_config, TCMU_RUNNER_NAME,
};
use crate::result::ReconcileResult;

/// Result of one step: keep going, or end the pass here
enum Step<T = ()> {
    Continue(T),
    Stop(ReconcileResult),
}

/// Run a step, returning from the pass if it asks to stop
macro_rules! run_step {
    ($step:expr) => {
        match $step.await? {
            Step::Continue(value) => value,
            Step::Stop(result) => return Ok(result),
        }
    };
}

/// One pass over one gateway
pub struct GatewayManager<'a> {
    ctx: &'a Context,
    gateway: IscsiGateway,
}

impl<'a> GatewayManager<'a> {
    /// `gateway` must be a fresh read of the object
    pub fn new(ctx: &'a Context, gateway: IscsiGateway) -> Self {
        Self { ctx, gateway }
    }

    /// Drive the gateway one step closer to its desired state
    pub async fn process(mut self) -> ReconcileResult {
        match self.gateway.lifecycle_state() {
            LifecycleState::PendingDeletion {
                has_finalizer: true,
            } => self.finalize().await.into(),
            LifecycleState::PendingDeletion {
                has_finalizer: false,
            } => {
                debug!("gateway is being deleted and holds no finalizer");
                ReconcileResult::Done
            }
            LifecycleState::Active => self.update().await.into(),
        }
    }

    fn instance(&self) -> InstanceConfiguration<'_> {
        InstanceConfiguration::new(&self.gateway, &self.ctx.config)
    }

    fn name(&self) -> String {
        self.gateway.name_any()
    }

    fn namespace(&self) -> Result<String> {
        self.gateway.namespace().ok_or_else(|| {
            Error::validation_for(self.name(), "IscsiGateway must be namespaced")
        })
    }

    // =========================================================================
    // Active gateways
    // =========================================================================

    async fn update(&mut self) -> Result<ReconcileResult> {
        self.gateway.spec.validate(&self.name())?;
        self.check_prerequisite().await?;

        run_step!(self.ensure_finalizer());
        run_step!(self.ensure_pools());
        let config = run_step!(self.ensure_configuration());
        run_step!(self.ensure_support_daemon());

        if !self.instance().is_clustered() {
            warn!("a single gateway cannot be deployed; set scale above 1 to run the clustered workload");
            self.publish(
                EventType::Warning,
                reasons::CLUSTERED_MODE_REQUIRED,
                actions::RECONCILE,
                "gateway scale must be greater than 1".to_string(),
            )
            .await;
            return Ok(ReconcileResult::Done);
        }

        run_step!(self.ensure_clustered_workload());
        info!(target_name = %config.target_name, "gateway reconciled");
        Ok(ReconcileResult::Done)
    }

    /// The Ceph configuration ConfigMap is supplied by the user
    async fn check_prerequisite(&self) -> Result<()> {
        let namespace = self.namespace()?;
        let ceph_config = self.instance().ceph_config_name().to_string();
        if self
            .ctx
            .kube
            .get_config_map(&ceph_config, &namespace)
            .await?
            .is_none()
        {
            warn!(config_map = %ceph_config, "ceph configuration not found");
            return Err(Error::prerequisite_missing(
                self.name(),
                "ConfigMap",
                ceph_config,
            ));
        }
        Ok(())
    }

    async fn ensure_finalizer(&mut self) -> Result<Step> {
        if !add_finalizer(&mut self.gateway.metadata, GATEWAY_FINALIZER) {
            return Ok(Step::Continue(()));
        }
        self.gateway = self.ctx.kube.replace_gateway(&self.gateway).await?;
        info!("added gateway finalizer");
        Ok(Step::Stop(ReconcileResult::Requeue))
    }

    // =========================================================================
    // Pools
    // =========================================================================

    async fn ensure_pools(&self) -> Result<Step> {
        let namespace = self.namespace()?;
        let mut created = false;

        for storage in &self.gateway.spec.storage {
            match self.ctx.kube.get_pool(&storage.pool_name, &namespace).await? {
                Some(pool) => self.check_pool_owner(&pool)?,
                None => {
                    let pool = build_pool(&self.instance(), storage);
                    self.ctx.kube.create_pool(&pool).await?;
                    info!(pool = %storage.pool_name, "created CephBlockPool");
                    self.publish_created("CephBlockPool", &storage.pool_name).await;
                    created = true;
                }
            }
        }

        self.prune_pools(&namespace).await;

        if created {
            return Ok(Step::Stop(ReconcileResult::Requeue));
        }
        Ok(Step::Continue(()))
    }

    /// A pool controlled by anything other than this gateway is off limits
    fn check_pool_owner(&self, pool: &CephBlockPool) -> Result<()> {
        match controller_owner(&pool.metadata) {
            Some(owner) if !self.is_self(owner) => Err(Error::pool_conflict(
                pool.name_any(),
                format!("{}/{}", owner.kind, owner.name),
            )),
            Some(_) => Ok(()),
            None => {
                debug!(pool = %pool.name_any(), "using existing unmanaged pool");
                Ok(())
            }
        }
    }

    fn is_self(&self, owner: &OwnerReference) -> bool {
        api_group(&owner.api_version) == api_group(&IscsiGateway::api_version(&()))
            && owner.kind == IscsiGateway::kind(&())
            && owner.name == self.name()
    }

    fn is_controlled_by_self(&self, pool: &CephBlockPool) -> bool {
        controller_owner(&pool.metadata).is_some_and(|o| self.is_self(o))
    }

    /// Remove pools the persisted configuration lists but the spec no longer does
    ///
    /// Best effort: failures are logged and the pass carries on.
    async fn prune_pools(&self, namespace: &str) {
        let stale = match self.stale_pools(namespace).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "could not determine stale pools");
                return;
            }
        };
        for pool in stale {
            if let Err(e) = self.prune_pool(&pool, namespace).await {
                warn!(pool = %pool, error = %e, "failed to prune pool");
            }
        }
    }

    async fn stale_pools(&self, namespace: &str) -> Result<Vec<String>> {
        let Some(cm) = self
            .ctx
            .kube
            .get_config_map(&self.name(), namespace)
            .await?
        else {
            return Ok(Vec::new());
        };
        let persisted = read_container_config(&cm)?;
        let desired: HashSet<&str> = self
            .gateway
            .spec
            .storage
            .iter()
            .map(|s| s.pool_name.as_str())
            .collect();
        Ok(persisted
            .storage
            .into_keys()
            .filter(|pool| !desired.contains(pool.as_str()))
            .collect())
    }

    async fn prune_pool(&self, name: &str, namespace: &str) -> Result<()> {
        let Some(mut pool) = self.ctx.kube.get_pool(name, namespace).await? else {
            return Ok(());
        };
        if !self.is_controlled_by_self(&pool) {
            debug!(pool = %name, "stale pool is not ours, leaving it");
            return Ok(());
        }
        if remove_finalizer(&mut pool.metadata, POOL_FINALIZER) {
            self.ctx.kube.replace_pool(&pool).await?;
        }
        self.ctx.kube.delete_pool(name, namespace).await?;
        info!(pool = %name, "deleted stale CephBlockPool");
        Ok(())
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Keep the ConfigMap's document in line with the spec
    async fn ensure_configuration(&self) -> Result<Step<ContainerConfig>> {
        let namespace = self.namespace()?;
        let name = self.name();

        let Some(cm) = self.ctx.kube.get_config_map(&name, &namespace).await? else {
            let cm = build_config_map(&self.instance())?;
            self.ctx.kube.create_config_map(&cm).await?;
            info!(config_map = %name, "created gateway ConfigMap");
            self.publish_created("ConfigMap", &name).await;
            return Ok(Step::Stop(ReconcileResult::Requeue));
        };
        let mut cm = self.claim_config_map(cm).await?;

        let mut planner = Planner::new(self.instance(), read_container_config(&cm)?);
        if planner.update((self.ctx.today)()) {
            write_container_config(&mut cm, &planner.state)?;
            self.ctx.kube.replace_config_map(&cm).await?;
            info!(config_map = %name, "updated container configuration");
            return Ok(Step::Stop(ReconcileResult::Requeue));
        }
        Ok(Step::Continue(planner.state))
    }

    async fn claim_config_map(&self, cm: ConfigMap) -> Result<ConfigMap> {
        match self.claim(cm)? {
            Claim::Unchanged(cm) => Ok(cm),
            Claim::Claimed(cm) => {
                info!(config_map = %cm.name_any(), "claimed ownership");
                self.ctx.kube.replace_config_map(&cm).await
            }
        }
    }

    // =========================================================================
    // Workloads
    // =========================================================================

    async fn ensure_support_daemon(&self) -> Result<Step> {
        let namespace = self.namespace()?;
        let Some(ds) = self
            .ctx
            .kube
            .get_daemon_set(TCMU_RUNNER_NAME, &namespace)
            .await?
        else {
            let ds = build_daemon_set(&self.instance())?;
            self.ctx.kube.create_daemon_set(&ds).await?;
            info!(daemon_set = TCMU_RUNNER_NAME, "created tcmu-runner DaemonSet");
            self.publish_created("DaemonSet", TCMU_RUNNER_NAME).await;
            return Ok(Step::Stop(ReconcileResult::Requeue));
        };

        if let Claim::Claimed(ds) = self.claim(ds)? {
            self.ctx.kube.replace_daemon_set(&ds).await?;
            info!(daemon_set = TCMU_RUNNER_NAME, "claimed ownership");
        }
        Ok(Step::Continue(()))
    }

    async fn ensure_clustered_workload(&self) -> Result<Step> {
        let namespace = self.namespace()?;
        let instance = self.instance();

        let pvc_name = instance.state_pvc_name();
        if self.ctx.kube.get_pvc(&pvc_name, &namespace).await?.is_none() {
            self.ctx.kube.create_pvc(&build_state_pvc(&instance)).await?;
            info!(pvc = %pvc_name, "created gateway state PVC");
            self.publish_created("PersistentVolumeClaim", &pvc_name).await;
            return Ok(Step::Stop(ReconcileResult::Requeue));
        }

        let name = instance.instance_name();
        let Some(sts) = self.ctx.kube.get_stateful_set(&name, &namespace).await? else {
            self.ctx
                .kube
                .create_stateful_set(&build_stateful_set(&instance)?)
                .await?;
            info!(stateful_set = %name, replicas = instance.scale(), "created gateway StatefulSet");
            self.publish_created("StatefulSet", &name).await;
            return Ok(Step::Stop(ReconcileResult::Requeue));
        };

        let mut sts = match self.claim(sts)? {
            Claim::Unchanged(sts) => sts,
            Claim::Claimed(sts) => {
                info!(stateful_set = %name, "claimed ownership");
                self.ctx.kube.replace_stateful_set(&sts).await?
            }
        };

        self.ensure_status(&namespace).await?;

        let desired = instance.scale();
        let current = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        if current < desired {
            sts.spec.get_or_insert_with(Default::default).replicas = Some(desired);
            self.ctx.kube.replace_stateful_set(&sts).await?;
            info!(stateful_set = %name, from = current, to = desired, "scaled gateway up");
            self.publish(
                EventType::Normal,
                reasons::SCALED_UP,
                actions::SCALE,
                format!("scaled StatefulSet {name} from {current} to {desired}"),
            )
            .await;
            return Ok(Step::Stop(ReconcileResult::Requeue));
        }
        if current > desired {
            debug!(current, desired, "scale-down is not applied");
        }
        Ok(Step::Continue(()))
    }

    async fn ensure_status(&self, namespace: &str) -> Result<()> {
        let server_group = self.name();
        let recorded = self.gateway.status.as_ref().map(|s| s.server_group.as_str());
        if recorded == Some(server_group.as_str()) {
            return Ok(());
        }
        let status = IscsiGatewayStatus { server_group };
        self.ctx
            .kube
            .patch_gateway_status(&self.name(), namespace, &status)
            .await
    }

    // =========================================================================
    // Deletion
    // =========================================================================

    /// Release pool protection, then let the gateway go
    async fn finalize(&mut self) -> Result<ReconcileResult> {
        let namespace = self.namespace()?;

        for mut pool in self.ctx.kube.list_pools(&namespace).await? {
            if self.is_controlled_by_self(&pool)
                && remove_finalizer(&mut pool.metadata, POOL_FINALIZER)
            {
                self.ctx.kube.replace_pool(&pool).await?;
                info!(pool = %pool.name_any(), "released pool protection");
            }
        }

        self.publish(
            EventType::Normal,
            reasons::FINALIZED,
            actions::DELETE,
            "released gateway resources".to_string(),
        )
        .await;

        if remove_finalizer(&mut self.gateway.metadata, GATEWAY_FINALIZER) {
            self.gateway = self.ctx.kube.replace_gateway(&self.gateway).await?;
            info!("removed gateway finalizer");
        }
        Ok(ReconcileResult::Done)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Add this gateway as a plain owner of `child` if it is not one already
    fn claim<K: Resource>(&self, mut child: K) -> Result<Claim<K>> {
        let owner = self.instance().owner_reference().ok_or_else(|| {
            Error::internal_with_context("controller", "gateway has no uid")
        })?;
        if append_owner_reference(child.meta_mut(), owner) {
            Ok(Claim::Claimed(child))
        } else {
            Ok(Claim::Unchanged(child))
        }
    }

    async fn publish_created(&self, kind: &str, name: &str) {
        self.publish(
            EventType::Normal,
            reasons::RESOURCE_CREATED,
            actions::CREATE,
            format!("created {kind} {name}"),
        )
        .await;
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.ctx
            .events
            .publish(
                &self.gateway.object_ref(&()),
                type_,
                reason,
                action,
                Some(note),
            )
            .await;
    }
}

/// Outcome of an ownership claim
enum Claim<K> {
    /// The owner reference was already present
    Unchanged(K),
    /// The reference was appended and the child must be persisted
    Claimed(K),
}

//! Controller runner - wires the IscsiGateway controller to its watches

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use iscsi_common::crd::{CephBlockPool, IscsiGateway};
use iscsi_common::OperatorConfig;
use iscsi_gateway::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Gateways listed as owners of `obj`, controller or not
///
/// The tcmu-runner DaemonSet is shared and carries only plain owner
/// references, which `Controller::owns` does not follow.
fn owning_gateways<K: Resource>(obj: K) -> Vec<ObjectRef<IscsiGateway>> {
    let Some(namespace) = obj.meta().namespace.clone() else {
        return Vec::new();
    };
    let kind = IscsiGateway::kind(&());
    obj.owner_references()
        .iter()
        .filter(|r| r.kind == kind)
        .map(|r| ObjectRef::new(&r.name).within(&namespace))
        .collect()
}

/// Run the IscsiGateway controller until a shutdown signal arrives
pub async fn build_gateway_controller(client: Client, config: OperatorConfig) {
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
    let gateways: Api<IscsiGateway> = Api::all(client.clone());

    tracing::info!("- IscsiGateway controller");

    Controller::new(gateways, watcher_config())
        .owns(Api::<ConfigMap>::all(client.clone()), watcher_config())
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher_config(),
        )
        .owns(Api::<StatefulSet>::all(client.clone()), watcher_config())
        .owns(Api::<CephBlockPool>::all(client.clone()), watcher_config())
        .watches(
            Api::<DaemonSet>::all(client),
            watcher_config(),
            owning_gateways::<DaemonSet>,
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("IscsiGateway"))
        .await;
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

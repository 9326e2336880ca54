//! Controller behavior tests
//!
//! Test Philosophy:
//! - A `World` describes what exists in the cluster; its mock answers reads
//!   from that description and records every write
//! - Tests assert on OBSERVABLE OUTCOMES: the returned Action, the captured
//!   writes and the published events

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::ResourceExt;

use iscsi_common::crd::{CephBlockPool, IscsiGateway, IscsiGatewayStatus, IscsiStorageSpec};
use iscsi_common::events::EventPublisher;
use iscsi_common::kube_utils::{has_finalizer, has_owner_reference};
use iscsi_common::{Error, OperatorConfig, GATEWAY_FINALIZER, POOL_FINALIZER};

use super::*;
use crate::container_config::{ContainerConfig, CONFIG_JSON_KEY};
use crate::planner::{InstanceConfiguration, Planner};
use crate::resources::{
    build_config_map, build_daemon_set, build_pool, build_stateful_set, fixtures,
    write_container_config,
};

// =============================================================================
// Capture helpers
// =============================================================================

/// A write the controller performed
#[derive(Clone, Debug)]
enum Write {
    ReplaceGateway(IscsiGateway),
    PatchStatus(IscsiGatewayStatus),
    CreateConfigMap(ConfigMap),
    ReplaceConfigMap(ConfigMap),
    CreatePvc(PersistentVolumeClaim),
    CreateDaemonSet(DaemonSet),
    ReplaceDaemonSet(DaemonSet),
    CreateStatefulSet(StatefulSet),
    ReplaceStatefulSet(StatefulSet),
    CreatePool(CephBlockPool),
    ReplacePool(CephBlockPool),
    DeletePool(String),
}

#[derive(Clone, Default)]
struct WriteCapture {
    writes: Arc<Mutex<Vec<Write>>>,
}

impl WriteCapture {
    fn record(&self, write: Write) {
        self.writes
            .lock()
            .expect("mutex should not be poisoned")
            .push(write);
    }

    fn all(&self) -> Vec<Write> {
        self.writes
            .lock()
            .expect("mutex should not be poisoned")
            .clone()
    }
}

/// Event publisher that remembers what it was asked to publish
#[derive(Default)]
struct RecordingEvents {
    events: Mutex<Vec<(bool, String)>>,
}

impl RecordingEvents {
    fn warnings(&self) -> Vec<String> {
        self.reasons(true)
    }

    fn normals(&self) -> Vec<String> {
        self.reasons(false)
    }

    fn reasons(&self, warning: bool) -> Vec<String> {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .iter()
            .filter(|(w, _)| *w == warning)
            .map(|(_, reason)| reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingEvents {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        self.events
            .lock()
            .expect("mutex should not be poisoned")
            .push((matches!(type_, EventType::Warning), reason.to_string()));
    }
}

// =============================================================================
// World fixtures
// =============================================================================

fn test_date() -> chrono::NaiveDate {
    chrono::NaiveDate::from_ymd_opt(2024, 3, 7).expect("valid date")
}

/// Persisted gateway holding its finalizer
fn active_gateway() -> IscsiGateway {
    let mut gw = fixtures::gateway();
    gw.metadata.finalizers = Some(vec![GATEWAY_FINALIZER.to_string()]);
    gw.status = Some(IscsiGatewayStatus {
        server_group: "gw1".to_string(),
    });
    gw
}

/// The gateway ConfigMap holding the document the planner produces for `gw`
fn converged_config_map(gw: &IscsiGateway) -> ConfigMap {
    let cfg = OperatorConfig::default();
    let instance = InstanceConfiguration::new(gw, &cfg);
    let mut planner = Planner::new(instance, ContainerConfig::default());
    planner.update(test_date());
    config_map_with(gw, &planner.state)
}

fn config_map_with(gw: &IscsiGateway, config: &ContainerConfig) -> ConfigMap {
    let cfg = OperatorConfig::default();
    let mut cm = build_config_map(&InstanceConfiguration::new(gw, &cfg)).expect("config map");
    write_container_config(&mut cm, config).expect("document");
    cm
}

fn owned_pool(gw: &IscsiGateway, name: &str) -> CephBlockPool {
    let cfg = OperatorConfig::default();
    let storage = IscsiStorageSpec {
        pool_name: name.to_string(),
        ..Default::default()
    };
    build_pool(&InstanceConfiguration::new(gw, &cfg), &storage)
}

fn foreign_pool(name: &str) -> CephBlockPool {
    let mut pool = owned_pool(&fixtures::gateway(), name);
    pool.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "iscsi.ruohwai/v1alpha1".to_string(),
        kind: "IscsiGateway".to_string(),
        name: "gw2".to_string(),
        uid: "gw2-uid".to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    pool
}

fn stateful_set(gw: &IscsiGateway, replicas: i32) -> StatefulSet {
    let cfg = OperatorConfig::default();
    let mut sts = build_stateful_set(&InstanceConfiguration::new(gw, &cfg)).expect("sts");
    if let Some(spec) = sts.spec.as_mut() {
        spec.replicas = Some(replicas);
    }
    sts
}

/// What exists in the cluster when the pass runs
#[derive(Clone)]
struct World {
    gateway: Option<IscsiGateway>,
    ceph_config: bool,
    config_map: Option<ConfigMap>,
    pools: Vec<CephBlockPool>,
    daemon_set: Option<DaemonSet>,
    pvc: bool,
    stateful_set: Option<StatefulSet>,
    conflict_on_replace: bool,
    delete_fails: bool,
}

impl World {
    /// A gateway whose children all match its spec
    fn converged() -> Self {
        Self::converged_for(active_gateway())
    }

    fn converged_for(gw: IscsiGateway) -> Self {
        let cfg = OperatorConfig::default();
        let instance = InstanceConfiguration::new(&gw, &cfg);
        let daemon_set = build_daemon_set(&instance).expect("daemon set");
        let pools = gw
            .spec
            .storage
            .iter()
            .map(|s| build_pool(&instance, s))
            .collect();
        let replicas = instance.scale();
        Self {
            config_map: Some(converged_config_map(&gw)),
            pools,
            daemon_set: Some(daemon_set),
            pvc: true,
            stateful_set: Some(stateful_set(&gw, replicas)),
            ceph_config: true,
            conflict_on_replace: false,
            delete_fails: false,
            gateway: Some(gw),
        }
    }

    /// A freshly created gateway: only the Ceph configuration exists
    fn fresh() -> Self {
        Self {
            gateway: Some(fixtures::gateway()),
            ceph_config: true,
            config_map: None,
            pools: Vec::new(),
            daemon_set: None,
            pvc: false,
            stateful_set: None,
            conflict_on_replace: false,
            delete_fails: false,
        }
    }

    fn mock(&self, capture: &WriteCapture) -> MockGatewayKubeClient {
        let mut mock = MockGatewayKubeClient::new();

        // ----- reads -----
        let gateway = self.gateway.clone();
        mock.expect_get_gateway()
            .returning(move |_, _| Ok(gateway.clone()));

        let ceph_config = self.ceph_config;
        let config_map = self.config_map.clone();
        mock.expect_get_config_map().returning(move |name, _| {
            if name == "ceph-conf" {
                Ok(ceph_config.then(ConfigMap::default))
            } else {
                Ok(config_map.clone())
            }
        });

        let pools = self.pools.clone();
        mock.expect_get_pool()
            .returning(move |name, _| Ok(pools.iter().find(|p| p.name_any() == name).cloned()));
        let listed = self.pools.clone();
        mock.expect_list_pools()
            .returning(move |_| Ok(listed.clone()));

        let daemon_set = self.daemon_set.clone();
        mock.expect_get_daemon_set()
            .returning(move |_, _| Ok(daemon_set.clone()));

        let pvc = self.pvc;
        mock.expect_get_pvc()
            .returning(move |_, _| Ok(pvc.then(PersistentVolumeClaim::default)));

        let sts = self.stateful_set.clone();
        mock.expect_get_stateful_set()
            .returning(move |_, _| Ok(sts.clone()));

        // ----- writes -----
        let c = capture.clone();
        mock.expect_replace_gateway().returning(move |gw| {
            c.record(Write::ReplaceGateway(gw.clone()));
            Ok(gw.clone())
        });
        let c = capture.clone();
        mock.expect_patch_gateway_status()
            .returning(move |_, _, status| {
                c.record(Write::PatchStatus(status.clone()));
                Ok(())
            });
        let c = capture.clone();
        mock.expect_create_config_map().returning(move |cm| {
            c.record(Write::CreateConfigMap(cm.clone()));
            Ok(())
        });
        let c = capture.clone();
        mock.expect_replace_config_map().returning(move |cm| {
            c.record(Write::ReplaceConfigMap(cm.clone()));
            Ok(cm.clone())
        });
        let c = capture.clone();
        mock.expect_create_pvc().returning(move |pvc| {
            c.record(Write::CreatePvc(pvc.clone()));
            Ok(())
        });
        let c = capture.clone();
        mock.expect_create_daemon_set().returning(move |ds| {
            c.record(Write::CreateDaemonSet(ds.clone()));
            Ok(())
        });
        let c = capture.clone();
        mock.expect_replace_daemon_set().returning(move |ds| {
            c.record(Write::ReplaceDaemonSet(ds.clone()));
            Ok(ds.clone())
        });
        let c = capture.clone();
        mock.expect_create_stateful_set().returning(move |sts| {
            c.record(Write::CreateStatefulSet(sts.clone()));
            Ok(())
        });
        let c = capture.clone();
        let conflict = self.conflict_on_replace;
        mock.expect_replace_stateful_set().returning(move |sts| {
            if conflict {
                return Err(Error::conflict("StatefulSet", sts.name_any()));
            }
            c.record(Write::ReplaceStatefulSet(sts.clone()));
            Ok(sts.clone())
        });
        let c = capture.clone();
        mock.expect_create_pool().returning(move |pool| {
            c.record(Write::CreatePool(pool.clone()));
            Ok(())
        });
        let c = capture.clone();
        mock.expect_replace_pool().returning(move |pool| {
            c.record(Write::ReplacePool(pool.clone()));
            Ok(pool.clone())
        });
        let c = capture.clone();
        let delete_fails = self.delete_fails;
        mock.expect_delete_pool().returning(move |name, _| {
            if delete_fails {
                return Err(Error::internal("delete refused"));
            }
            c.record(Write::DeletePool(name.to_string()));
            Ok(())
        });

        mock
    }
}

/// Outcome of one reconcile pass against a World
struct Pass {
    result: Result<Action>,
    writes: Vec<Write>,
    events: Arc<RecordingEvents>,
    ctx: Arc<Context>,
}

async fn run_pass(world: &World) -> Pass {
    let capture = WriteCapture::default();
    let events = Arc::new(RecordingEvents::default());
    let mut ctx = Context::for_testing(Arc::new(world.mock(&capture)));
    ctx.events = events.clone() as Arc<dyn EventPublisher>;
    ctx.today = test_date;
    let ctx = Arc::new(ctx);

    let trigger = world.gateway.clone().unwrap_or_else(fixtures::gateway);
    let result = reconcile(Arc::new(trigger), ctx.clone()).await;
    Pass {
        result,
        writes: capture.all(),
        events,
        ctx,
    }
}

fn requeue_now() -> Action {
    Action::requeue(Duration::ZERO)
}

fn persisted_document(cm: &ConfigMap) -> ContainerConfig {
    let doc = cm.data.as_ref().and_then(|d| d.get(CONFIG_JSON_KEY));
    ContainerConfig::from_document(doc.map(String::as_str)).expect("valid document")
}

// =============================================================================
// Lifecycle flow
// =============================================================================

mod lifecycle_flow {
    use super::*;

    /// Story: A gateway that has been deleted since the event was queued is
    /// simply forgotten.
    #[tokio::test]
    async fn story_vanished_gateway_is_done() {
        let world = World {
            gateway: None,
            ..World::fresh()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        assert!(pass.writes.is_empty());
    }

    /// Story: When everything already matches the spec, a pass performs no
    /// writes and waits for the next change.
    #[tokio::test]
    async fn story_converged_gateway_is_left_alone() {
        let pass = run_pass(&World::converged()).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        assert!(pass.writes.is_empty(), "unexpected writes: {:?}", pass.writes);
        assert!(pass.events.warnings().is_empty());
    }

    /// Story: A new gateway first gets its finalizer, and the pass ends so
    /// the next one sees the stored object.
    #[tokio::test]
    async fn story_new_gateway_gets_finalizer_first() {
        let pass = run_pass(&World::fresh()).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        assert_eq!(pass.writes.len(), 1);
        match &pass.writes[0] {
            Write::ReplaceGateway(gw) => assert!(has_finalizer(&gw.metadata, GATEWAY_FINALIZER)),
            other => panic!("expected finalizer write, got {other:?}"),
        }
    }

    /// Story: Bringing up a new gateway takes one pass per created child, in
    /// a fixed order.
    #[tokio::test]
    async fn story_children_are_created_one_pass_at_a_time() {
        let gw = active_gateway();
        let mut world = World {
            gateway: Some(gw.clone()),
            ..World::fresh()
        };

        let pass = run_pass(&world).await;
        assert_eq!(pass.result.unwrap(), requeue_now());
        assert!(matches!(pass.writes.as_slice(), [Write::CreatePool(_)]));
        world.pools = vec![owned_pool(&gw, "rbd")];

        let pass = run_pass(&world).await;
        assert_eq!(pass.result.unwrap(), requeue_now());
        assert!(matches!(pass.writes.as_slice(), [Write::CreateConfigMap(_)]));
        world.config_map = Some(build_config_map(&InstanceConfiguration::new(&gw, &pass.ctx.config)).unwrap());

        let pass = run_pass(&world).await;
        assert_eq!(pass.result.unwrap(), requeue_now());
        let Write::ReplaceConfigMap(cm) = &pass.writes[0] else {
            panic!("expected configuration write, got {:?}", pass.writes);
        };
        world.config_map = Some(cm.clone());

        let pass = run_pass(&world).await;
        assert_eq!(pass.result.unwrap(), requeue_now());
        assert!(matches!(pass.writes.as_slice(), [Write::CreateDaemonSet(_)]));
        world.daemon_set = Some(build_daemon_set(&InstanceConfiguration::new(&gw, &pass.ctx.config)).unwrap());

        let pass = run_pass(&world).await;
        assert_eq!(pass.result.unwrap(), requeue_now());
        assert!(matches!(pass.writes.as_slice(), [Write::CreatePvc(_)]));
        world.pvc = true;

        let pass = run_pass(&world).await;
        assert_eq!(pass.result.unwrap(), requeue_now());
        let Write::CreateStatefulSet(sts) = &pass.writes[0] else {
            panic!("expected StatefulSet creation, got {:?}", pass.writes);
        };
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(3));
        world.stateful_set = Some(sts.clone());

        let pass = run_pass(&world).await;
        assert_eq!(pass.result.unwrap(), Action::await_change());
        assert!(pass.writes.is_empty());

        assert_eq!(
            pass.events.normals().len(),
            0,
            "the converged pass publishes nothing"
        );
    }

    /// Story: Every created child is announced with a Normal event.
    #[tokio::test]
    async fn story_creation_is_announced() {
        let world = World {
            pools: Vec::new(),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        assert_eq!(pass.events.normals(), vec!["ResourceCreated"]);
    }
}

// =============================================================================
// Prerequisites and validation
// =============================================================================

mod prerequisites {
    use super::*;

    /// Story: Without the user's Ceph configuration the gateway cannot run.
    /// The pass fails with a missing prerequisite, a Warning event is
    /// published, and the retry waits longer than usual.
    #[tokio::test]
    async fn story_missing_ceph_config_is_reported_and_retried_slowly() {
        let world = World {
            ceph_config: false,
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        let err = pass.result.unwrap_err();
        assert!(matches!(err, Error::PrerequisiteMissing { ref name, .. } if name == "ceph-conf"));
        assert!(pass.writes.is_empty());
        assert_eq!(pass.events.warnings(), vec!["PrerequisiteMissing"]);

        let action = error_policy(Arc::new(active_gateway()), &err, pass.ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    /// Story: A spec with a duplicated pool is rejected before anything is
    /// written and is not retried until the spec changes.
    #[tokio::test]
    async fn story_invalid_spec_waits_for_a_fix() {
        let mut gw = active_gateway();
        let dup = gw.spec.storage[0].clone();
        gw.spec.storage.push(dup);
        let world = World {
            gateway: Some(gw.clone()),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        let err = pass.result.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(pass.writes.is_empty());
        assert_eq!(pass.events.warnings(), vec!["ValidationFailed"]);
        assert_eq!(
            error_policy(Arc::new(gw), &err, pass.ctx),
            Action::await_change()
        );
    }

    /// Story: A corrupted configuration document is a hard error; the
    /// operator will not guess what the gateway should export.
    #[tokio::test]
    async fn story_malformed_document_is_not_retried() {
        let mut cm = converged_config_map(&active_gateway());
        cm.data = Some(BTreeMap::from([(
            CONFIG_JSON_KEY.to_string(),
            "{oops".to_string(),
        )]));
        let world = World {
            config_map: Some(cm),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        let err = pass.result.unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
        assert_eq!(pass.events.warnings(), vec!["ReconcileFailed"]);
    }
}

// =============================================================================
// Pools
// =============================================================================

mod pools {
    use super::*;

    /// Story: A missing pool is created protected by the pool finalizer and
    /// controlled by the gateway.
    #[tokio::test]
    async fn story_missing_pool_is_created_with_protection() {
        let world = World {
            pools: Vec::new(),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        let [Write::CreatePool(pool)] = pass.writes.as_slice() else {
            panic!("expected a single pool creation, got {:?}", pass.writes);
        };
        assert_eq!(pool.name_any(), "rbd");
        assert!(has_finalizer(&pool.metadata, POOL_FINALIZER));
        let owner = &pool.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.name, "gw1");
        assert_eq!(owner.controller, Some(true));
    }

    /// Story: A pool name already controlled by another gateway is a naming
    /// conflict that needs a human.
    #[tokio::test]
    async fn story_pool_owned_by_another_gateway_is_a_conflict() {
        let world = World {
            pools: vec![foreign_pool("rbd")],
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        let err = pass.result.unwrap_err();
        assert!(matches!(err, Error::PoolConflict { ref pool, .. } if pool == "rbd"));
        assert!(!err.is_retryable());
        assert!(pass.writes.is_empty());
        assert_eq!(pass.events.warnings(), vec!["PoolConflict"]);
    }

    /// Story: A pool created by someone else without a controller is used
    /// as is.
    #[tokio::test]
    async fn story_unmanaged_pool_is_adopted_without_writes() {
        let mut pool = owned_pool(&active_gateway(), "rbd");
        pool.metadata.owner_references = None;
        let world = World {
            pools: vec![pool],
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        assert!(pass.writes.is_empty());
    }

    /// Story: When a pool is dropped from the spec, its protection is
    /// released and it is deleted; the document is then rewritten without it.
    #[tokio::test]
    async fn story_dropped_pool_is_released_and_deleted() {
        let gw = active_gateway();
        let mut persisted = persisted_document(&converged_config_map(&gw));
        persisted
            .storage
            .insert("old".to_string(), BTreeMap::from([("d".to_string(), "1G".to_string())]));
        let world = World {
            config_map: Some(config_map_with(&gw, &persisted)),
            pools: vec![owned_pool(&gw, "rbd"), owned_pool(&gw, "old")],
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        let released = pass.writes.iter().find_map(|w| match w {
            Write::ReplacePool(p) => Some(p.clone()),
            _ => None,
        });
        let released = released.expect("pool finalizer should be removed");
        assert_eq!(released.name_any(), "old");
        assert!(!has_finalizer(&released.metadata, POOL_FINALIZER));
        assert!(pass
            .writes
            .iter()
            .any(|w| matches!(w, Write::DeletePool(name) if name == "old")));

        let rewritten = pass.writes.iter().find_map(|w| match w {
            Write::ReplaceConfigMap(cm) => Some(persisted_document(cm)),
            _ => None,
        });
        let rewritten = rewritten.expect("document should be rewritten");
        assert!(!rewritten.storage.contains_key("old"));
        assert!(rewritten.storage.contains_key("rbd"));
    }

    /// Story: Stale pools belonging to another gateway are never touched.
    #[tokio::test]
    async fn story_foreign_stale_pool_is_left_alone() {
        let gw = active_gateway();
        let mut persisted = persisted_document(&converged_config_map(&gw));
        persisted.storage.insert("theirs".to_string(), BTreeMap::new());
        let world = World {
            config_map: Some(config_map_with(&gw, &persisted)),
            pools: vec![owned_pool(&gw, "rbd"), foreign_pool("theirs")],
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        assert!(!pass
            .writes
            .iter()
            .any(|w| matches!(w, Write::ReplacePool(_) | Write::DeletePool(_))));
    }

    /// Story: Pruning is best effort; a failed delete does not fail the pass.
    #[tokio::test]
    async fn story_prune_failure_does_not_fail_the_pass() {
        let gw = active_gateway();
        let mut persisted = persisted_document(&converged_config_map(&gw));
        persisted.storage.insert("old".to_string(), BTreeMap::new());
        let world = World {
            config_map: Some(config_map_with(&gw, &persisted)),
            pools: vec![owned_pool(&gw, "rbd"), owned_pool(&gw, "old")],
            delete_fails: true,
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        assert!(pass.events.warnings().is_empty());
    }
}

// =============================================================================
// Configuration and ownership
// =============================================================================

mod configuration {
    use super::*;

    /// Story: Growing a disk rewrites the persisted document once.
    #[tokio::test]
    async fn story_disk_resize_rewrites_document() {
        let old = active_gateway();
        let mut gw = old.clone();
        gw.spec.storage[0].disks[0].disk_size = "20G".to_string();
        let world = World {
            gateway: Some(gw),
            config_map: Some(converged_config_map(&old)),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        let [Write::ReplaceConfigMap(cm)] = pass.writes.as_slice() else {
            panic!("expected one document write, got {:?}", pass.writes);
        };
        assert_eq!(persisted_document(cm).storage["rbd"]["disk1"], "20G");
    }

    /// Story: The operator hostname default changed; globals follow it.
    #[tokio::test]
    async fn story_global_defaults_follow_operator_config() {
        let gw = active_gateway();
        let mut persisted = persisted_document(&converged_config_map(&gw));
        if let Some(entry) = persisted.globals.entry.as_mut() {
            entry.options.hostname = "iqn.1999.old:client".to_string();
        }
        let world = World {
            config_map: Some(config_map_with(&gw, &persisted)),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        let [Write::ReplaceConfigMap(cm)] = pass.writes.as_slice() else {
            panic!("expected one document write, got {:?}", pass.writes);
        };
        let globals = persisted_document(cm).globals.entry.unwrap();
        assert_eq!(globals.options.hostname, "iqn.0000.default:client");
    }

    /// Story: A ConfigMap that already matches but lists no owner is claimed
    /// with a single write, and the pass carries on to the workload.
    #[tokio::test]
    async fn story_unowned_config_map_is_claimed_once() {
        let gw = active_gateway();
        let mut cm = converged_config_map(&gw);
        cm.metadata.owner_references = None;
        let world = World {
            config_map: Some(cm),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        let [Write::ReplaceConfigMap(claimed)] = pass.writes.as_slice() else {
            panic!("expected one claim, got {:?}", pass.writes);
        };
        let refs = claimed.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "gw1");
        assert_eq!(refs[0].controller, None);
    }

    /// Story: An unowned ConfigMap with a stale document is claimed first,
    /// and the document update in the same pass keeps the claim.
    #[tokio::test]
    async fn story_claimed_config_map_carries_the_claim_into_the_update() {
        let old = active_gateway();
        let mut gw = old.clone();
        gw.spec.storage[0].disks[0].disk_size = "20G".to_string();
        let mut cm = converged_config_map(&old);
        cm.metadata.owner_references = None;
        let world = World {
            gateway: Some(gw),
            config_map: Some(cm),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        let [Write::ReplaceConfigMap(claimed), Write::ReplaceConfigMap(updated)] =
            pass.writes.as_slice()
        else {
            panic!("expected claim then document write, got {:?}", pass.writes);
        };
        assert_eq!(persisted_document(claimed).storage["rbd"]["disk1"], "10G");
        assert_eq!(persisted_document(updated).storage["rbd"]["disk1"], "20G");
        assert_eq!(
            updated.metadata.owner_references,
            claimed.metadata.owner_references
        );
    }

    /// Story: A shared tcmu-runner DaemonSet created by another gateway is
    /// claimed once with a plain owner reference, and the pass continues.
    #[tokio::test]
    async fn story_shared_daemon_set_is_claimed() {
        let gw = active_gateway();
        let mut ds = build_daemon_set(&InstanceConfiguration::new(&gw, &OperatorConfig::default()))
            .unwrap();
        ds.metadata.owner_references = None;
        let world = World {
            daemon_set: Some(ds),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        let [Write::ReplaceDaemonSet(claimed)] = pass.writes.as_slice() else {
            panic!("expected one claim, got {:?}", pass.writes);
        };
        let refs = claimed.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "gw1");
        assert_eq!(refs[0].controller, None);

        // The claimed object is what the next pass reads: no second write
        let world = World {
            daemon_set: Some(claimed.clone()),
            ..World::converged()
        };
        let pass = run_pass(&world).await;
        assert!(pass.writes.is_empty());
    }

    /// Story: Another gateway sharing the DaemonSet keeps its reference
    /// when this one claims it.
    #[tokio::test]
    async fn story_claim_keeps_existing_owners() {
        let other = {
            let mut gw = fixtures::gateway();
            gw.metadata.name = Some("gw2".to_string());
            gw.metadata.uid = Some("gw2-uid".to_string());
            gw
        };
        let ds = build_daemon_set(&InstanceConfiguration::new(&other, &OperatorConfig::default()))
            .unwrap();
        let world = World {
            daemon_set: Some(ds),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        let [Write::ReplaceDaemonSet(claimed)] = pass.writes.as_slice() else {
            panic!("expected one claim, got {:?}", pass.writes);
        };
        let gw1 = InstanceConfiguration::new(&active_gateway(), &OperatorConfig::default())
            .owner_reference()
            .unwrap();
        assert!(has_owner_reference(&claimed.metadata, &gw1));
        assert_eq!(claimed.metadata.owner_references.as_ref().unwrap().len(), 2);
    }
}

// =============================================================================
// Clustered workload
// =============================================================================

mod workload {
    use super::*;

    /// Story: Raising scale from 2 to 5 updates the StatefulSet and
    /// announces the scale-up.
    #[tokio::test]
    async fn story_scale_up_is_applied() {
        let mut gw = active_gateway();
        gw.spec.scale = 5;
        let world = World {
            stateful_set: Some(stateful_set(&gw, 2)),
            ..World::converged_for(gw)
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        let [Write::ReplaceStatefulSet(sts)] = pass.writes.as_slice() else {
            panic!("expected one scale write, got {:?}", pass.writes);
        };
        assert_eq!(sts.spec.as_ref().unwrap().replicas, Some(5));
        assert_eq!(pass.events.normals(), vec!["ScaledUp"]);
    }

    /// Story: An existing StatefulSet without our reference is claimed, and
    /// the claim alone does not requeue.
    #[tokio::test]
    async fn story_unowned_stateful_set_is_claimed_without_requeue() {
        let gw = active_gateway();
        let mut sts = stateful_set(&gw, 3);
        sts.metadata.owner_references = None;
        let world = World {
            stateful_set: Some(sts),
            ..World::converged_for(gw)
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        let [Write::ReplaceStatefulSet(claimed)] = pass.writes.as_slice() else {
            panic!("expected one claim, got {:?}", pass.writes);
        };
        let refs = claimed.metadata.owner_references.as_ref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "gw1");
        assert_eq!(claimed.spec.as_ref().unwrap().replicas, Some(3));
    }

    /// Story: Lowering scale never shrinks a running gateway.
    #[tokio::test]
    async fn story_scale_down_is_not_applied() {
        let gw = active_gateway();
        let world = World {
            stateful_set: Some(stateful_set(&gw, 5)),
            ..World::converged_for(gw)
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        assert!(pass.writes.is_empty());
    }

    /// Story: A single-replica gateway stops after the support daemon with
    /// a Warning; an existing two-replica StatefulSet is not touched.
    #[tokio::test]
    async fn story_single_gateway_requires_clustered_mode() {
        let mut gw = active_gateway();
        gw.spec.scale = 1;
        let world = World {
            pvc: false,
            stateful_set: Some(stateful_set(&gw, 2)),
            ..World::converged_for(gw)
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        assert!(pass.writes.is_empty(), "unexpected writes: {:?}", pass.writes);
        assert_eq!(pass.events.warnings(), vec!["ClusteredModeRequired"]);
    }

    /// Story: A write conflict is not an error; the pass is retried at once.
    #[tokio::test]
    async fn story_conflict_requeues_without_warning() {
        let mut gw = active_gateway();
        gw.spec.scale = 4;
        let world = World {
            stateful_set: Some(stateful_set(&gw, 2)),
            conflict_on_replace: true,
            ..World::converged_for(gw)
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), requeue_now());
        assert!(pass.events.warnings().is_empty());
    }

    /// Story: Once the workload exists the gateway status names it.
    #[tokio::test]
    async fn story_status_records_server_group() {
        let mut gw = active_gateway();
        gw.status = None;
        let world = World::converged_for(gw);
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        let [Write::PatchStatus(status)] = pass.writes.as_slice() else {
            panic!("expected a status patch, got {:?}", pass.writes);
        };
        assert_eq!(status.server_group, "gw1");
    }
}

// =============================================================================
// Deletion
// =============================================================================

mod deletion {
    use super::*;

    fn deleting(mut gw: IscsiGateway) -> IscsiGateway {
        gw.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        gw
    }

    /// Story: Deleting a gateway releases the protection on its own pools,
    /// leaves other gateways' pools alone and then drops its finalizer.
    #[tokio::test]
    async fn story_finalize_releases_owned_pools() {
        let gw = deleting(active_gateway());
        let world = World {
            gateway: Some(gw.clone()),
            pools: vec![owned_pool(&gw, "rbd"), foreign_pool("theirs")],
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        let [Write::ReplacePool(pool), Write::ReplaceGateway(released)] = pass.writes.as_slice()
        else {
            panic!("expected pool release then finalizer removal, got {:?}", pass.writes);
        };
        assert_eq!(pool.name_any(), "rbd");
        assert!(!has_finalizer(&pool.metadata, POOL_FINALIZER));
        assert!(!has_finalizer(&released.metadata, GATEWAY_FINALIZER));
        assert_eq!(pass.events.normals(), vec!["Finalized"]);
    }

    /// Story: A gateway being deleted without our finalizer needs nothing
    /// from us.
    #[tokio::test]
    async fn story_deletion_without_finalizer_is_done() {
        let mut gw = deleting(active_gateway());
        gw.metadata.finalizers = None;
        let world = World {
            gateway: Some(gw),
            ..World::converged()
        };
        let pass = run_pass(&world).await;

        assert_eq!(pass.result.unwrap(), Action::await_change());
        assert!(pass.writes.is_empty());
    }
}

// =============================================================================
// Error policy
// =============================================================================

mod error_policy_tests {
    use super::*;

    fn ctx() -> Arc<Context> {
        Arc::new(Context::for_testing(Arc::new(MockGatewayKubeClient::new())))
    }

    #[test]
    fn retryable_errors_back_off_thirty_seconds() {
        let action = error_policy(
            Arc::new(active_gateway()),
            &Error::conflict("ConfigMap", "gw1"),
            ctx(),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn permanent_errors_wait_for_change() {
        for err in [
            Error::pool_conflict("rbd", "IscsiGateway/gw2"),
            Error::internal("template"),
            Error::serialization("bad document"),
        ] {
            assert_eq!(
                error_policy(Arc::new(active_gateway()), &err, ctx()),
                Action::await_change()
            );
        }
    }
}

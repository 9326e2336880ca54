//! CephBlockPool children

use iscsi_common::crd::{CephBlockPool, CephBlockPoolSpec, IscsiStorageSpec};
use iscsi_common::POOL_FINALIZER;

use super::{managed_labels, owned_metadata};
use crate::planner::InstanceConfiguration;

/// A pool for `storage`, protected by the pool finalizer
///
/// A storage entry without a pool spec yields a pool with an empty spec.
pub fn build_pool(instance: &InstanceConfiguration<'_>, storage: &IscsiStorageSpec) -> CephBlockPool {
    let mut pool = CephBlockPool::new(
        &storage.pool_name,
        CephBlockPoolSpec {
            pool: storage.pool_spec.clone().unwrap_or_default(),
        },
    );
    pool.metadata = owned_metadata(instance, storage.pool_name.clone(), managed_labels(instance));
    pool.metadata.finalizers = Some(vec![POOL_FINALIZER.to_string()]);
    pool
}

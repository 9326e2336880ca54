//! Custom Resource Definitions used by the iSCSI gateway operator.
//!
//! `IscsiGateway` is owned by this operator. `CephBlockPool` belongs to Rook
//! and is modelled here only so the controller can create and watch pools.

mod ceph_block_pool;
mod iscsi_gateway;

pub use ceph_block_pool::{
    CephBlockPool, CephBlockPoolSpec, ErasureCodedSpec, PoolSpec, ReplicatedSpec,
};
pub use iscsi_gateway::{
    IscsiDiskSpec, IscsiGateway, IscsiGatewaySpec, IscsiGatewayStatus, IscsiHostSpec,
    IscsiLunSpec, IscsiStorageSpec, LifecycleState,
};

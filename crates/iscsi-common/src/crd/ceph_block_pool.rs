//! Rook `CephBlockPool` resource
//!
//! Only the subset of the Rook pool spec that gateways pass through is
//! modelled. The gateway never interprets these fields.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A Ceph RBD pool managed by Rook.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephBlockPool",
    plural = "cephblockpools",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CephBlockPoolSpec {
    /// Pool settings forwarded from the gateway's storage entry
    #[serde(flatten)]
    pub pool: PoolSpec,
}

/// Pool settings shared by the gateway spec and the Rook pool spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// CRUSH failure domain (host, osd, rack, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,

    /// OSD device class the pool is restricted to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,

    /// CRUSH root for the pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crush_root: Option<String>,

    /// Replicated pool settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicated: Option<ReplicatedSpec>,

    /// Erasure-coded pool settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erasure_coded: Option<ErasureCodedSpec>,

    /// Raw Ceph pool parameters
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

/// Replication settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicatedSpec {
    /// Number of copies per object
    pub size: u32,

    /// Refuse sizes below the Ceph-recommended minimum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_safe_replica_size: Option<bool>,
}

/// Erasure coding settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErasureCodedSpec {
    /// Number of data chunks
    pub data_chunks: u32,
    /// Number of coding chunks
    pub coding_chunks: u32,
}

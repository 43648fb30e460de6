//! The full cluster snapshot: all open buckets plus the optional
//! cluster-wide global config.

use crate::bucket::{BucketConfig, NodeInfo};
use crate::NodeIdentifier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cluster-wide topology advertised independently of any bucket.
///
/// Carries the same per-node shape as a bucket config, without a
/// partition map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    port_infos: Vec<NodeInfo>,
}

impl GlobalConfig {
    pub fn new(port_infos: Vec<NodeInfo>) -> Self {
        Self { port_infos }
    }

    pub fn port_infos(&self) -> &[NodeInfo] {
        &self.port_infos
    }

    pub fn has_node(&self, identifier: &NodeIdentifier) -> bool {
        self.port_infos.iter().any(|n| n.identifier() == identifier)
    }
}

/// One immutable snapshot of everything the client knows about the
/// cluster. Replaced atomically; never mutated in place.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    buckets: HashMap<String, BucketConfig>,

    #[serde(default)]
    global: Option<GlobalConfig>,
}

impl ClusterConfig {
    pub fn new(buckets: HashMap<String, BucketConfig>, global: Option<GlobalConfig>) -> Self {
        Self { buckets, global }
    }

    pub fn bucket_configs(&self) -> &HashMap<String, BucketConfig> {
        &self.buckets
    }

    pub fn bucket_config(&self, name: &str) -> Option<&BucketConfig> {
        self.buckets.get(name)
    }

    pub fn global_config(&self) -> Option<&GlobalConfig> {
        self.global.as_ref()
    }

    /// True when the snapshot carries no topology at all, which tells the
    /// reconciler to disconnect everything.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.global.is_none()
    }

    /// Whether the node appears in any bucket or in the global config.
    pub fn has_node(&self, identifier: &NodeIdentifier) -> bool {
        self.buckets.values().any(|bc| bc.has_node(identifier))
            || self.global.as_ref().is_some_and(|gc| gc.has_node(identifier))
    }
}

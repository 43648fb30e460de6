//! Cluster topology model and configuration provider interface.
//!
//! A Kelp cluster describes itself through JSON configuration snapshots:
//! per-bucket topologies (nodes, per-service ports, partition map) and an
//! optional cluster-wide global config. This crate holds the immutable
//! value types for those snapshots and the [`ConfigProvider`] trait the
//! core consumes them through.
//!
//! # Modules
//!
//! - [`bucket`]: per-bucket topology (nodes, ports, partition map)
//! - [`cluster`]: the full snapshot (`ClusterConfig`) and global config
//! - [`provider`]: the provider trait, its errors, and a push-driven
//!   implementation for tests and fixed topologies

pub mod bucket;
pub mod cluster;
pub mod provider;

pub use bucket::{AlternateAddress, BucketConfig, NodeInfo, PartitionMap};
pub use cluster::{ClusterConfig, GlobalConfig};
pub use provider::{CancelCause, ConfigError, ConfigProvider, StaticConfigProvider};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identity of a server in the cluster: hostname plus the
/// management port. Stable across service add/remove on that node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeIdentifier {
    address: String,
    manager_port: u16,
}

impl NodeIdentifier {
    pub fn new(address: impl Into<String>, manager_port: u16) -> Self {
        Self {
            address: address.into(),
            manager_port,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn manager_port(&self) -> u16 {
        self.manager_port
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.manager_port)
    }
}

/// The services a cluster node can host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[serde(rename = "kv")]
    KeyValue,
    Query,
    Analytics,
    Search,
    Views,
    Manager,
    Eventing,
}

/// Whether a service is opened per bucket or once per cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceScope {
    Bucket,
    Cluster,
}

impl ServiceType {
    /// All known service types, in dispatch-table order.
    pub const ALL: [ServiceType; 7] = [
        ServiceType::KeyValue,
        ServiceType::Query,
        ServiceType::Analytics,
        ServiceType::Search,
        ServiceType::Views,
        ServiceType::Manager,
        ServiceType::Eventing,
    ];

    /// Short identifier used in logs, metric tags and error contexts.
    pub fn ident(self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Analytics => "analytics",
            ServiceType::Search => "search",
            ServiceType::Views => "views",
            ServiceType::Manager => "mgmt",
            ServiceType::Eventing => "eventing",
        }
    }

    /// KV and view connections are bound to a bucket; everything else is
    /// cluster level.
    pub fn scope(self) -> ServiceScope {
        match self {
            ServiceType::KeyValue | ServiceType::Views => ServiceScope::Bucket,
            _ => ServiceScope::Cluster,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ident())
    }
}

//! Per-bucket topology: the nodes hosting a bucket, their per-service
//! ports, alternate addresses and the partition map.

use crate::{NodeIdentifier, ServiceType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Network-visible hostname and ports for clients on another network
/// segment (NAT, port-forwarded deployments).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlternateAddress {
    pub hostname: String,

    /// Plaintext ports per service.
    #[serde(default)]
    pub ports: HashMap<ServiceType, u16>,

    /// TLS ports per service.
    #[serde(default)]
    pub tls_ports: HashMap<ServiceType, u16>,
}

impl AlternateAddress {
    /// The service map for the requested security mode. May be empty, in
    /// which case callers fall back to the node's primary map.
    pub fn service_map(&self, tls: bool) -> &HashMap<ServiceType, u16> {
        if tls {
            &self.tls_ports
        } else {
            &self.ports
        }
    }
}

/// One node as seen in a bucket or global config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    identifier: NodeIdentifier,
    hostname: String,

    #[serde(default)]
    ports: HashMap<ServiceType, u16>,

    #[serde(default)]
    tls_ports: HashMap<ServiceType, u16>,

    /// Alternate address table, keyed by network name (e.g. "external").
    #[serde(default)]
    alternate_addresses: HashMap<String, AlternateAddress>,
}

impl NodeInfo {
    pub fn new(
        identifier: NodeIdentifier,
        hostname: impl Into<String>,
        ports: HashMap<ServiceType, u16>,
        tls_ports: HashMap<ServiceType, u16>,
    ) -> Self {
        Self {
            identifier,
            hostname: hostname.into(),
            ports,
            tls_ports,
            alternate_addresses: HashMap::new(),
        }
    }

    pub fn with_alternate(mut self, network: impl Into<String>, address: AlternateAddress) -> Self {
        self.alternate_addresses.insert(network.into(), address);
        self
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The primary service map for the requested security mode.
    pub fn service_map(&self, tls: bool) -> &HashMap<ServiceType, u16> {
        if tls {
            &self.tls_ports
        } else {
            &self.ports
        }
    }

    pub fn alternate_address(&self, network: &str) -> Option<&AlternateAddress> {
        self.alternate_addresses.get(network)
    }
}

/// Maps partitions onto indexes into the bucket's node list.
///
/// Each entry is the replica chain for one partition; the first element is
/// the active copy. `-1` marks a slot with no node assigned (mid-rebalance).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    map: Vec<Vec<i16>>,
}

impl PartitionMap {
    pub fn new(map: Vec<Vec<i16>>) -> Self {
        Self { map }
    }

    pub fn num_partitions(&self) -> u16 {
        self.map.len() as u16
    }

    /// Index of the node holding the active copy of `partition`, if any.
    pub fn active_node_index(&self, partition: u16) -> Option<usize> {
        let chain = self.map.get(partition as usize)?;
        match chain.first() {
            Some(&idx) if idx >= 0 => Some(idx as usize),
            _ => None,
        }
    }
}

/// Immutable topology snapshot for one bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketConfig {
    name: String,
    nodes: Vec<NodeInfo>,

    #[serde(default)]
    partitions: PartitionMap,
}

impl BucketConfig {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeInfo>, partitions: PartitionMap) -> Self {
        Self {
            name: name.into(),
            nodes,
            partitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    pub fn partitions(&self) -> &PartitionMap {
        &self.partitions
    }

    /// Whether the given node hosts this bucket.
    pub fn has_node(&self, identifier: &NodeIdentifier) -> bool {
        self.nodes.iter().any(|n| n.identifier() == identifier)
    }
}

//! Service locators: picking the (node, service) pair for a request.
//!
//! KV requests hash their key onto a partition and go to the node owning
//! the active copy. HTTP services spread over the eligible nodes
//! round-robin, with per-service eligibility rules (views need the node
//! to host the bucket, analytics is restricted to analytics nodes).
//! Failures here are not terminal: they are handed to the request's
//! retry strategy, since the next config may make them dispatchable.

use crate::core::Core;
use crate::error::KelpError;
use crate::node::Node;
use crate::request::KelpRequest;
use crate::retry::{self, RetryReason};
use kelp_config::{ClusterConfig, NodeInfo, ServiceType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A single-service-type routing policy.
pub(crate) trait Locator: Send + Sync {
    fn dispatch(
        &self,
        request: Arc<dyn KelpRequest>,
        nodes: &[Arc<Node>],
        config: &ClusterConfig,
        core: &Core,
    );
}

/// Routes KV requests by partition hash.
pub(crate) struct KeyValueLocator;

impl Locator for KeyValueLocator {
    fn dispatch(
        &self,
        request: Arc<dyn KelpRequest>,
        nodes: &[Arc<Node>],
        config: &ClusterConfig,
        core: &Core,
    ) {
        let Some(bucket) = request.bucket().map(str::to_string) else {
            request.fail(KelpError::InvalidArgument(
                "KV request without a bucket".to_string(),
            ));
            return;
        };

        let Some(bucket_config) = config.bucket_config(&bucket) else {
            retry::orchestrate(core, request, RetryReason::BucketConfigNotAvailable);
            return;
        };

        let partitions = bucket_config.partitions();
        if partitions.num_partitions() == 0 {
            retry::orchestrate(core, request, RetryReason::BucketConfigNotAvailable);
            return;
        }

        // Stamp the partition before resolving the node so that even a
        // retried request carries its binding.
        let partition = match request.as_kv() {
            Some(kv) => {
                let partition =
                    kelp_placement::partition_for_key(kv.key(), partitions.num_partitions());
                kv.set_partition(partition);
                partition
            }
            None => {
                request.fail(KelpError::InvalidArgument(
                    "non-KV request routed through the KV locator".to_string(),
                ));
                return;
            }
        };

        let Some(node_index) = partitions.active_node_index(partition) else {
            retry::orchestrate(core, request, RetryReason::PartitionNotAvailable);
            return;
        };
        let Some(node_info) = bucket_config.nodes().get(node_index) else {
            retry::orchestrate(core, request, RetryReason::NodeNotAvailable);
            return;
        };

        let Some(node) = nodes
            .iter()
            .find(|n| n.identifier() == node_info.identifier())
        else {
            retry::orchestrate(core, request, RetryReason::NodeNotAvailable);
            return;
        };

        if let Err(reason) = node.send(request.clone()) {
            retry::orchestrate(core, request, reason);
        }
    }
}

type NodeFilter = fn(&Node, &dyn KelpRequest, &ClusterConfig) -> bool;

/// Spreads requests over the nodes with the service enabled.
pub(crate) struct RoundRobinLocator {
    service_type: ServiceType,
    cursor: AtomicUsize,
    filter: NodeFilter,
}

fn any_node(_node: &Node, _request: &dyn KelpRequest, _config: &ClusterConfig) -> bool {
    true
}

impl RoundRobinLocator {
    pub(crate) const fn new(service_type: ServiceType) -> Self {
        Self::with_filter(service_type, any_node)
    }

    pub(crate) const fn with_filter(service_type: ServiceType, filter: NodeFilter) -> Self {
        Self {
            service_type,
            cursor: AtomicUsize::new(0),
            filter,
        }
    }
}

impl Locator for RoundRobinLocator {
    fn dispatch(
        &self,
        request: Arc<dyn KelpRequest>,
        nodes: &[Arc<Node>],
        config: &ClusterConfig,
        core: &Core,
    ) {
        let candidates: Vec<&Arc<Node>> = nodes
            .iter()
            .filter(|n| {
                n.service_enabled(self.service_type)
                    && (self.filter)(n, request.as_ref(), config)
            })
            .collect();

        if candidates.is_empty() {
            retry::orchestrate(core, request, RetryReason::ServiceNotAvailable);
            return;
        }

        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        if let Err(reason) = candidates[index].send(request.clone()) {
            retry::orchestrate(core, request, reason);
        }
    }
}

/// Views run against the bucket's data nodes, so the node must host the
/// request's bucket in the current config.
pub(crate) fn view_filter(node: &Node, request: &dyn KelpRequest, config: &ClusterConfig) -> bool {
    match request.bucket().and_then(|b| config.bucket_config(b)) {
        Some(bucket_config) => bucket_config.has_node(node.identifier()),
        None => false,
    }
}

/// Analytics is restricted to the nodes the config advertises it on.
pub(crate) fn analytics_filter(
    node: &Node,
    _request: &dyn KelpRequest,
    config: &ClusterConfig,
) -> bool {
    let advertises = |ni: &NodeInfo| {
        ni.identifier() == node.identifier()
            && (ni.service_map(false).contains_key(&ServiceType::Analytics)
                || ni.service_map(true).contains_key(&ServiceType::Analytics))
    };

    config
        .bucket_configs()
        .values()
        .flat_map(|bc| bc.nodes().iter())
        .any(advertises)
        || config
            .global_config()
            .is_some_and(|gc| gc.port_infos().iter().any(advertises))
}

static KEY_VALUE_LOCATOR: KeyValueLocator = KeyValueLocator;
static QUERY_LOCATOR: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Query);
static SEARCH_LOCATOR: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Search);
static MANAGER_LOCATOR: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Manager);
static EVENTING_LOCATOR: RoundRobinLocator = RoundRobinLocator::new(ServiceType::Eventing);
static VIEWS_LOCATOR: RoundRobinLocator =
    RoundRobinLocator::with_filter(ServiceType::Views, view_filter);
static ANALYTICS_LOCATOR: RoundRobinLocator =
    RoundRobinLocator::with_filter(ServiceType::Analytics, analytics_filter);

/// The static dispatch table from service type to locator.
pub(crate) fn locator(service_type: ServiceType) -> &'static dyn Locator {
    match service_type {
        ServiceType::KeyValue => &KEY_VALUE_LOCATOR,
        ServiceType::Query => &QUERY_LOCATOR,
        ServiceType::Search => &SEARCH_LOCATOR,
        ServiceType::Manager => &MANAGER_LOCATOR,
        ServiceType::Eventing => &EVENTING_LOCATOR,
        ServiceType::Views => &VIEWS_LOCATOR,
        ServiceType::Analytics => &ANALYTICS_LOCATOR,
    }
}

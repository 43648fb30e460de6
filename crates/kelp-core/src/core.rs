//! The main entry point into the client core.
//!
//! The [`Core`] owns the live node set, dispatches requests through the
//! service locators, consumes the config provider's snapshot stream, and
//! converges the topology toward each snapshot. Reconfigurations are
//! serialized through a two-flag scheme: a second config arriving while
//! one pass runs is coalesced into exactly one rerun against the latest
//! snapshot.

use crate::context::{Authenticator, CoreContext, CoreEnvironment};
use crate::error::{CancellationReason, KelpError};
use crate::locator;
use crate::node::Node;
use crate::request::KelpRequest;
use crate::service::{EndpointDiagnostics, ServiceState};
use crate::timer::Timer;
use kelp_config::provider::{CancelCause, ConfigError, ConfigProvider};
use kelp_config::{ClusterConfig, NodeIdentifier, NodeInfo, ServiceScope, ServiceType};
use kelp_observe::{CoreEvent, GlobalConfigFailure, Severity, ValueRecorder};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Cadence of the node-drain check during shutdown.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Meter name all response recorders are registered under.
pub const METER_OPERATIONS: &str = "kelp.operations";

#[derive(Hash, PartialEq, Eq)]
struct ResponseMetricIdentifier {
    service_type: ServiceType,
    dispatched_to: Option<String>,
    request_name: &'static str,
}

struct CoreInner {
    ctx: CoreContext,
    provider: Arc<dyn ConfigProvider>,
    current_config: RwLock<Arc<ClusterConfig>>,
    nodes: RwLock<Vec<Arc<Node>>>,
    reconfigure_in_progress: AtomicBool,
    more_configs_pending: AtomicBool,
    shut_down: AtomicBool,
    timer: Timer,
    shutdown_done_tx: watch::Sender<bool>,
    response_metrics: Mutex<HashMap<ResponseMetricIdentifier, Arc<dyn ValueRecorder>>>,
}

/// The core. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Creates a core against the given provider and starts consuming
    /// its config stream.
    ///
    /// Fails when the security settings and the authenticator disagree
    /// about TLS.
    pub fn new(
        environment: Arc<CoreEnvironment>,
        authenticator: Arc<dyn Authenticator>,
        seed_nodes: Vec<String>,
        provider: Arc<dyn ConfigProvider>,
    ) -> Result<Self, KelpError> {
        if environment.security().tls_enabled && !authenticator.supports_tls() {
            return Err(KelpError::InvalidArgument(
                "TLS enabled but the authenticator does not support TLS".to_string(),
            ));
        }
        if !environment.security().tls_enabled && !authenticator.supports_non_tls() {
            return Err(KelpError::InvalidArgument(
                "TLS not enabled but the authenticator only supports TLS".to_string(),
            ));
        }

        let ctx = CoreContext::new(environment, authenticator);
        let (shutdown_done_tx, _) = watch::channel(false);
        let inner = Arc::new(CoreInner {
            ctx,
            current_config: RwLock::new(provider.config()),
            provider,
            nodes: RwLock::new(Vec::new()),
            reconfigure_in_progress: AtomicBool::new(false),
            more_configs_pending: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            timer: Timer::new(),
            shutdown_done_tx,
            response_metrics: Mutex::new(HashMap::new()),
        });

        let core = Self { inner };
        core.spawn_config_subscriber();
        core.publish(CoreEvent::CoreCreated {
            instance_id: core.inner.ctx.instance_id(),
            seed_nodes,
        });
        Ok(core)
    }

    /// Subscribes the reconciler to the provider's snapshot stream. The
    /// task holds the inner state weakly, so dropping the last core
    /// handle ends it.
    fn spawn_config_subscriber(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut configs = self.inner.provider.configs();
        tokio::spawn(async move {
            while configs.changed().await.is_ok() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let config = configs.borrow_and_update().clone();
                *inner.current_config.write() = config;
                Core { inner }.reconfigure();
            }
        });
    }

    pub fn context(&self) -> &CoreContext {
        &self.inner.ctx
    }

    /// The latest config snapshot as the provider sees it.
    pub fn cluster_config(&self) -> Arc<ClusterConfig> {
        self.inner.provider.config()
    }

    pub fn configuration_provider(&self) -> &Arc<dyn ConfigProvider> {
        &self.inner.provider
    }

    /// Dispatches a request and registers it with the timeout timer.
    ///
    /// Never returns an error: completion, cancellation and failure all
    /// arrive through the request's sink.
    pub fn send(&self, request: Arc<dyn KelpRequest>) {
        self.send_with(request, true);
    }

    /// Dispatch variant for retries, where the request already carries a
    /// registered timeout.
    pub fn send_with(&self, request: Arc<dyn KelpRequest>, register_for_timeout: bool) {
        if self.inner.shut_down.load(Ordering::Acquire) {
            request.cancel(CancellationReason::Shutdown);
            return;
        }

        if register_for_timeout {
            self.inner.timer.register(request.clone());
            for callback in self.inner.ctx.environment().before_send_callbacks() {
                callback.before_send(request.as_ref());
            }
        }

        let nodes = self.inner.nodes.read().clone();
        let config = self.inner.current_config.read().clone();
        locator::locator(request.service_type()).dispatch(request, &nodes, &config, self);
    }

    /// Kicks off opening a bucket. Outcome arrives via events; the
    /// topology follows through the config stream.
    pub fn open_bucket(&self, name: impl Into<String>) {
        let name = name.into();
        self.publish(CoreEvent::BucketOpenInitiated {
            bucket: name.clone(),
        });

        let core = self.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            match core.inner.provider.open_bucket(&name).await {
                Ok(()) => core.publish(CoreEvent::BucketOpened {
                    bucket: name,
                    elapsed: start.elapsed(),
                }),
                Err(error) => {
                    let severity = if matches!(error, ConfigError::AlreadyShutdown) {
                        Severity::Debug
                    } else {
                        Severity::Warn
                    };
                    core.publish(CoreEvent::BucketOpenFailed {
                        bucket: name,
                        elapsed: start.elapsed(),
                        error: error.to_string(),
                        severity,
                    });
                }
            }
        });
    }

    /// Loads the global config if the cluster supports it. Failures are
    /// classified and published, never raised: global configs are an
    /// optional feature and the caller moves on regardless.
    pub fn init_global_config(&self) {
        let core = self.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            if let Err(error) = core.inner.provider.load_and_refresh_global_config().await {
                let reason = classify_global_config_failure(&error);
                core.publish(CoreEvent::InitGlobalConfigFailed {
                    reason,
                    elapsed: start.elapsed(),
                    error: error.to_string(),
                });
            }
        });
    }

    /// Shuts down: closes every open bucket, shuts the provider, then
    /// waits for the node set to drain. Idempotent; concurrent callers
    /// all observe the same completion.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), KelpError> {
        tokio::time::timeout(timeout, self.shutdown_inner())
            .await
            .map_err(|_| KelpError::Generic("shutdown timed out".to_string()))
    }

    async fn shutdown_inner(&self) {
        let start = Instant::now();
        if self
            .inner
            .shut_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.publish(CoreEvent::ShutdownInitiated);

            let buckets: Vec<String> = {
                let config = self.inner.current_config.read();
                config.bucket_configs().keys().cloned().collect()
            };
            for bucket in buckets {
                self.close_bucket(&bucket).await;
            }

            if let Err(error) = self.inner.provider.shutdown().await {
                if !matches!(error, ConfigError::AlreadyShutdown) {
                    tracing::warn!(%error, "Config provider shutdown failed");
                }
            }

            // The provider's final empty snapshot drives the disconnect-all
            // reconfiguration; poll until it has drained the node set.
            while !self.inner.nodes.read().is_empty() {
                tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
            }

            self.publish(CoreEvent::ShutdownCompleted {
                elapsed: start.elapsed(),
            });
            self.inner.shutdown_done_tx.send_replace(true);
        } else {
            let mut done = self.inner.shutdown_done_tx.subscribe();
            let _ = done.wait_for(|completed| *completed).await;
        }
    }

    async fn close_bucket(&self, name: &str) {
        let start = Instant::now();
        match self.inner.provider.close_bucket(name).await {
            Ok(()) => self.publish(CoreEvent::BucketClosed {
                bucket: name.to_string(),
                elapsed: start.elapsed(),
            }),
            Err(error) => {
                tracing::debug!(bucket = name, %error, "Closing bucket failed");
            }
        }
    }

    /// Makes sure the given service is enabled on the given node,
    /// creating the node if it is not in the live set yet.
    pub async fn ensure_service_at(
        &self,
        identifier: &NodeIdentifier,
        service_type: ServiceType,
        port: u16,
        bucket: Option<&str>,
        alternate_host: Option<String>,
    ) -> Result<(), KelpError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Ok(());
        }

        let node = {
            let mut nodes = self.inner.nodes.write();
            match nodes.iter().find(|n| n.identifier() == identifier) {
                Some(node) => node.clone(),
                None => {
                    let environment = self.inner.ctx.environment();
                    let node = Node::new(
                        identifier.clone(),
                        alternate_host,
                        environment.endpoint_factory().clone(),
                        environment.endpoint_pool_size(),
                    );
                    nodes.push(node.clone());
                    node
                }
            }
        };

        node.add_service(service_type, port, bucket).await
    }

    async fn remove_service_from(
        &self,
        identifier: &NodeIdentifier,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Result<(), KelpError> {
        let node = {
            let nodes = self.inner.nodes.read();
            nodes.iter().find(|n| n.identifier() == identifier).cloned()
        };
        if let Some(node) = node {
            if node.service_enabled(service_type) {
                node.remove_service(service_type, bucket).await?;
            }
        }
        Ok(())
    }

    /// Drops a node that the config no longer references, or that has no
    /// services left.
    async fn maybe_remove_node(&self, node: &Arc<Node>, config: &ClusterConfig) {
        let still_present = config.has_node(node.identifier());
        if !still_present || !node.has_services_enabled() {
            node.disconnect().await;
            self.inner
                .nodes
                .write()
                .retain(|n| !Arc::ptr_eq(n, node));
        }
    }

    /// One reconfiguration attempt. If a pass is already running, marks
    /// a pending rerun; [`clear_reconfigure_in_progress`] picks it up, so
    /// any burst of configs results in exactly one further pass against
    /// the latest snapshot.
    ///
    /// [`clear_reconfigure_in_progress`]: Core::clear_reconfigure_in_progress
    fn reconfigure(&self) {
        if self
            .inner
            .reconfigure_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let config = self.inner.current_config.read().clone();
            let core = self.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let result = if config.is_empty() {
                    core.reconfigure_disconnect_all().await
                } else {
                    core.reconfigure_to(&config).await
                };
                match result {
                    Ok(()) => core.publish(CoreEvent::ReconfigurationCompleted {
                        elapsed: start.elapsed(),
                    }),
                    Err(error) => core.publish(CoreEvent::ReconfigurationErrorDetected {
                        error: error.to_string(),
                    }),
                }
                core.clear_reconfigure_in_progress();
            });
        } else {
            self.inner.more_configs_pending.store(true, Ordering::Release);
            self.publish(CoreEvent::ReconfigurationIgnored);
        }
    }

    fn clear_reconfigure_in_progress(&self) {
        self.inner
            .reconfigure_in_progress
            .store(false, Ordering::Release);
        if self
            .inner
            .more_configs_pending
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.reconfigure();
        }
    }

    /// Empty snapshot: tear the whole topology down.
    async fn reconfigure_disconnect_all(&self) -> Result<(), KelpError> {
        let nodes: Vec<Arc<Node>> = self.inner.nodes.read().clone();
        for node in &nodes {
            node.disconnect().await;
        }
        self.inner.nodes.write().clear();
        Ok(())
    }

    /// Converges nodes and services toward one snapshot.
    async fn reconfigure_to(&self, config: &ClusterConfig) -> Result<(), KelpError> {
        for (bucket_name, bucket_config) in config.bucket_configs() {
            for node_info in bucket_config.nodes() {
                self.reconfigure_node_services(node_info, Some(bucket_name))
                    .await;
            }
        }
        if let Some(global) = config.global_config() {
            for node_info in global.port_infos() {
                self.reconfigure_node_services(node_info, None).await;
            }
        }

        let snapshot: Vec<Arc<Node>> = self.inner.nodes.read().clone();
        for node in snapshot {
            self.maybe_remove_node(&node, config).await;
        }
        Ok(())
    }

    /// Aligns one node's services with its effective service map.
    /// Per-service failures are published and swallowed so one bad node
    /// cannot poison the pass.
    async fn reconfigure_node_services(&self, node_info: &NodeInfo, bucket: Option<&str>) {
        let environment = self.inner.ctx.environment();
        let tls = environment.security().tls_enabled;

        let alternate = environment
            .preferred_network()
            .and_then(|network| node_info.alternate_address(network));
        let (alternate_host, service_map) = match alternate {
            Some(alt) if !alt.service_map(tls).is_empty() => {
                (Some(alt.hostname.clone()), alt.service_map(tls))
            }
            _ => (None, node_info.service_map(tls)),
        };

        for service in ServiceType::ALL {
            if service_map.contains_key(&service) {
                continue;
            }
            let scoped = scoped_bucket(service, bucket);
            if let Err(error) = self
                .remove_service_from(node_info.identifier(), service, scoped)
                .await
            {
                self.publish(CoreEvent::ServiceReconfigurationFailed {
                    host: node_info.hostname().to_string(),
                    service: service.ident(),
                    error: error.to_string(),
                });
            }
        }

        for (&service, &port) in service_map {
            let scoped = scoped_bucket(service, bucket);
            if let Err(error) = self
                .ensure_service_at(
                    node_info.identifier(),
                    service,
                    port,
                    scoped,
                    alternate_host.clone(),
                )
                .await
            {
                self.publish(CoreEvent::ServiceReconfigurationFailed {
                    host: node_info.hostname().to_string(),
                    service: service.ident(),
                    error: error.to_string(),
                });
            }
        }
    }

    /// The value recorder for a request's (service, target, operation)
    /// identity, created on first use.
    pub fn response_metric(&self, request: &dyn KelpRequest) -> Arc<dyn ValueRecorder> {
        let key = ResponseMetricIdentifier {
            service_type: request.service_type(),
            dispatched_to: request.last_dispatched_to().map(|target| target.to_string()),
            request_name: request.name(),
        };

        let mut metrics = self.inner.response_metrics.lock();
        metrics
            .entry(key)
            .or_insert_with(|| {
                self.inner.ctx.environment().meter().value_recorder(
                    METER_OPERATIONS,
                    &[
                        ("service", request.service_type().ident().to_string()),
                        ("operation", request.name().to_string()),
                    ],
                )
            })
            .clone()
    }

    /// Per-endpoint diagnostics across all live nodes.
    pub fn diagnostics(&self) -> Vec<EndpointDiagnostics> {
        self.inner
            .nodes
            .read()
            .iter()
            .flat_map(|n| n.diagnostics())
            .collect()
    }

    /// The observable state of one service on one node, if present.
    pub fn service_state(
        &self,
        identifier: &NodeIdentifier,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Option<watch::Receiver<ServiceState>> {
        self.inner
            .nodes
            .read()
            .iter()
            .find(|n| n.identifier() == identifier)
            .and_then(|n| n.service_state(service_type, bucket))
    }

    /// Identifiers of the live node set, for assertions and diagnostics.
    pub fn live_nodes(&self) -> Vec<NodeIdentifier> {
        self.inner
            .nodes
            .read()
            .iter()
            .map(|n| n.identifier().clone())
            .collect()
    }

    fn publish(&self, event: CoreEvent) {
        self.inner.ctx.environment().event_bus().publish(event);
    }
}

fn scoped_bucket(service: ServiceType, bucket: Option<&str>) -> Option<&str> {
    match service.scope() {
        ServiceScope::Bucket => bucket,
        ServiceScope::Cluster => None,
    }
}

fn classify_global_config_failure(error: &ConfigError) -> GlobalConfigFailure {
    match error {
        ConfigError::UnsupportedMechanism => GlobalConfigFailure::Unsupported,
        ConfigError::GlobalConfigNotFound => GlobalConfigFailure::NoConfigFound,
        ConfigError::NoAccess(_) => GlobalConfigFailure::NoAccess,
        ConfigError::AlreadyShutdown => GlobalConfigFailure::Shutdown,
        ConfigError::Canceled {
            cause: CancelCause::Shutdown,
        } => GlobalConfigFailure::Shutdown,
        _ => GlobalConfigFailure::Unknown,
    }
}

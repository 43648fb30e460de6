//! The configuration provider boundary.
//!
//! A provider produces a hot, latest-wins stream of [`ClusterConfig`]
//! snapshots and owns the bucket open/close lifecycle against the
//! cluster manager. The core only ever talks to the [`ConfigProvider`]
//! trait; production providers speak the manager's HTTP/streaming
//! protocols, while [`StaticConfigProvider`] serves a fixed topology and
//! is what the test suites drive.

use crate::bucket::BucketConfig;
use crate::cluster::{ClusterConfig, GlobalConfig};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why an in-flight config operation was canceled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelCause {
    Shutdown,
    Timeout,
    Other,
}

impl fmt::Display for CancelCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelCause::Shutdown => f.write_str("shutdown"),
            CancelCause::Timeout => f.write_str("timeout"),
            CancelCause::Other => f.write_str("other"),
        }
    }
}

/// Errors surfaced across the provider boundary.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The cluster does not speak any supported config mechanism.
    #[error("unsupported config mechanism")]
    UnsupportedMechanism,

    /// The cluster has no global config to hand out.
    #[error("global config not found")]
    GlobalConfigNotFound,

    /// Credentials were rejected while fetching a config.
    #[error("no access to config: {0}")]
    NoAccess(String),

    /// The provider has already been shut down.
    #[error("configuration provider already shut down")]
    AlreadyShutdown,

    /// The requested bucket does not exist on the cluster.
    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    /// A config document failed to parse.
    #[error("failed to decode config: {0}")]
    Decode(#[from] serde_json::Error),

    /// The underlying config request was canceled before it completed.
    #[error("config request canceled ({cause})")]
    Canceled { cause: CancelCause },

    #[error("{0}")]
    Other(String),
}

/// Produces cluster configs and manages bucket lifecycles.
#[async_trait]
pub trait ConfigProvider: Send + Sync + 'static {
    /// The config stream. Hot and latest-wins: a receiver that falls
    /// behind observes only the newest snapshot, never a backlog.
    fn configs(&self) -> watch::Receiver<Arc<ClusterConfig>>;

    /// The latest snapshot, synchronously.
    fn config(&self) -> Arc<ClusterConfig>;

    /// Opens a bucket; the resulting topology arrives via [`configs`].
    ///
    /// [`configs`]: ConfigProvider::configs
    async fn open_bucket(&self, name: &str) -> Result<(), ConfigError>;

    /// Closes a bucket and drops it from subsequent snapshots.
    async fn close_bucket(&self, name: &str) -> Result<(), ConfigError>;

    /// Loads the global config and keeps it refreshed.
    async fn load_and_refresh_global_config(&self) -> Result<(), ConfigError>;

    /// Shuts the provider down. Emits one final empty snapshot so the
    /// reconciler tears the topology down, then goes quiet.
    async fn shutdown(&self) -> Result<(), ConfigError>;
}

#[derive(Default)]
struct ProviderState {
    open_buckets: HashSet<String>,
    global_loaded: bool,
    shut_down: bool,
}

/// A provider serving a fixed topology.
///
/// Buckets and the global config are handed over at construction; opening
/// a bucket publishes its config into the stream, closing removes it.
/// Tests additionally push arbitrary snapshots through [`push`].
///
/// [`push`]: StaticConfigProvider::push
pub struct StaticConfigProvider {
    known_buckets: HashMap<String, BucketConfig>,
    global: Option<GlobalConfig>,
    state: Mutex<ProviderState>,
    tx: watch::Sender<Arc<ClusterConfig>>,
}

impl StaticConfigProvider {
    pub fn new(buckets: Vec<BucketConfig>, global: Option<GlobalConfig>) -> Self {
        let (tx, _) = watch::channel(Arc::new(ClusterConfig::default()));
        Self {
            known_buckets: buckets
                .into_iter()
                .map(|b| (b.name().to_string(), b))
                .collect(),
            global,
            state: Mutex::new(ProviderState::default()),
            tx,
        }
    }

    /// Publishes an arbitrary snapshot, bypassing the bucket lifecycle.
    pub fn push(&self, config: ClusterConfig) {
        self.tx.send_replace(Arc::new(config));
    }

    /// Rebuild and publish the snapshot for the current open set. Callers
    /// must not hold the state lock.
    fn publish_current(&self) {
        let config = {
            let state = self.state.lock();
            let buckets: HashMap<String, BucketConfig> = state
                .open_buckets
                .iter()
                .filter_map(|name| self.known_buckets.get(name).cloned())
                .map(|b| (b.name().to_string(), b))
                .collect();
            let global = if state.global_loaded {
                self.global.clone()
            } else {
                None
            };
            ClusterConfig::new(buckets, global)
        };
        self.tx.send_replace(Arc::new(config));
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    fn configs(&self) -> watch::Receiver<Arc<ClusterConfig>> {
        self.tx.subscribe()
    }

    fn config(&self) -> Arc<ClusterConfig> {
        self.tx.borrow().clone()
    }

    async fn open_bucket(&self, name: &str) -> Result<(), ConfigError> {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(ConfigError::AlreadyShutdown);
            }
            if !self.known_buckets.contains_key(name) {
                return Err(ConfigError::BucketNotFound(name.to_string()));
            }
            state.open_buckets.insert(name.to_string());
        }
        self.publish_current();
        Ok(())
    }

    async fn close_bucket(&self, name: &str) -> Result<(), ConfigError> {
        {
            let mut state = self.state.lock();
            if !state.open_buckets.remove(name) {
                return Ok(());
            }
        }
        self.publish_current();
        Ok(())
    }

    async fn load_and_refresh_global_config(&self) -> Result<(), ConfigError> {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(ConfigError::Canceled {
                    cause: CancelCause::Shutdown,
                });
            }
            if self.global.is_none() {
                return Err(ConfigError::GlobalConfigNotFound);
            }
            state.global_loaded = true;
        }
        self.publish_current();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ConfigError> {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return Err(ConfigError::AlreadyShutdown);
            }
            state.shut_down = true;
            state.open_buckets.clear();
            state.global_loaded = false;
        }
        // Final empty snapshot drives the disconnect-all reconciliation.
        self.tx.send_replace(Arc::new(ClusterConfig::default()));
        Ok(())
    }
}

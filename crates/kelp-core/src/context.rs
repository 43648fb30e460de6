//! The core context: instance identity, environment and authenticator.

use crate::request::KelpRequest;
use crate::service::EndpointFactory;
use kelp_observe::{EventBus, Meter, NoopMeter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Process-wide random half of every instance id, so instances from the
/// same process correlate in logs.
static GLOBAL_ID: OnceLock<u32> = OnceLock::new();

/// Counts up instance ids for each new core.
static CORE_IDS: AtomicU32 = AtomicU32::new(0);

/// A reasonably unique instance id: random upper half shared by the
/// process, incrementing lower half per instance.
pub fn next_instance_id() -> u64 {
    let global = *GLOBAL_ID.get_or_init(rand::random::<u32>);
    let local = CORE_IDS.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
    (u64::from(global) << 32) | u64::from(local)
}

/// Supplies credentials to the connection layer. Only the capability
/// flags matter to the core; the mechanics live with the transports.
pub trait Authenticator: Send + Sync + 'static {
    fn supports_tls(&self) -> bool {
        true
    }

    fn supports_non_tls(&self) -> bool {
        true
    }
}

/// Username/password credentials, usable with and without TLS.
pub struct PasswordAuthenticator {
    username: String,
    password: String,
}

impl PasswordAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl Authenticator for PasswordAuthenticator {}

/// Transport security settings.
#[derive(Clone, Copy, Debug, Default)]
pub struct SecurityConfig {
    pub tls_enabled: bool,
}

/// Hook invoked for every request right before it is handed to a locator.
pub trait BeforeSendCallback: Send + Sync + 'static {
    fn before_send(&self, request: &dyn KelpRequest);
}

/// Everything a core shares with its nodes and services: sinks for
/// events and metrics, security settings, the endpoint seam and tuning.
pub struct CoreEnvironment {
    event_bus: Arc<dyn EventBus>,
    meter: Arc<dyn Meter>,
    security: SecurityConfig,
    /// Alternate-address network to prefer, e.g. `external`.
    preferred_network: Option<String>,
    endpoint_factory: Arc<dyn EndpointFactory>,
    endpoint_pool_size: usize,
    disconnect_timeout: Duration,
    before_send: Vec<Arc<dyn BeforeSendCallback>>,
}

impl CoreEnvironment {
    pub fn new(event_bus: Arc<dyn EventBus>, endpoint_factory: Arc<dyn EndpointFactory>) -> Self {
        Self {
            event_bus,
            meter: Arc::new(NoopMeter),
            security: SecurityConfig::default(),
            preferred_network: None,
            endpoint_factory,
            endpoint_pool_size: 1,
            disconnect_timeout: Duration::from_secs(10),
            before_send: Vec::new(),
        }
    }

    pub fn with_meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = meter;
        self
    }

    pub fn with_security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    pub fn with_preferred_network(mut self, network: impl Into<String>) -> Self {
        self.preferred_network = Some(network.into());
        self
    }

    pub fn with_endpoint_pool_size(mut self, size: usize) -> Self {
        self.endpoint_pool_size = size.max(1);
        self
    }

    pub fn with_disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn with_before_send(mut self, callback: Arc<dyn BeforeSendCallback>) -> Self {
        self.before_send.push(callback);
        self
    }

    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.event_bus
    }

    pub fn meter(&self) -> &Arc<dyn Meter> {
        &self.meter
    }

    pub fn security(&self) -> SecurityConfig {
        self.security
    }

    pub fn preferred_network(&self) -> Option<&str> {
        self.preferred_network.as_deref()
    }

    pub fn endpoint_factory(&self) -> &Arc<dyn EndpointFactory> {
        &self.endpoint_factory
    }

    pub fn endpoint_pool_size(&self) -> usize {
        self.endpoint_pool_size
    }

    pub fn disconnect_timeout(&self) -> Duration {
        self.disconnect_timeout
    }

    pub fn before_send_callbacks(&self) -> &[Arc<dyn BeforeSendCallback>] {
        &self.before_send
    }
}

/// Immutable handle shared across the core and everything it owns.
#[derive(Clone)]
pub struct CoreContext {
    instance_id: u64,
    environment: Arc<CoreEnvironment>,
    authenticator: Arc<dyn Authenticator>,
}

impl CoreContext {
    pub fn new(environment: Arc<CoreEnvironment>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            instance_id: next_instance_id(),
            environment,
            authenticator,
        }
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn environment(&self) -> &Arc<CoreEnvironment> {
        &self.environment
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_share_upper_half() {
        let a = next_instance_id();
        let b = next_instance_id();
        assert_eq!(a >> 32, b >> 32, "upper halves correlate per process");
        assert_ne!(a as u32, b as u32, "lower halves distinguish instances");
    }

    #[test]
    fn test_password_authenticator_supports_both_modes() {
        let auth = PasswordAuthenticator::new("user", "pass");
        assert!(auth.supports_tls());
        assert!(auth.supports_non_tls());
        assert_eq!(auth.username(), "user");
    }
}

//! Services and endpoints.
//!
//! A [`Service`] is the connection pool to one (node, service type,
//! bucket?) triple. It owns a fixed set of endpoints, exposes an
//! observable state, and pushes requests onto a connected endpoint
//! round-robin. Concrete socket pipelines implement [`Endpoint`]; the
//! in-memory [`QueueEndpoint`] serves tests and doubles as the reference
//! implementation of the contract.

use crate::request::{HostAndPort, KelpRequest};
use crate::retry::RetryReason;
use async_trait::async_trait;
use kelp_config::ServiceType;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Observable lifecycle of a service (and of a single endpoint).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Connected,
    /// Some, but not all, endpoints are usable.
    Degraded,
    Disconnecting,
}

/// Point-in-time view of one endpoint, for diagnostics output.
#[derive(Clone, Debug)]
pub struct EndpointDiagnostics {
    pub service_type: ServiceType,
    pub state: ServiceState,
    pub remote: HostAndPort,
    pub bucket: Option<String>,
}

/// One pipeline to one remote service port.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// Establishes the pipeline. Idempotent.
    async fn connect(&self) -> Result<(), crate::error::KelpError>;

    /// Hands a request to the pipeline. An `Err` means the pipeline
    /// cannot take it and the caller should route it elsewhere.
    fn send(&self, request: Arc<dyn KelpRequest>) -> Result<(), Arc<dyn KelpRequest>>;

    fn state(&self) -> ServiceState;

    fn diagnostics(&self) -> EndpointDiagnostics;

    /// Tears the pipeline down. Implementations cancel whatever is still
    /// in flight on the connection with reason *stopped listening*.
    async fn disconnect(&self);
}

/// Creates endpoints for services as topology demands them.
pub trait EndpointFactory: Send + Sync + 'static {
    fn create(
        &self,
        service_type: ServiceType,
        host: &str,
        port: u16,
        bucket: Option<&str>,
    ) -> Arc<dyn Endpoint>;
}

/// The connection pool to one (node, service type, bucket?) triple.
pub struct Service {
    service_type: ServiceType,
    host: String,
    port: u16,
    bucket: Option<String>,
    endpoints: Vec<Arc<dyn Endpoint>>,
    cursor: AtomicUsize,
    state_tx: watch::Sender<ServiceState>,
}

impl Service {
    pub fn new(
        service_type: ServiceType,
        host: impl Into<String>,
        port: u16,
        bucket: Option<String>,
        factory: &dyn EndpointFactory,
        pool_size: usize,
    ) -> Self {
        let host = host.into();
        let endpoints = (0..pool_size.max(1))
            .map(|_| factory.create(service_type, &host, port, bucket.as_deref()))
            .collect();
        let (state_tx, _) = watch::channel(ServiceState::Disconnected);
        Self {
            service_type,
            host,
            port,
            bucket,
            endpoints,
            cursor: AtomicUsize::new(0),
            state_tx,
        }
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    pub fn remote(&self) -> HostAndPort {
        HostAndPort::new(self.host.clone(), self.port)
    }

    /// Connects all endpoints in the pool.
    pub async fn connect(&self) {
        self.state_tx.send_replace(ServiceState::Connecting);

        let mut connected = 0usize;
        for endpoint in &self.endpoints {
            match endpoint.connect().await {
                Ok(()) => connected += 1,
                Err(error) => {
                    tracing::warn!(
                        service = %self.service_type,
                        remote = %self.remote(),
                        %error,
                        "Endpoint failed to connect"
                    );
                }
            }
        }

        let state = if connected == self.endpoints.len() {
            ServiceState::Connected
        } else if connected > 0 {
            ServiceState::Degraded
        } else {
            ServiceState::Disconnected
        };
        self.state_tx.send_replace(state);
    }

    pub async fn disconnect(&self) {
        self.state_tx.send_replace(ServiceState::Disconnecting);
        for endpoint in &self.endpoints {
            endpoint.disconnect().await;
        }
        self.state_tx.send_replace(ServiceState::Disconnected);
    }

    /// Pushes a request onto a usable endpoint, round-robin.
    pub fn send(&self, request: Arc<dyn KelpRequest>) -> Result<(), RetryReason> {
        let n = self.endpoints.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        let mut request = request;
        for i in 0..n {
            let endpoint = &self.endpoints[(start + i) % n];
            if endpoint.state() != ServiceState::Connected {
                continue;
            }
            request.set_last_dispatched_to(self.remote());
            request.mark_dispatched();
            match endpoint.send(request) {
                Ok(()) => return Ok(()),
                Err(rejected) => request = rejected,
            }
        }
        Err(RetryReason::EndpointNotAvailable)
    }

    pub fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    /// Watchable state stream; the receiver always sees the latest state.
    pub fn states(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = EndpointDiagnostics> + '_ {
        self.endpoints.iter().map(|e| e.diagnostics())
    }
}

/// What the in-memory endpoint hands to its consumer for every request.
pub struct DispatchRecord {
    pub target: HostAndPort,
    pub service_type: ServiceType,
    pub bucket: Option<String>,
    pub request: Arc<dyn KelpRequest>,
}

/// In-memory endpoint for testing (local channels, no sockets).
///
/// Every request sent through it surfaces as a [`DispatchRecord`] on the
/// factory's shared channel, where a test (or a simulated server) can
/// complete it.
pub struct QueueEndpoint {
    service_type: ServiceType,
    remote: HostAndPort,
    bucket: Option<String>,
    tx: mpsc::UnboundedSender<DispatchRecord>,
    state_tx: watch::Sender<ServiceState>,
    connect_delay: std::time::Duration,
}

#[async_trait]
impl Endpoint for QueueEndpoint {
    async fn connect(&self) -> Result<(), crate::error::KelpError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        self.state_tx.send_replace(ServiceState::Connected);
        Ok(())
    }

    fn send(&self, request: Arc<dyn KelpRequest>) -> Result<(), Arc<dyn KelpRequest>> {
        let record = DispatchRecord {
            target: self.remote.clone(),
            service_type: self.service_type,
            bucket: self.bucket.clone(),
            request,
        };
        self.tx.send(record).map_err(|rejected| rejected.0.request)
    }

    fn state(&self) -> ServiceState {
        *self.state_tx.borrow()
    }

    fn diagnostics(&self) -> EndpointDiagnostics {
        EndpointDiagnostics {
            service_type: self.service_type,
            state: self.state(),
            remote: self.remote.clone(),
            bucket: self.bucket.clone(),
        }
    }

    async fn disconnect(&self) {
        self.state_tx.send_replace(ServiceState::Disconnected);
    }
}

/// Factory producing [`QueueEndpoint`]s that all feed one channel.
pub struct QueueEndpointFactory {
    tx: mpsc::UnboundedSender<DispatchRecord>,
    connect_delay: std::time::Duration,
}

impl QueueEndpointFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchRecord>) {
        Self::with_connect_delay(std::time::Duration::ZERO)
    }

    /// A factory whose endpoints take `delay` to connect. Useful to hold
    /// a reconfiguration open while another config arrives.
    pub fn with_connect_delay(
        delay: std::time::Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                connect_delay: delay,
            }),
            rx,
        )
    }
}

impl EndpointFactory for QueueEndpointFactory {
    fn create(
        &self,
        service_type: ServiceType,
        host: &str,
        port: u16,
        bucket: Option<&str>,
    ) -> Arc<dyn Endpoint> {
        let (state_tx, _) = watch::channel(ServiceState::Disconnected);
        Arc::new(QueueEndpoint {
            service_type,
            remote: HostAndPort::new(host, port),
            bucket: bucket.map(str::to_string),
            tx: self.tx.clone(),
            state_tx,
            connect_delay: self.connect_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::test_support::ProbeRequest;
    use std::time::Duration;

    fn service(factory: &dyn EndpointFactory, pool: usize) -> Service {
        Service::new(
            ServiceType::Query,
            "10.0.0.1",
            8093,
            None,
            factory,
            pool,
        )
    }

    #[tokio::test]
    async fn test_connect_transitions_state() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let svc = service(factory.as_ref(), 2);
        assert_eq!(svc.state(), ServiceState::Disconnected);

        svc.connect().await;
        assert_eq!(svc.state(), ServiceState::Connected);

        svc.disconnect().await;
        assert_eq!(svc.state(), ServiceState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_stamps_target_and_delivers() {
        let (factory, mut rx) = QueueEndpointFactory::new();
        let svc = service(factory.as_ref(), 1);
        svc.connect().await;

        let (request, _res) = ProbeRequest::new(Duration::from_secs(1), ServiceType::Query);
        svc.send(request.clone()).unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.target, HostAndPort::new("10.0.0.1", 8093));
        assert_eq!(
            request.last_dispatched_to(),
            Some(HostAndPort::new("10.0.0.1", 8093))
        );
        assert_eq!(request.state(), crate::request::RequestState::Dispatched);
    }

    #[tokio::test]
    async fn test_send_without_connected_endpoint_is_rejected() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let svc = service(factory.as_ref(), 1);

        let (request, _res) = ProbeRequest::new(Duration::from_secs(1), ServiceType::Query);
        assert_eq!(
            svc.send(request).unwrap_err(),
            RetryReason::EndpointNotAvailable
        );
    }

    #[tokio::test]
    async fn test_state_watch_observes_transitions() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let svc = service(factory.as_ref(), 1);
        let mut states = svc.states();

        svc.connect().await;
        states.changed().await.unwrap();
        // Intermediate Connecting may be superseded; latest is Connected.
        assert_eq!(*states.borrow_and_update(), ServiceState::Connected);
    }
}

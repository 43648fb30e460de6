//! A live cluster node and its enabled services.
//!
//! Each node owns the [`Service`] instances the reconciler enabled on it,
//! keyed by (service type, bucket for bucket-scoped services). The core
//! exclusively owns nodes; nodes exclusively own services.

use crate::request::KelpRequest;
use crate::retry::RetryReason;
use crate::service::{EndpointDiagnostics, EndpointFactory, Service, ServiceState};
use kelp_config::{NodeIdentifier, ServiceScope, ServiceType};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type ServiceKey = (ServiceType, Option<String>);

fn service_key(service_type: ServiceType, bucket: Option<&str>) -> ServiceKey {
    let bucket = match service_type.scope() {
        ServiceScope::Bucket => bucket.map(str::to_string),
        ServiceScope::Cluster => None,
    };
    (service_type, bucket)
}

pub struct Node {
    identifier: NodeIdentifier,
    /// Network-visible hostname when alternate addressing is active.
    alternate_host: Option<String>,
    services: RwLock<HashMap<ServiceKey, Arc<Service>>>,
    disconnected: AtomicBool,
    factory: Arc<dyn EndpointFactory>,
    pool_size: usize,
}

impl Node {
    pub fn new(
        identifier: NodeIdentifier,
        alternate_host: Option<String>,
        factory: Arc<dyn EndpointFactory>,
        pool_size: usize,
    ) -> Arc<Self> {
        tracing::debug!(node = %identifier, "Node created");
        Arc::new(Self {
            identifier,
            alternate_host,
            services: RwLock::new(HashMap::new()),
            disconnected: AtomicBool::new(false),
            factory,
            pool_size,
        })
    }

    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    /// The hostname services on this node connect to.
    fn effective_host(&self) -> &str {
        self.alternate_host
            .as_deref()
            .unwrap_or_else(|| self.identifier.address())
    }

    /// Enables a service, connecting its endpoint pool. Idempotent: an
    /// already enabled (service, bucket) pair is left untouched.
    pub async fn add_service(
        &self,
        service_type: ServiceType,
        port: u16,
        bucket: Option<&str>,
    ) -> Result<(), crate::error::KelpError> {
        if self.disconnected.load(Ordering::Acquire) {
            tracing::debug!(node = %self.identifier, service = %service_type, "Ignoring add_service on disconnected node");
            return Ok(());
        }

        let key = service_key(service_type, bucket);
        let service = {
            let mut services = self.services.write();
            if services.contains_key(&key) {
                tracing::debug!(node = %self.identifier, service = %service_type, "Service already enabled");
                return Ok(());
            }
            let service = Arc::new(Service::new(
                service_type,
                self.effective_host(),
                port,
                key.1.clone(),
                self.factory.as_ref(),
                self.pool_size,
            ));
            services.insert(key, service.clone());
            service
        };

        tracing::debug!(node = %self.identifier, service = %service_type, port, "Enabling service");
        service.connect().await;
        Ok(())
    }

    /// Disables a service and disconnects its endpoints.
    pub async fn remove_service(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Result<(), crate::error::KelpError> {
        let key = service_key(service_type, bucket);
        let removed = self.services.write().remove(&key);

        match removed {
            Some(service) => {
                tracing::debug!(node = %self.identifier, service = %service_type, "Disabling service");
                service.disconnect().await;
            }
            None => {
                tracing::debug!(node = %self.identifier, service = %service_type, "Service not present, ignoring removal");
            }
        }
        Ok(())
    }

    /// Whether any service of the given type is enabled, bucket-scoped or not.
    pub fn service_enabled(&self, service_type: ServiceType) -> bool {
        self.services
            .read()
            .keys()
            .any(|(st, _)| *st == service_type)
    }

    pub fn has_services_enabled(&self) -> bool {
        !self.services.read().is_empty()
    }

    /// Routes a request onto the matching service.
    pub fn send(&self, request: Arc<dyn KelpRequest>) -> Result<(), RetryReason> {
        let key = service_key(request.service_type(), request.bucket());
        let service = self.services.read().get(&key).cloned();
        match service {
            Some(service) => service.send(request),
            None => Err(RetryReason::ServiceNotAvailable),
        }
    }

    /// Disconnects every service and refuses further additions.
    pub async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::Release);
        let services: Vec<Arc<Service>> = self.services.write().drain().map(|(_, s)| s).collect();
        if !services.is_empty() {
            tracing::debug!(node = %self.identifier, count = services.len(), "Disconnecting node");
        }
        for service in services {
            service.disconnect().await;
        }
    }

    pub fn diagnostics(&self) -> Vec<EndpointDiagnostics> {
        self.services
            .read()
            .values()
            .flat_map(|s| s.diagnostics().collect::<Vec<_>>())
            .collect()
    }

    /// The observable state of one service, if enabled.
    pub fn service_state(
        &self,
        service_type: ServiceType,
        bucket: Option<&str>,
    ) -> Option<watch::Receiver<ServiceState>> {
        let key = service_key(service_type, bucket);
        self.services.read().get(&key).map(|s| s.states())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::QueueEndpointFactory;

    fn test_node(factory: Arc<dyn EndpointFactory>) -> Arc<Node> {
        Node::new(
            NodeIdentifier::new("10.0.0.1", 8091),
            None,
            factory,
            1,
        )
    }

    #[tokio::test]
    async fn test_add_and_remove_service() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let node = test_node(factory);

        assert!(!node.has_services_enabled());

        node.add_service(ServiceType::KeyValue, 11210, Some("travel"))
            .await
            .unwrap();
        assert!(node.service_enabled(ServiceType::KeyValue));
        assert!(node.has_services_enabled());

        node.remove_service(ServiceType::KeyValue, Some("travel"))
            .await
            .unwrap();
        assert!(!node.service_enabled(ServiceType::KeyValue));
        assert!(!node.has_services_enabled());
    }

    #[tokio::test]
    async fn test_add_service_is_idempotent() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let node = test_node(factory);

        node.add_service(ServiceType::Query, 8093, None).await.unwrap();
        node.add_service(ServiceType::Query, 8093, None).await.unwrap();

        assert_eq!(node.diagnostics().len(), 1);
    }

    #[tokio::test]
    async fn test_bucket_scoped_services_keyed_separately() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let node = test_node(factory);

        node.add_service(ServiceType::KeyValue, 11210, Some("travel"))
            .await
            .unwrap();
        node.add_service(ServiceType::KeyValue, 11210, Some("beer"))
            .await
            .unwrap();

        assert_eq!(node.diagnostics().len(), 2);

        node.remove_service(ServiceType::KeyValue, Some("travel"))
            .await
            .unwrap();
        assert!(node.service_enabled(ServiceType::KeyValue), "beer remains");
    }

    #[tokio::test]
    async fn test_disconnected_node_refuses_new_services() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let node = test_node(factory);

        node.disconnect().await;
        node.add_service(ServiceType::Query, 8093, None).await.unwrap();
        assert!(!node.has_services_enabled());
    }

    #[tokio::test]
    async fn test_service_state_stream() {
        let (factory, _rx) = QueueEndpointFactory::new();
        let node = test_node(factory);

        assert!(node.service_state(ServiceType::Query, None).is_none());

        node.add_service(ServiceType::Query, 8093, None).await.unwrap();
        let states = node.service_state(ServiceType::Query, None).unwrap();
        assert_eq!(*states.borrow(), ServiceState::Connected);
    }
}

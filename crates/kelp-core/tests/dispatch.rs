//! End-to-end dispatch tests: a core against a static provider and
//! in-memory endpoints, covering KV partition routing, round-robin over
//! HTTP nodes, timeout/shutdown cancellation and event emission.

use bytes::Bytes;
use kelp_config::bucket::{BucketConfig, NodeInfo, PartitionMap};
use kelp_config::provider::{ConfigProvider, StaticConfigProvider};
use kelp_config::{NodeIdentifier, ServiceType};
use kelp_core::*;
use kelp_observe::{BroadcastEventBus, CoreEvent, GlobalConfigFailure, Severity};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const NUM_PARTITIONS: usize = 64;

fn node_info(host: &str) -> NodeInfo {
    let mut ports = HashMap::new();
    ports.insert(ServiceType::KeyValue, 11210);
    ports.insert(ServiceType::Query, 8093);
    ports.insert(ServiceType::Manager, 8091);
    NodeInfo::new(NodeIdentifier::new(host, 8091), host, ports, HashMap::new())
}

fn bucket(name: &str, hosts: &[&str]) -> BucketConfig {
    let nodes: Vec<NodeInfo> = hosts.iter().map(|h| node_info(h)).collect();
    let map = (0..NUM_PARTITIONS)
        .map(|p| vec![(p % hosts.len()) as i16])
        .collect();
    BucketConfig::new(name, nodes, PartitionMap::new(map))
}

struct Fixture {
    core: Core,
    provider: Arc<StaticConfigProvider>,
    bus: Arc<BroadcastEventBus>,
    dispatched: mpsc::UnboundedReceiver<DispatchRecord>,
}

fn fixture(buckets: Vec<BucketConfig>) -> Fixture {
    let (factory, dispatched) = QueueEndpointFactory::new();
    let bus = Arc::new(BroadcastEventBus::new(256));
    let provider = Arc::new(StaticConfigProvider::new(buckets, None));
    let environment = Arc::new(CoreEnvironment::new(bus.clone(), factory));
    let core = Core::new(
        environment,
        Arc::new(PasswordAuthenticator::new("tester", "secret")),
        vec!["127.0.0.1".to_string()],
        provider.clone(),
    )
    .unwrap();
    Fixture {
        core,
        provider,
        bus,
        dispatched,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within timeout");
}

async fn wait_for_connected(core: &Core, host: &str, service: ServiceType, bucket: Option<&str>) {
    let id = NodeIdentifier::new(host, 8091);
    wait_until(|| {
        core.service_state(&id, service, bucket)
            .is_some_and(|rx| *rx.borrow() == ServiceState::Connected)
    })
    .await;
}

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<CoreEvent>,
    mut matches: impl FnMut(&CoreEvent) -> bool,
) -> CoreEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not observed within timeout")
}

fn best_effort() -> Arc<dyn RetryStrategy> {
    Arc::new(BestEffortRetryStrategy::default())
}

#[tokio::test]
async fn test_kv_request_reaches_partition_owner() {
    let mut fx = fixture(vec![bucket("travel", &["10.0.0.1"])]);
    fx.core.open_bucket("travel");
    wait_for_connected(&fx.core, "10.0.0.1", ServiceType::KeyValue, Some("travel")).await;

    let (request, rx) = GetRequest::new(
        Duration::from_secs(2),
        best_effort(),
        "user:42",
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    );
    fx.core.send(request.clone());

    let record = fx.dispatched.recv().await.unwrap();
    assert_eq!(record.service_type, ServiceType::KeyValue);
    assert_eq!(record.bucket.as_deref(), Some("travel"));
    assert_eq!(record.target, HostAndPort::new("10.0.0.1", 11210));

    let expected = kelp_placement::partition_for_key(b"user:42", NUM_PARTITIONS as u16);
    assert_eq!(request.partition(), expected, "locator stamps the partition");

    let get = record
        .request
        .as_any()
        .downcast_ref::<GetRequest>()
        .unwrap();
    get.succeed(GetResponse {
        content: Bytes::from_static(b"{\"name\":\"arthur\"}"),
        flags: 0,
        cas: 42,
    });

    let response = rx.await.unwrap().unwrap();
    assert_eq!(response.cas, 42);
}

#[tokio::test]
async fn test_round_robin_alternates_between_nodes() {
    let mut fx = fixture(vec![bucket("travel", &["10.0.0.1", "10.0.0.2"])]);
    fx.core.open_bucket("travel");
    wait_for_connected(&fx.core, "10.0.0.1", ServiceType::Query, None).await;
    wait_for_connected(&fx.core, "10.0.0.2", ServiceType::Query, None).await;

    let (first, _rx1) = QueryRequest::new(Duration::from_secs(2), best_effort(), "SELECT 1");
    fx.core.send(first);
    let target_one = fx.dispatched.recv().await.unwrap().target;

    let (second, _rx2) = QueryRequest::new(Duration::from_secs(2), best_effort(), "SELECT 2");
    fx.core.send(second);
    let target_two = fx.dispatched.recv().await.unwrap().target;

    assert_ne!(target_one.host, target_two.host, "cursor advances per dispatch");
}

#[tokio::test]
async fn test_send_after_shutdown_cancels_immediately() {
    let fx = fixture(vec![bucket("travel", &["10.0.0.1"])]);
    fx.core.open_bucket("travel");
    wait_until(|| fx.core.live_nodes().len() == 1).await;

    fx.core.shutdown(Duration::from_secs(5)).await.unwrap();

    let (request, rx) = GetRequest::new(
        Duration::from_secs(2),
        best_effort(),
        "user:42",
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    );
    fx.core.send(request);

    match rx.await.unwrap() {
        Err(KelpError::RequestCanceled { reason, .. }) => {
            assert_eq!(reason, CancellationReason::Shutdown);
        }
        other => panic!("Expected shutdown cancellation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_shutdown_completes_once() {
    let fx = fixture(vec![bucket("travel", &["10.0.0.1"])]);
    fx.core.open_bucket("travel");
    wait_until(|| fx.core.live_nodes().len() == 1).await;

    let mut events = fx.bus.subscribe();
    let first = fx.core.clone();
    let second = fx.core.clone();
    let (a, b) = tokio::join!(
        first.shutdown(Duration::from_secs(5)),
        second.shutdown(Duration::from_secs(5))
    );
    a.unwrap();
    b.unwrap();

    let mut initiated = 0;
    let mut completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::ShutdownInitiated => initiated += 1,
            CoreEvent::ShutdownCompleted { .. } => completed += 1,
            _ => {}
        }
    }
    assert_eq!(initiated, 1, "exactly one shutdown initiated");
    assert_eq!(completed, 1, "exactly one shutdown completed");
    assert!(fx.core.live_nodes().is_empty());
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let mut fx = fixture(vec![bucket("travel", &["10.0.0.1"])]);
    fx.core.open_bucket("travel");
    wait_for_connected(&fx.core, "10.0.0.1", ServiceType::KeyValue, Some("travel")).await;

    let (request, rx) = GetRequest::new(
        Duration::from_millis(50),
        best_effort(),
        "user:42",
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    );
    fx.core.send(request);

    // The endpoint receives it but nobody answers.
    let _record = fx.dispatched.recv().await.unwrap();

    match rx.await.unwrap() {
        Err(KelpError::RequestCanceled { reason, .. }) => {
            assert_eq!(reason, CancellationReason::Timeout);
        }
        other => panic!("Expected timeout cancellation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_fail_fast_without_bucket_config() {
    let fx = fixture(vec![]);

    let (request, rx) = GetRequest::new(
        Duration::from_secs(2),
        Arc::new(FailFastRetryStrategy),
        "user:42",
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    );
    fx.core.send(request);

    match rx.await.unwrap() {
        Err(KelpError::RequestCanceled { reason, .. }) => {
            assert_eq!(
                reason,
                CancellationReason::NoMoreRetries(RetryReason::BucketConfigNotAvailable)
            );
        }
        other => panic!("Expected retry exhaustion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_init_global_config_failure_classification() {
    let fx = fixture(vec![]);
    let mut events = fx.bus.subscribe();

    // No global config on this cluster.
    fx.core.init_global_config();
    let event = next_event(&mut events, |e| {
        matches!(e, CoreEvent::InitGlobalConfigFailed { .. })
    })
    .await;
    match event {
        CoreEvent::InitGlobalConfigFailed { reason, .. } => {
            assert_eq!(reason, GlobalConfigFailure::NoConfigFound);
        }
        _ => unreachable!(),
    }

    // A load raced with provider shutdown: classified, not raised.
    fx.provider.shutdown().await.unwrap();
    fx.core.init_global_config();
    let event = next_event(&mut events, |e| {
        matches!(e, CoreEvent::InitGlobalConfigFailed { .. })
    })
    .await;
    match event {
        CoreEvent::InitGlobalConfigFailed { reason, .. } => {
            assert_eq!(reason, GlobalConfigFailure::Shutdown);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_open_unknown_bucket_publishes_failure() {
    let fx = fixture(vec![]);
    let mut events = fx.bus.subscribe();

    fx.core.open_bucket("nope");

    let event = next_event(&mut events, |e| {
        matches!(e, CoreEvent::BucketOpenFailed { .. })
    })
    .await;
    match event {
        CoreEvent::BucketOpenFailed { bucket, severity, .. } => {
            assert_eq!(bucket, "nope");
            assert_eq!(severity, Severity::Warn);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_before_send_callback_runs_once_per_send() {
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting(Arc<AtomicU32>);
    impl BeforeSendCallback for Counting {
        fn before_send(&self, _request: &dyn KelpRequest) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let seen = Arc::new(AtomicU32::new(0));
    let (factory, _dispatched) = QueueEndpointFactory::new();
    let bus = Arc::new(BroadcastEventBus::new(64));
    let provider = Arc::new(StaticConfigProvider::new(vec![], None));
    let environment = Arc::new(
        CoreEnvironment::new(bus, factory)
            .with_before_send(Arc::new(Counting(seen.clone()))),
    );
    let core = Core::new(
        environment,
        Arc::new(PasswordAuthenticator::new("tester", "secret")),
        vec![],
        provider,
    )
    .unwrap();

    let (request, rx) = GetRequest::new(
        Duration::from_secs(1),
        Arc::new(FailFastRetryStrategy),
        "k",
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    );
    core.send(request);
    let _ = rx.await;

    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_response_metric_is_created_once_per_identity() {
    let mut fx = fixture(vec![bucket("travel", &["10.0.0.1"])]);
    fx.core.open_bucket("travel");
    wait_for_connected(&fx.core, "10.0.0.1", ServiceType::KeyValue, Some("travel")).await;

    let (request, _rx) = GetRequest::new(
        Duration::from_secs(2),
        best_effort(),
        "user:42",
        CollectionIdentifier::default_for_bucket("travel"),
        None,
    );
    fx.core.send(request.clone());
    let _record = fx.dispatched.recv().await.unwrap();

    let first = fx.core.response_metric(request.as_ref());
    let second = fx.core.response_metric(request.as_ref());
    assert!(
        Arc::ptr_eq(&first, &second),
        "recorder allocated once per (service, target, operation)"
    );
}

#[tokio::test]
async fn test_tls_authenticator_mismatch_fails_construction() {
    struct TlsOnly;
    impl Authenticator for TlsOnly {
        fn supports_non_tls(&self) -> bool {
            false
        }
    }

    let (factory, _dispatched) = QueueEndpointFactory::new();
    let bus = Arc::new(BroadcastEventBus::new(64));
    let provider = Arc::new(StaticConfigProvider::new(vec![], None));
    let environment = Arc::new(CoreEnvironment::new(bus, factory));

    let result = Core::new(environment, Arc::new(TlsOnly), vec![], provider);
    assert!(matches!(result, Err(KelpError::InvalidArgument(_))));
}

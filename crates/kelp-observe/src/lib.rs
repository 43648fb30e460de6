//! kelp-observe: vendor-neutral observability ABI.
//!
//! The core crates depend only on these traits and event types. Concrete
//! backends (log sinks, metric exporters) live elsewhere.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Severity attached to a published event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// Why loading the global config failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalConfigFailure {
    /// The cluster does not support the global config mechanism.
    Unsupported,
    /// The cluster supports it but no config was found.
    NoConfigFound,
    /// The credentials in use are not allowed to fetch it.
    NoAccess,
    /// The client shut down while the load was in flight.
    Shutdown,
    /// Anything else.
    Unknown,
}

impl GlobalConfigFailure {
    /// Shutdown races are expected during teardown, everything else is worth a look.
    pub fn severity(self) -> Severity {
        match self {
            GlobalConfigFailure::Shutdown => Severity::Debug,
            GlobalConfigFailure::Unsupported | GlobalConfigFailure::NoConfigFound => Severity::Info,
            GlobalConfigFailure::NoAccess | GlobalConfigFailure::Unknown => Severity::Warn,
        }
    }
}

/// Typed events emitted by the client core.
///
/// Errors are carried as rendered strings so this crate stays free of the
/// core's error types.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// A new core instance was created.
    CoreCreated { instance_id: u64, seed_nodes: Vec<String> },
    /// A bucket open was kicked off.
    BucketOpenInitiated { bucket: String },
    /// A bucket open completed.
    BucketOpened { bucket: String, elapsed: Duration },
    /// A bucket open failed.
    BucketOpenFailed { bucket: String, elapsed: Duration, error: String, severity: Severity },
    /// A bucket was closed.
    BucketClosed { bucket: String, elapsed: Duration },
    /// Loading the global config failed (never raised to the caller).
    InitGlobalConfigFailed { reason: GlobalConfigFailure, elapsed: Duration, error: String },
    /// Shutdown started.
    ShutdownInitiated,
    /// Shutdown finished and all nodes drained.
    ShutdownCompleted { elapsed: Duration },
    /// A reconfiguration pass converged.
    ReconfigurationCompleted { elapsed: Duration },
    /// A reconfiguration pass aborted with an error.
    ReconfigurationErrorDetected { error: String },
    /// A config arrived while a reconfiguration was running; it will be
    /// picked up by the coalesced rerun.
    ReconfigurationIgnored,
    /// Reconciling one service on one node failed; the pass continued.
    ServiceReconfigurationFailed { host: String, service: &'static str, error: String },
}

impl CoreEvent {
    pub fn severity(&self) -> Severity {
        match self {
            CoreEvent::CoreCreated { .. }
            | CoreEvent::BucketOpened { .. }
            | CoreEvent::BucketClosed { .. }
            | CoreEvent::ShutdownInitiated
            | CoreEvent::ShutdownCompleted { .. } => Severity::Info,
            CoreEvent::BucketOpenInitiated { .. }
            | CoreEvent::ReconfigurationCompleted { .. }
            | CoreEvent::ReconfigurationIgnored => Severity::Debug,
            CoreEvent::BucketOpenFailed { severity, .. } => *severity,
            CoreEvent::InitGlobalConfigFailed { reason, .. } => reason.severity(),
            CoreEvent::ReconfigurationErrorDetected { .. }
            | CoreEvent::ServiceReconfigurationFailed { .. } => Severity::Warn,
        }
    }
}

/// Sink for core events.
pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: CoreEvent);
}

/// Event bus backed by a tokio broadcast channel.
///
/// Sends are fire-and-forget; if nobody subscribed the event is dropped.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }
}

/// A do-nothing bus for users who don't care about events.
#[derive(Clone, Copy, Default)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    fn publish(&self, _event: CoreEvent) {}
}

/// Records observed values, e.g. response latencies in microseconds.
pub trait ValueRecorder: Send + Sync {
    fn record(&self, value: u64);
}

/// Creates value recorders keyed by a meter name and tag set.
pub trait Meter: Send + Sync + 'static {
    fn value_recorder(
        &self,
        name: &'static str,
        tags: &[(&'static str, String)],
    ) -> Arc<dyn ValueRecorder>;
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Copy, Default)]
pub struct NoopMeter;

struct NoopRecorder;

impl ValueRecorder for NoopRecorder {
    fn record(&self, _value: u64) {}
}

impl Meter for NoopMeter {
    fn value_recorder(
        &self,
        _name: &'static str,
        _tags: &[(&'static str, String)],
    ) -> Arc<dyn ValueRecorder> {
        Arc::new(NoopRecorder)
    }
}

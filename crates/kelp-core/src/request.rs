//! The request base: lifecycle state machine, completion sink and the
//! object-safe [`KelpRequest`] trait the dispatcher routes on.
//!
//! A request is created *pending*, may move to *dispatched*, and ends in
//! exactly one of *completed* or *cancelled*. Completion is terminal: the
//! single-shot sink fires once and every later attempt is a no-op.

use crate::error::{CancellationReason, KelpError};
use crate::kv::KvRequest;
use crate::retry::RetryStrategy;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Allocates request opaques. Wraps on overflow; uniqueness is
/// best-effort within the lifetime of a connection.
static GLOBAL_OPAQUE: AtomicU32 = AtomicU32::new(0);

pub fn next_opaque() -> u32 {
    GLOBAL_OPAQUE.fetch_add(1, Ordering::Relaxed)
}

/// A dispatch target as `host:port`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostAndPort {
    pub host: String,
    pub port: u16,
}

impl HostAndPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Domain-level response status, converted from the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    NotFound,
    Invalid,
    NoAccess,
    TooManyRequests,
    InternalServerError,
    Unknown,
}

impl ResponseStatus {
    /// Maps a raw HTTP status code onto the domain status.
    pub fn from_http(code: u16) -> Self {
        match code {
            200..=299 => ResponseStatus::Success,
            400 => ResponseStatus::Invalid,
            401 | 403 => ResponseStatus::NoAccess,
            404 => ResponseStatus::NotFound,
            429 => ResponseStatus::TooManyRequests,
            500..=599 => ResponseStatus::InternalServerError,
            _ => ResponseStatus::Unknown,
        }
    }

    pub fn success(self) -> bool {
        self == ResponseStatus::Success
    }
}

/// Lifecycle states of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    Pending = 0,
    Dispatched = 1,
    Completed = 2,
    Cancelled = 3,
}

impl RequestState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestState::Pending,
            1 => RequestState::Dispatched,
            2 => RequestState::Completed,
            _ => RequestState::Cancelled,
        }
    }

    pub fn terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Cancelled)
    }
}

/// The response-type-independent part of a request: deadline, retry
/// strategy, opaque, lifecycle state, dispatch bookkeeping.
pub struct RequestLifecycle {
    timeout: Duration,
    deadline: Instant,
    retry: Arc<dyn RetryStrategy>,
    opaque: u32,
    state: AtomicU8,
    span: Option<String>,
    last_dispatched_to: Mutex<Option<HostAndPort>>,
    retry_attempts: AtomicU32,
}

impl RequestLifecycle {
    fn new(timeout: Duration, retry: Arc<dyn RetryStrategy>, span: Option<String>) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            retry,
            opaque: next_opaque(),
            state: AtomicU8::new(RequestState::Pending as u8),
            span,
            last_dispatched_to: Mutex::new(None),
            retry_attempts: AtomicU32::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Trace span name this request reports under, if tracing is wired up.
    pub fn span(&self) -> Option<&str> {
        self.span.as_deref()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn retry_strategy(&self) -> Arc<dyn RetryStrategy> {
        self.retry.clone()
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    /// `0x` + lowercase hex of the opaque; reversible via hex parse.
    pub fn operation_id(&self) -> String {
        format!("0x{:x}", self.opaque)
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn completed(&self) -> bool {
        self.state().terminal()
    }

    /// Pending → dispatched. Terminal states are left alone.
    pub fn mark_dispatched(&self) {
        let _ = self.state.compare_exchange(
            RequestState::Pending as u8,
            RequestState::Dispatched as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Transition into a terminal state. True exactly once.
    fn enter_terminal(&self, target: RequestState) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if RequestState::from_u8(current).terminal() {
                return false;
            }
            if self
                .state
                .compare_exchange(current, target as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn last_dispatched_to(&self) -> Option<HostAndPort> {
        self.last_dispatched_to.lock().clone()
    }

    pub fn set_last_dispatched_to(&self, target: HostAndPort) {
        *self.last_dispatched_to.lock() = Some(target);
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts.load(Ordering::Relaxed)
    }

    pub fn incr_retry_attempts(&self) -> u32 {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Shared base of every request: the lifecycle plus the single-shot,
/// typed completion sink.
pub struct RequestCommon<R> {
    lifecycle: RequestLifecycle,
    sink: Mutex<Option<oneshot::Sender<Result<R, KelpError>>>>,
}

impl<R> RequestCommon<R> {
    /// Creates the base plus the receiver handed to the caller.
    pub fn new(
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
    ) -> (Self, oneshot::Receiver<Result<R, KelpError>>) {
        Self::with_span(timeout, retry, None)
    }

    pub fn with_span(
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
        span: Option<String>,
    ) -> (Self, oneshot::Receiver<Result<R, KelpError>>) {
        let (tx, rx) = oneshot::channel();
        let common = Self {
            lifecycle: RequestLifecycle::new(timeout, retry, span),
            sink: Mutex::new(Some(tx)),
        };
        (common, rx)
    }

    pub fn lifecycle(&self) -> &RequestLifecycle {
        &self.lifecycle
    }

    fn take_sink(&self, target: RequestState) -> Option<oneshot::Sender<Result<R, KelpError>>> {
        if self.lifecycle.enter_terminal(target) {
            self.sink.lock().take()
        } else {
            None
        }
    }

    pub fn succeed(&self, response: R) {
        if let Some(sink) = self.take_sink(RequestState::Completed) {
            let _ = sink.send(Ok(response));
        }
    }

    pub fn fail(&self, error: KelpError) {
        if let Some(sink) = self.take_sink(RequestState::Completed) {
            let _ = sink.send(Err(error));
        }
    }

    /// Cancels with the given reason; `context` names the operation for
    /// the error message.
    pub fn cancel(&self, reason: CancellationReason, context: String) {
        if let Some(sink) = self.take_sink(RequestState::Cancelled) {
            let _ = sink.send(Err(KelpError::RequestCanceled { reason, context }));
        }
    }
}

/// The object-safe surface the dispatcher, timer and retry machinery
/// route on. Typed completion lives on the concrete request types; the
/// lifecycle accessors are provided through [`lifecycle`].
///
/// [`lifecycle`]: KelpRequest::lifecycle
pub trait KelpRequest: Send + Sync + 'static {
    fn lifecycle(&self) -> &RequestLifecycle;

    fn service_type(&self) -> kelp_config::ServiceType;

    /// Short operation name, e.g. `get`; used in metric tags.
    fn name(&self) -> &'static str;

    /// The bucket this request is scoped to, if any.
    fn bucket(&self) -> Option<&str> {
        None
    }

    fn cancel(&self, reason: CancellationReason);

    fn fail(&self, error: KelpError);

    /// Narrowing hook for the KV locator.
    fn as_kv(&self) -> Option<&dyn KvRequest> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn timeout(&self) -> Duration {
        self.lifecycle().timeout()
    }

    fn deadline(&self) -> Instant {
        self.lifecycle().deadline()
    }

    fn retry_strategy(&self) -> Arc<dyn RetryStrategy> {
        self.lifecycle().retry_strategy()
    }

    fn operation_id(&self) -> String {
        self.lifecycle().operation_id()
    }

    fn state(&self) -> RequestState {
        self.lifecycle().state()
    }

    fn completed(&self) -> bool {
        self.lifecycle().completed()
    }

    fn mark_dispatched(&self) {
        self.lifecycle().mark_dispatched()
    }

    fn last_dispatched_to(&self) -> Option<HostAndPort> {
        self.lifecycle().last_dispatched_to()
    }

    fn set_last_dispatched_to(&self, target: HostAndPort) {
        self.lifecycle().set_last_dispatched_to(target)
    }

    fn retry_attempts(&self) -> u32 {
        self.lifecycle().retry_attempts()
    }

    fn incr_retry_attempts(&self) -> u32 {
        self.lifecycle().incr_retry_attempts()
    }

    fn span(&self) -> Option<&str> {
        self.lifecycle().span()
    }

    /// Structured context for error messages and log envelopes.
    fn service_context(&self) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        ctx.insert("type".to_string(), self.service_type().ident().to_string());
        ctx.insert("opaque".to_string(), self.operation_id());
        ctx
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A bare-bones request for exercising dispatch machinery in unit
    //! tests without pulling in a concrete service request.

    use super::*;
    use crate::retry::FailFastRetryStrategy;

    pub struct ProbeRequest {
        pub common: RequestCommon<()>,
        service_type: kelp_config::ServiceType,
    }

    impl ProbeRequest {
        pub fn new(
            timeout: Duration,
            service_type: kelp_config::ServiceType,
        ) -> (Arc<Self>, oneshot::Receiver<Result<(), KelpError>>) {
            Self::with_strategy(timeout, service_type, Arc::new(FailFastRetryStrategy))
        }

        pub fn with_strategy(
            timeout: Duration,
            service_type: kelp_config::ServiceType,
            retry: Arc<dyn RetryStrategy>,
        ) -> (Arc<Self>, oneshot::Receiver<Result<(), KelpError>>) {
            let (common, rx) = RequestCommon::new(timeout, retry);
            (
                Arc::new(Self {
                    common,
                    service_type,
                }),
                rx,
            )
        }
    }

    impl KelpRequest for ProbeRequest {
        fn lifecycle(&self) -> &RequestLifecycle {
            self.common.lifecycle()
        }
        fn service_type(&self) -> kelp_config::ServiceType {
            self.service_type
        }
        fn name(&self) -> &'static str {
            "probe"
        }
        fn cancel(&self, reason: CancellationReason) {
            self.common.cancel(reason, self.name().to_string());
        }
        fn fail(&self, error: KelpError) {
            self.common.fail(error);
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FailFastRetryStrategy;

    fn common() -> (RequestCommon<u32>, oneshot::Receiver<Result<u32, KelpError>>) {
        RequestCommon::new(Duration::from_secs(1), Arc::new(FailFastRetryStrategy))
    }

    #[tokio::test]
    async fn test_success_is_terminal_and_single_shot() {
        let (req, rx) = common();
        assert_eq!(req.lifecycle().state(), RequestState::Pending);

        req.lifecycle().mark_dispatched();
        assert_eq!(req.lifecycle().state(), RequestState::Dispatched);

        req.succeed(42);
        assert_eq!(req.lifecycle().state(), RequestState::Completed);

        // Late failure/cancel attempts change nothing.
        req.fail(KelpError::Generic("late".to_string()));
        req.cancel(CancellationReason::Timeout, "late".to_string());
        assert_eq!(req.lifecycle().state(), RequestState::Completed);

        assert_eq!(rx.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_cancel_delivers_reason() {
        let (req, rx) = common();
        req.cancel(CancellationReason::Shutdown, "get".to_string());
        assert_eq!(req.lifecycle().state(), RequestState::Cancelled);

        match rx.await.unwrap() {
            Err(KelpError::RequestCanceled { reason, .. }) => {
                assert_eq!(reason, CancellationReason::Shutdown);
            }
            other => panic!("Expected cancellation, got {:?}", other),
        }
    }

    #[test]
    fn test_operation_id_round_trips() {
        let (req, _rx) = common();
        let id = req.lifecycle().operation_id();
        assert!(id.starts_with("0x"));
        let parsed = u32::from_str_radix(&id[2..], 16).unwrap();
        assert_eq!(parsed, req.lifecycle().opaque());
    }

    #[test]
    fn test_opaque_allocation_advances_modulo_wrap() {
        // Other tests allocate concurrently, so only check the counter
        // moved forward (in wrapping arithmetic) by a sane amount.
        let a = next_opaque();
        let b = next_opaque();
        let advanced = b.wrapping_sub(a);
        assert!(advanced >= 1 && advanced < 1_000, "advanced by {}", advanced);
    }

    #[test]
    fn test_response_status_from_http() {
        assert!(ResponseStatus::from_http(200).success());
        assert!(ResponseStatus::from_http(204).success());
        assert!(!ResponseStatus::from_http(404).success());
        assert_eq!(
            ResponseStatus::from_http(500),
            ResponseStatus::InternalServerError
        );
    }
}

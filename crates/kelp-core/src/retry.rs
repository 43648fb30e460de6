//! Retry strategies and the retry orchestration used by the locators.
//!
//! Dispatch-time failures (no config yet, node missing, service disabled)
//! are not errors by themselves; the request's strategy decides whether to
//! reschedule or give up. Rescheduled requests re-enter `Core::send` with
//! timeout registration suppressed, so the original deadline stays
//! authoritative.

use crate::core::Core;
use crate::error::CancellationReason;
use crate::request::KelpRequest;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Why a dispatch attempt could not be completed right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// No config for the request's bucket has arrived yet.
    BucketConfigNotAvailable,
    /// The partition has no active node in the current map.
    PartitionNotAvailable,
    /// The target node is not (yet) in the live set.
    NodeNotAvailable,
    /// The node is known but does not have the service enabled.
    ServiceNotAvailable,
    /// The service has no usable endpoint.
    EndpointNotAvailable,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetryReason::BucketConfigNotAvailable => "bucket config not available",
            RetryReason::PartitionNotAvailable => "partition not available",
            RetryReason::NodeNotAvailable => "node not available",
            RetryReason::ServiceNotAvailable => "service not available",
            RetryReason::EndpointNotAvailable => "endpoint not available",
        };
        f.write_str(s)
    }
}

/// The strategy's verdict for one failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Re-dispatch after the given delay.
    RetryAfter(Duration),
    /// Give up; the request is cancelled with the failing reason.
    Cancel,
}

/// Decides whether a request gets another dispatch attempt.
pub trait RetryStrategy: Send + Sync + 'static {
    fn should_retry(&self, request: &dyn KelpRequest, reason: RetryReason) -> RetryAction;
}

/// Retries with capped exponential backoff for as long as the deadline
/// leaves room. The default strategy.
pub struct BestEffortRetryStrategy {
    floor: Duration,
    ceiling: Duration,
}

impl BestEffortRetryStrategy {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self { floor, ceiling }
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1), Duration::from_millis(500))
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn should_retry(&self, request: &dyn KelpRequest, _reason: RetryReason) -> RetryAction {
        let attempt = request.retry_attempts().min(16);
        let delay = self
            .floor
            .saturating_mul(1u32 << attempt)
            .min(self.ceiling);

        if Instant::now() + delay >= request.deadline() {
            return RetryAction::Cancel;
        }
        RetryAction::RetryAfter(delay)
    }
}

/// Never retries. For callers that prefer fast failure over convergence.
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn should_retry(&self, _request: &dyn KelpRequest, _reason: RetryReason) -> RetryAction {
        RetryAction::Cancel
    }
}

/// Runs one failed attempt through the request's strategy: either
/// schedules a re-dispatch (without re-registering the timeout) or
/// cancels the request with the failing reason.
pub fn orchestrate(core: &Core, request: Arc<dyn KelpRequest>, reason: RetryReason) {
    if request.completed() {
        return;
    }

    match request.retry_strategy().should_retry(request.as_ref(), reason) {
        RetryAction::RetryAfter(delay) => {
            request.incr_retry_attempts();
            tracing::debug!(
                operation = %request.operation_id(),
                %reason,
                ?delay,
                "Rescheduling dispatch"
            );
            let core = core.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                core.send_with(request, false);
            });
        }
        RetryAction::Cancel => {
            request.cancel(CancellationReason::NoMoreRetries(reason));
        }
    }
}

//! Timeout registration for in-flight requests.
//!
//! Every request registered here is cancelled with reason *timeout* at
//! its deadline unless it completed first. Retried dispatches do not
//! re-register; the deadline set at creation stays authoritative.

use crate::error::CancellationReason;
use crate::request::KelpRequest;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default)]
pub struct Timer;

impl Timer {
    pub fn new() -> Self {
        Self
    }

    /// Arms the deadline watchdog for one request.
    pub fn register(&self, request: Arc<dyn KelpRequest>) {
        let deadline = request.deadline();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if !request.completed() {
                request.cancel(CancellationReason::Timeout);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KelpError;
    use crate::request::test_support::ProbeRequest;
    use crate::request::RequestState;
    use kelp_config::ServiceType;
    use std::time::Duration;

    #[tokio::test]
    async fn test_timer_cancels_at_deadline() {
        let timer = Timer::new();
        let (request, rx) = ProbeRequest::new(Duration::from_millis(20), ServiceType::KeyValue);

        timer.register(request.clone());

        match rx.await.unwrap() {
            Err(KelpError::RequestCanceled { reason, .. }) => {
                assert_eq!(reason, CancellationReason::Timeout);
            }
            other => panic!("Expected timeout cancellation, got {:?}", other),
        }
        assert_eq!(request.state(), RequestState::Cancelled);
    }

    #[tokio::test]
    async fn test_completed_request_is_left_alone() {
        let timer = Timer::new();
        let (request, rx) = ProbeRequest::new(Duration::from_millis(20), ServiceType::KeyValue);

        timer.register(request.clone());
        request.common.succeed(());

        assert!(rx.await.unwrap().is_ok());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(request.state(), RequestState::Completed);
    }
}

//! The query service request: a statement posted to the query endpoint,
//! answered by a streaming row envelope.

use crate::chunk::{ChunkedHttpRequest, HttpRequestParts};
use crate::error::{CancellationReason, KelpError};
use crate::json_stream::{JsonChunkHeader, JsonChunkParser, JsonChunkTrailer};
use crate::request::{KelpRequest, RequestCommon, RequestLifecycle, ResponseStatus};
use crate::retry::RetryStrategy;
use bytes::Bytes;
use kelp_config::ServiceType;
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The live response handed to the caller as soon as the envelope header
/// is complete: rows and the trailer keep streaming in.
#[derive(Debug)]
pub struct QueryResponse {
    pub status: ResponseStatus,
    pub header: JsonChunkHeader,
    pub rows: mpsc::UnboundedReceiver<Result<Bytes, KelpError>>,
    pub trailer: oneshot::Receiver<JsonChunkTrailer>,
}

pub struct QueryRequest {
    common: RequestCommon<QueryResponse>,
    statement: String,
}

impl QueryRequest {
    pub fn new(
        timeout: Duration,
        retry: Arc<dyn RetryStrategy>,
        statement: impl Into<String>,
    ) -> (
        Arc<Self>,
        oneshot::Receiver<Result<QueryResponse, KelpError>>,
    ) {
        let (common, rx) = RequestCommon::new(timeout, retry);
        (
            Arc::new(Self {
                common,
                statement: statement.into(),
            }),
            rx,
        )
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }
}

impl KelpRequest for QueryRequest {
    fn lifecycle(&self) -> &RequestLifecycle {
        self.common.lifecycle()
    }
    fn service_type(&self) -> ServiceType {
        ServiceType::Query
    }
    fn name(&self) -> &'static str {
        "query"
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

impl ChunkedHttpRequest for QueryRequest {
    type Parser = JsonChunkParser;
    type Response = QueryResponse;

    fn encode(&self) -> Result<HttpRequestParts, KelpError> {
        let body = serde_json::to_vec(&json!({
            "statement": self.statement,
            "client_context_id": self.operation_id(),
        }))
        .map_err(|e| KelpError::Generic(format!("failed to encode query request: {}", e)))?;

        Ok(HttpRequestParts {
            method: "POST",
            path: "/query/service".to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Bytes::from(body),
        })
    }

    fn decode(
        &self,
        status: ResponseStatus,
        header: JsonChunkHeader,
        rows: mpsc::UnboundedReceiver<Result<Bytes, KelpError>>,
        trailer: oneshot::Receiver<JsonChunkTrailer>,
    ) -> QueryResponse {
        QueryResponse {
            status,
            header,
            rows,
            trailer,
        }
    }

    fn succeed(&self, response: QueryResponse) {
        self.common.succeed(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FailFastRetryStrategy;

    #[test]
    fn test_encode_carries_statement_and_context_id() {
        let (request, _rx) = QueryRequest::new(
            Duration::from_secs(75),
            Arc::new(FailFastRetryStrategy),
            "SELECT 1",
        );

        let parts = request.encode().unwrap();
        assert_eq!(parts.method, "POST");
        assert_eq!(parts.path, "/query/service");

        let body: serde_json::Value = serde_json::from_slice(&parts.body).unwrap();
        assert_eq!(body["statement"], "SELECT 1");
        assert_eq!(body["client_context_id"], request.operation_id());
    }
}

//! kelp-core: the dispatch and topology engine of the Kelp client.
//!
//! The core connects to a set of seed nodes, consumes cluster config
//! snapshots from a provider, keeps a live set of nodes and their
//! enabled services converged with the topology, and routes every
//! request onto the right (node, service) pair for its service type.
//!
//! # Architecture
//!
//! - [`core`]: the [`Core`] itself — `send`, bucket lifecycle, the
//!   serialized coalescing reconciler, shutdown
//! - the locators: per-service routing (partition hashing for KV,
//!   round-robin for the HTTP services)
//! - [`node`] / [`service`]: the live topology objects and their
//!   endpoint pools
//! - [`request`] / [`kv`]: the request base and the KV framing layer
//! - [`chunk`] / [`json_stream`] / [`query`]: streaming HTTP responses
//! - [`retry`] / [`timer`]: dispatch retries and timeout cancellation

pub mod chunk;
pub mod context;
pub mod core;
pub mod error;
pub mod json_stream;
pub mod kv;
mod locator;
pub mod node;
pub mod query;
pub mod request;
pub mod retry;
pub mod service;
pub mod timer;

pub use crate::core::{Core, METER_OPERATIONS};
pub use chunk::{ChunkResponseParser, ChunkedHandler, ChunkedHttpRequest, HttpFrame, HttpRequestParts};
pub use context::{
    Authenticator, BeforeSendCallback, CoreContext, CoreEnvironment, PasswordAuthenticator,
    SecurityConfig,
};
pub use error::{CancellationReason, KelpError};
pub use json_stream::{JsonChunkHeader, JsonChunkParser, JsonChunkTrailer};
pub use kv::{
    CollectionIdentifier, DurabilityLevel, GetRequest, GetResponse, KeyValueChannelContext,
    KvRequest, UpsertRequest, UpsertResponse, MAX_KEY_BYTES,
};
pub use node::Node;
pub use query::{QueryRequest, QueryResponse};
pub use request::{HostAndPort, KelpRequest, RequestState, ResponseStatus};
pub use retry::{
    BestEffortRetryStrategy, FailFastRetryStrategy, RetryAction, RetryReason, RetryStrategy,
};
pub use service::{
    DispatchRecord, Endpoint, EndpointDiagnostics, EndpointFactory, QueueEndpoint,
    QueueEndpointFactory, Service, ServiceState,
};
pub use timer::Timer;

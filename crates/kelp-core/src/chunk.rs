//! Chunked HTTP response streaming.
//!
//! HTTP services answer with a JSON envelope of `{header, rows*,
//! trailer}` over chunked transfer encoding. The [`ChunkedHandler`] sits
//! in a connection's pipeline: it accumulates content chunks, drives a
//! [`ChunkResponseParser`] over the shared buffer, emits the initial
//! response as soon as the header is complete (rows then stream to the
//! caller), and settles the trailer after the last chunk.
//!
//! Exactly one initial success or failure is delivered per request; once
//! the response has been handed out it is never re-emitted.

use crate::error::KelpError;
use crate::request::{KelpRequest, ResponseStatus};
use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Incremental parser for one streaming response envelope.
///
/// The handler owns the byte accumulator; the parser consumes complete
/// units from it and reports how far it got, so the handler can discard
/// the read prefix and keep the buffer bounded on long streams.
pub trait ChunkResponseParser: Send + 'static {
    type Header: Clone + Send + 'static;
    type Row: Send + 'static;
    type Trailer: Send + 'static;

    /// Resets for a fresh response stream.
    fn initialize(&mut self);

    /// Parses as much of `input` as possible, returning the number of
    /// bytes consumed. Zero means no complete unit was available yet.
    fn parse(&mut self, input: &[u8]) -> Result<usize, KelpError>;

    /// The header, once enough of the envelope has been seen.
    fn header(&self) -> Option<Self::Header>;

    /// The row stream receiver. Yields `Some` exactly once per stream.
    fn take_rows(&mut self) -> Option<mpsc::UnboundedReceiver<Result<Self::Row, KelpError>>>;

    /// The trailer receiver. Yields `Some` exactly once per stream.
    fn take_trailer(&mut self) -> Option<oneshot::Receiver<Self::Trailer>>;

    /// The body is complete; settle the trailer and close the row stream.
    fn signal_complete(&mut self);

    /// The server-reported error extracted from the envelope, if any.
    fn error(&self) -> Option<KelpError>;
}

/// Decoded HTTP frames fed into the handler by the connection's codec.
#[derive(Debug)]
pub enum HttpFrame {
    /// The response head; carries the raw status code.
    Head { status: u16 },
    /// A body chunk; `last` marks the final content of the response.
    Content { data: Bytes, last: bool },
}

/// An encoded HTTP request handed down to the connection's codec.
#[derive(Debug)]
pub struct HttpRequestParts {
    pub method: &'static str,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A request answered by a streaming envelope.
pub trait ChunkedHttpRequest: KelpRequest {
    type Parser: ChunkResponseParser;
    type Response: Send + 'static;

    /// Encodes into HTTP request parts; the handler sets the Host header.
    fn encode(&self) -> Result<HttpRequestParts, KelpError>;

    /// Builds the streaming response from the parsed header plus the
    /// live row/trailer channels.
    fn decode(
        &self,
        status: ResponseStatus,
        header: <Self::Parser as ChunkResponseParser>::Header,
        rows: mpsc::UnboundedReceiver<
            Result<<Self::Parser as ChunkResponseParser>::Row, KelpError>,
        >,
        trailer: oneshot::Receiver<<Self::Parser as ChunkResponseParser>::Trailer>,
    ) -> Self::Response;

    /// Completes the request with the initial response.
    fn succeed(&self, response: Self::Response);
}

/// Per-connection duplex handler for one streaming service.
///
/// An `Err` returned from [`write`] or [`read`] means the connection is
/// broken at the protocol level and must be closed by the caller; the
/// in-flight request has already been failed.
///
/// [`write`]: ChunkedHandler::write
/// [`read`]: ChunkedHandler::read
pub struct ChunkedHandler<REQ: ChunkedHttpRequest> {
    parser: REQ::Parser,
    remote_host: Option<String>,
    current_request: Option<Arc<REQ>>,
    response_emitted: bool,
    raw_status: Option<u16>,
    converted_status: Option<ResponseStatus>,
    buffer: BytesMut,
}

impl<REQ: ChunkedHttpRequest> ChunkedHandler<REQ> {
    pub fn new(parser: REQ::Parser) -> Self {
        Self {
            parser,
            remote_host: None,
            current_request: None,
            response_emitted: false,
            raw_status: None,
            converted_status: None,
            buffer: BytesMut::new(),
        }
    }

    /// The connection is up; allocate the accumulator and cache the
    /// remote `host:port` for request Host headers.
    pub fn channel_active(&mut self, remote: SocketAddr) {
        self.buffer = BytesMut::with_capacity(4096);
        self.remote_host = Some(format!("{}:{}", remote.ip(), remote.port()));
    }

    /// The raw HTTP status of the in-flight response, if one arrived.
    pub fn raw_status(&self) -> Option<u16> {
        self.raw_status
    }

    /// Encodes a request for the wire. Encoding failures fail the
    /// request and break the connection rather than being swallowed.
    pub fn write(&mut self, request: Arc<REQ>) -> Result<HttpRequestParts, KelpError> {
        let mut encoded = match request.encode() {
            Ok(parts) => parts,
            Err(error) => {
                request.fail(error.clone());
                return Err(error);
            }
        };
        if let Some(host) = &self.remote_host {
            encoded.headers.push(("Host".to_string(), host.clone()));
        }
        self.current_request = Some(request);
        Ok(encoded)
    }

    /// Feeds one inbound frame through the handler.
    pub fn read(&mut self, frame: HttpFrame) -> Result<(), KelpError> {
        match frame {
            HttpFrame::Head { status } => {
                self.raw_status = Some(status);
                self.converted_status = Some(ResponseStatus::from_http(status));
                self.parser.initialize();
                Ok(())
            }
            HttpFrame::Content { data, last } => {
                let Some(status) = self.converted_status else {
                    let error =
                        KelpError::Generic("protocol violation: content before response head".to_string());
                    self.fail_current(error.clone());
                    self.cleanup();
                    return Err(error);
                };

                self.buffer.extend_from_slice(&data);
                match self.parser.parse(&self.buffer) {
                    Ok(consumed) if consumed > 0 => self.buffer.advance(consumed),
                    Ok(_) => {}
                    Err(error) => {
                        self.fail_current(error.clone());
                        self.cleanup();
                        return Err(error);
                    }
                }

                self.maybe_emit_initial_response(status);

                if last {
                    self.parser.signal_complete();
                    if !status.success() && !self.response_emitted {
                        let error = self.parser.error().unwrap_or_else(|| {
                            KelpError::Generic(
                                "request failed, but no more information available".to_string(),
                            )
                        });
                        self.fail_current(error);
                    }
                    self.cleanup();
                }
                Ok(())
            }
        }
    }

    /// The connection went away; reset state and release the buffer.
    pub fn channel_inactive(&mut self) {
        self.cleanup();
        self.buffer = BytesMut::new();
    }

    fn maybe_emit_initial_response(&mut self, status: ResponseStatus) {
        if self.response_emitted || !status.success() {
            return;
        }
        let Some(header) = self.parser.header() else {
            return;
        };
        let (Some(rows), Some(trailer)) = (self.parser.take_rows(), self.parser.take_trailer())
        else {
            return;
        };
        if let Some(request) = &self.current_request {
            let response = request.decode(status, header, rows, trailer);
            request.succeed(response);
            self.response_emitted = true;
        }
    }

    fn fail_current(&mut self, error: KelpError) {
        if let Some(request) = self.current_request.take() {
            request.fail(error);
        }
    }

    /// Resets for the next request; the accumulator is reused, not freed.
    fn cleanup(&mut self) {
        self.buffer.clear();
        self.current_request = None;
        self.response_emitted = false;
        self.raw_status = None;
        self.converted_status = None;
    }
}

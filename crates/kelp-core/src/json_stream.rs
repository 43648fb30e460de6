//! Incremental parsing of streaming JSON response envelopes.
//!
//! Envelopes look like `{"requestID": "...", "rows": [r1, r2, ...],
//! "status": "success"}`: scalar fields before the row array form the
//! header, array elements stream out as rows while bytes arrive, and
//! fields after the array settle the trailer. The parser only ever
//! consumes complete JSON units, so it can be driven with arbitrarily
//! split chunks; complete values are handed to `serde_json`.

use crate::chunk::ChunkResponseParser;
use crate::error::KelpError;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Fields whose array values are streamed as rows, across the query,
/// analytics, search and view envelopes.
pub const DEFAULT_ROWS_FIELDS: &[&str] = &["rows", "results", "hits"];

/// Header of a streaming envelope: everything needed to hand the caller
/// a live response before any row arrived.
#[derive(Clone, Debug)]
pub struct JsonChunkHeader {
    pub request_id: String,
    pub client_context_id: Option<String>,
    pub signature: Option<Bytes>,
}

/// Trailer of a streaming envelope, settled after the last row.
#[derive(Clone, Debug)]
pub struct JsonChunkTrailer {
    pub status: Option<String>,
    pub metrics: Option<Bytes>,
    pub warnings: Option<Bytes>,
    pub errors: Option<Bytes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanState {
    /// Before the envelope's opening brace.
    Start,
    /// Between top-level fields.
    BeforeField,
    /// Inside the row array.
    InRows,
    /// The envelope's closing brace was consumed.
    Done,
}

/// The envelope parser behind all chunked HTTP services.
pub struct JsonChunkParser {
    rows_fields: &'static [&'static str],
    state: ScanState,
    request_id: Option<String>,
    client_context_id: Option<String>,
    signature: Option<Bytes>,
    status: Option<String>,
    metrics: Option<Bytes>,
    warnings: Option<Bytes>,
    errors: Option<Bytes>,
    object_closed: bool,
    rows_tx: Option<mpsc::UnboundedSender<Result<Bytes, KelpError>>>,
    rows_rx: Option<mpsc::UnboundedReceiver<Result<Bytes, KelpError>>>,
    trailer_tx: Option<oneshot::Sender<JsonChunkTrailer>>,
    trailer_rx: Option<oneshot::Receiver<JsonChunkTrailer>>,
}

impl JsonChunkParser {
    pub fn new() -> Self {
        Self::with_rows_fields(DEFAULT_ROWS_FIELDS)
    }

    pub fn with_rows_fields(rows_fields: &'static [&'static str]) -> Self {
        let mut parser = Self {
            rows_fields,
            state: ScanState::Start,
            request_id: None,
            client_context_id: None,
            signature: None,
            status: None,
            metrics: None,
            warnings: None,
            errors: None,
            object_closed: false,
            rows_tx: None,
            rows_rx: None,
            trailer_tx: None,
            trailer_rx: None,
        };
        parser.initialize();
        parser
    }

    fn record_field(&mut self, name: &str, raw: &[u8]) -> Result<(), KelpError> {
        match name {
            "requestID" => self.request_id = Some(parse_string(raw)?),
            "clientContextID" => self.client_context_id = Some(parse_string(raw)?),
            "signature" => self.signature = Some(Bytes::copy_from_slice(raw)),
            "status" => self.status = Some(parse_string(raw)?),
            "metrics" => self.metrics = Some(Bytes::copy_from_slice(raw)),
            "warnings" => self.warnings = Some(Bytes::copy_from_slice(raw)),
            "errors" => self.errors = Some(Bytes::copy_from_slice(raw)),
            _ => {}
        }
        Ok(())
    }

    fn emit_row(&mut self, row: Bytes) {
        if let Some(tx) = &self.rows_tx {
            let _ = tx.send(Ok(row));
        }
    }

    /// The closing brace arrived: settle the trailer and end the row
    /// stream, error-terminating it if the server reported errors.
    fn finish_object(&mut self) {
        self.object_closed = true;
        if let Some(error) = self.error() {
            if let Some(tx) = &self.rows_tx {
                let _ = tx.send(Err(error));
            }
        }
        self.rows_tx = None;
        if let Some(tx) = self.trailer_tx.take() {
            let _ = tx.send(JsonChunkTrailer {
                status: self.status.clone(),
                metrics: self.metrics.clone(),
                warnings: self.warnings.clone(),
                errors: self.errors.clone(),
            });
        }
    }
}

impl Default for JsonChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkResponseParser for JsonChunkParser {
    type Header = JsonChunkHeader;
    type Row = Bytes;
    type Trailer = JsonChunkTrailer;

    fn initialize(&mut self) {
        let (rows_tx, rows_rx) = mpsc::unbounded_channel();
        let (trailer_tx, trailer_rx) = oneshot::channel();
        self.state = ScanState::Start;
        self.request_id = None;
        self.client_context_id = None;
        self.signature = None;
        self.status = None;
        self.metrics = None;
        self.warnings = None;
        self.errors = None;
        self.object_closed = false;
        self.rows_tx = Some(rows_tx);
        self.rows_rx = Some(rows_rx);
        self.trailer_tx = Some(trailer_tx);
        self.trailer_rx = Some(trailer_rx);
    }

    fn parse(&mut self, input: &[u8]) -> Result<usize, KelpError> {
        let mut pos = 0;
        loop {
            match self.state {
                ScanState::Start => {
                    pos += skip_ws(&input[pos..]);
                    let Some(&byte) = input.get(pos) else {
                        return Ok(pos);
                    };
                    if byte != b'{' {
                        return Err(KelpError::Generic(format!(
                            "malformed response envelope: expected object, found byte 0x{:02x}",
                            byte
                        )));
                    }
                    pos += 1;
                    self.state = ScanState::BeforeField;
                }
                ScanState::BeforeField => {
                    pos += skip_ws(&input[pos..]);
                    let Some(&byte) = input.get(pos) else {
                        return Ok(pos);
                    };
                    match byte {
                        b',' => pos += 1,
                        b'}' => {
                            pos += 1;
                            self.finish_object();
                            self.state = ScanState::Done;
                        }
                        b'"' => {
                            let Some((name, name_len)) = read_field_name(&input[pos..])? else {
                                return Ok(pos);
                            };
                            if self.rows_fields.contains(&name.as_str()) {
                                // The array opens the row stream; consume
                                // through the bracket.
                                let after = pos + name_len;
                                let ws = skip_ws(&input[after..]);
                                match input.get(after + ws) {
                                    Some(&b'[') => {
                                        pos = after + ws + 1;
                                        self.state = ScanState::InRows;
                                    }
                                    Some(other) => {
                                        return Err(KelpError::Generic(format!(
                                            "malformed response envelope: expected row array, found byte 0x{:02x}",
                                            other
                                        )));
                                    }
                                    None => return Ok(pos),
                                }
                            } else {
                                let Some(value_len) = complete_value_len(&input[pos + name_len..])?
                                else {
                                    return Ok(pos);
                                };
                                let raw = &input[pos + name_len..pos + name_len + value_len];
                                self.record_field(&name, trim_ws(raw))?;
                                pos += name_len + value_len;
                            }
                        }
                        other => {
                            return Err(KelpError::Generic(format!(
                                "malformed response envelope: unexpected byte 0x{:02x}",
                                other
                            )));
                        }
                    }
                }
                ScanState::InRows => {
                    pos += skip_ws(&input[pos..]);
                    let Some(&byte) = input.get(pos) else {
                        return Ok(pos);
                    };
                    match byte {
                        b']' => {
                            pos += 1;
                            // Anything after the array settles the trailer.
                            self.state = ScanState::BeforeField;
                        }
                        b',' => pos += 1,
                        _ => {
                            let Some(value_len) = complete_value_len(&input[pos..])? else {
                                return Ok(pos);
                            };
                            let raw = trim_ws(&input[pos..pos + value_len]);
                            self.emit_row(Bytes::copy_from_slice(raw));
                            pos += value_len;
                        }
                    }
                }
                ScanState::Done => {
                    // Swallow trailing whitespace after the envelope.
                    return Ok(pos + skip_ws(&input[pos..]));
                }
            }
        }
    }

    fn header(&self) -> Option<JsonChunkHeader> {
        self.request_id.as_ref().map(|id| JsonChunkHeader {
            request_id: id.clone(),
            client_context_id: self.client_context_id.clone(),
            signature: self.signature.clone(),
        })
    }

    fn take_rows(&mut self) -> Option<mpsc::UnboundedReceiver<Result<Bytes, KelpError>>> {
        self.rows_rx.take()
    }

    fn take_trailer(&mut self) -> Option<oneshot::Receiver<JsonChunkTrailer>> {
        self.trailer_rx.take()
    }

    fn signal_complete(&mut self) {
        if self.object_closed {
            return;
        }
        // Truncated stream: error-terminate the rows if the server told
        // us why, then drop both channels so consumers observe the loss.
        if let Some(error) = self.error() {
            if let Some(tx) = &self.rows_tx {
                let _ = tx.send(Err(error));
            }
        }
        self.rows_tx = None;
        self.trailer_tx = None;
    }

    fn error(&self) -> Option<KelpError> {
        let raw = self.errors.as_ref()?;
        let parsed: serde_json::Value = serde_json::from_slice(raw).ok()?;
        let first = parsed.as_array()?.first()?;
        let code = first.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
        let msg = first
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown");
        Some(KelpError::Generic(format!(
            "server reported error {}: {}",
            code, msg
        )))
    }
}

fn skip_ws(input: &[u8]) -> usize {
    input
        .iter()
        .take_while(|b| matches!(**b, b' ' | b'\t' | b'\r' | b'\n'))
        .count()
}

fn trim_ws(input: &[u8]) -> &[u8] {
    &input[skip_ws(input)..]
}

fn parse_string(raw: &[u8]) -> Result<String, KelpError> {
    serde_json::from_slice(raw)
        .map_err(|e| KelpError::Generic(format!("malformed envelope field: {}", e)))
}

/// Length of one complete JSON string starting at `input[0] == b'"'`,
/// or `None` if it is still incomplete.
fn complete_string_len(input: &[u8]) -> Option<usize> {
    let mut escaped = false;
    for (i, &byte) in input.iter().enumerate().skip(1) {
        if escaped {
            escaped = false;
        } else if byte == b'\\' {
            escaped = true;
        } else if byte == b'"' {
            return Some(i + 1);
        }
    }
    None
}

/// Length of one complete JSON value (leading whitespace included).
/// `Ok(None)` while the buffer ends before the value does; `Err` on a
/// byte that cannot start a value.
fn complete_value_len(input: &[u8]) -> Result<Option<usize>, KelpError> {
    let ws = skip_ws(input);
    let body = &input[ws..];
    let Some(&first) = body.first() else {
        return Ok(None);
    };

    let len = match first {
        b'"' => match complete_string_len(body) {
            Some(len) => len,
            None => return Ok(None),
        },
        b'{' | b'[' => {
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            let mut len = None;
            for (i, &byte) in body.iter().enumerate() {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if byte == b'\\' {
                        escaped = true;
                    } else if byte == b'"' {
                        in_string = false;
                    }
                } else {
                    match byte {
                        b'"' => in_string = true,
                        b'{' | b'[' => depth += 1,
                        b'}' | b']' => {
                            depth -= 1;
                            if depth == 0 {
                                len = Some(i + 1);
                                break;
                            }
                        }
                        _ => {}
                    }
                }
            }
            match len {
                Some(len) => len,
                None => return Ok(None),
            }
        }
        b't' | b'n' => {
            if body.len() < 4 {
                return Ok(None);
            }
            4
        }
        b'f' => {
            if body.len() < 5 {
                return Ok(None);
            }
            5
        }
        b'-' | b'0'..=b'9' => {
            // A number is only known complete once a delimiter follows.
            let run = body
                .iter()
                .take_while(|b| matches!(**b, b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E'))
                .count();
            if run == body.len() {
                return Ok(None);
            }
            run
        }
        other => {
            return Err(KelpError::Generic(format!(
                "malformed response envelope: byte 0x{:02x} cannot start a value",
                other
            )));
        }
    };
    Ok(Some(ws + len))
}

/// A complete `"name"` plus the following colon; `Ok(None)` while the
/// buffer ends inside it.
fn read_field_name(input: &[u8]) -> Result<Option<(String, usize)>, KelpError> {
    let Some(name_len) = complete_string_len(input) else {
        return Ok(None);
    };
    let name = parse_string(&input[..name_len])?;
    let ws = skip_ws(&input[name_len..]);
    match input.get(name_len + ws) {
        Some(&b':') => Ok(Some((name, name_len + ws + 1))),
        Some(other) => Err(KelpError::Generic(format!(
            "malformed response envelope: expected ':', found byte 0x{:02x}",
            other
        ))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds `chunks` through the parser the way the handler does:
    /// accumulate, parse, discard the consumed prefix.
    fn drive(parser: &mut JsonChunkParser, chunks: &[&[u8]]) {
        let mut buffer: Vec<u8> = Vec::new();
        for chunk in chunks {
            buffer.extend_from_slice(chunk);
            let consumed = parser.parse(&buffer).unwrap();
            buffer.drain(..consumed);
        }
    }

    fn collect_rows(
        mut rx: mpsc::UnboundedReceiver<Result<Bytes, KelpError>>,
    ) -> Vec<Result<Bytes, KelpError>> {
        let mut rows = Vec::new();
        while let Ok(row) = rx.try_recv() {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_complete_value_len() {
        assert_eq!(complete_value_len(b"\"abc\",").unwrap(), Some(5));
        assert_eq!(complete_value_len(b"{\"a\":1},").unwrap(), Some(7));
        assert_eq!(complete_value_len(b"[1,2,3]]").unwrap(), Some(7));
        assert_eq!(complete_value_len(b"123,").unwrap(), Some(3));
        assert_eq!(complete_value_len(b"true,").unwrap(), Some(4));
        assert_eq!(complete_value_len(b" null}").unwrap(), Some(5));

        assert_eq!(complete_value_len(b"\"ab").unwrap(), None, "unterminated string");
        assert_eq!(complete_value_len(b"{\"a\":").unwrap(), None, "open object");
        assert_eq!(complete_value_len(b"123").unwrap(), None, "number needs delimiter");
        assert_eq!(complete_value_len(b"").unwrap(), None);

        assert!(complete_value_len(b"xyz,").is_err(), "not a value start");
    }

    #[test]
    fn test_escaped_quotes_in_strings() {
        assert_eq!(complete_value_len(br#""a\"b","#).unwrap(), Some(6));
        assert_eq!(complete_value_len(br#"{"a":"}"},"#).unwrap(), Some(9));
    }

    #[test]
    fn test_single_chunk_envelope() {
        let mut parser = JsonChunkParser::new();
        drive(
            &mut parser,
            &[br#"{"requestID":"7b8a","rows":[{"a":1},{"b":2}],"status":"success"}"# as &[u8]],
        );

        let header = parser.header().unwrap();
        assert_eq!(header.request_id, "7b8a");

        let rows = collect_rows(parser.take_rows().unwrap());
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0].as_ref().unwrap()[..], br#"{"a":1}"#);
        assert_eq!(&rows[1].as_ref().unwrap()[..], br#"{"b":2}"#);

        let trailer = parser.take_trailer().unwrap().try_recv().unwrap();
        assert_eq!(trailer.status.as_deref(), Some("success"));
    }

    #[test]
    fn test_header_available_before_rows() {
        let mut parser = JsonChunkParser::new();
        drive(&mut parser, &[br#"{"requestID":"abc","#, br#""rows":["#]);

        assert!(parser.header().is_some(), "header complete before any row");
        assert!(collect_rows(parser.take_rows().unwrap()).is_empty());
    }

    #[test]
    fn test_rows_stream_as_chunks_arrive() {
        let mut parser = JsonChunkParser::new();
        let mut buffer: Vec<u8> = Vec::new();

        let mut feed = |parser: &mut JsonChunkParser, buffer: &mut Vec<u8>, data: &[u8]| {
            buffer.extend_from_slice(data);
            let consumed = parser.parse(buffer).unwrap();
            buffer.drain(..consumed);
        };

        feed(&mut parser, &mut buffer, br#"{"requestID":"x","results":[{"v":1}"#);
        let mut rx = parser.take_rows().unwrap();
        assert_eq!(&rx.try_recv().unwrap().unwrap()[..], br#"{"v":1}"#);

        feed(&mut parser, &mut buffer, br#",{"v":2}],"status":"success"}"#);
        assert_eq!(&rx.try_recv().unwrap().unwrap()[..], br#"{"v":2}"#);
        assert!(rx.try_recv().is_err(), "stream closed after trailer");
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let envelope =
            br#"{"requestID":"id-1","clientContextID":"ctx","rows":[{"n":1},{"n":2},{"n":3}],"status":"success"}"#;
        let mut parser = JsonChunkParser::new();
        let chunks: Vec<&[u8]> = envelope.chunks(1).collect();
        drive(&mut parser, &chunks);

        let header = parser.header().unwrap();
        assert_eq!(header.client_context_id.as_deref(), Some("ctx"));
        assert_eq!(collect_rows(parser.take_rows().unwrap()).len(), 3);
        let trailer = parser.take_trailer().unwrap().try_recv().unwrap();
        assert_eq!(trailer.status.as_deref(), Some("success"));
    }

    #[test]
    fn test_error_envelope_without_header() {
        let mut parser = JsonChunkParser::new();
        drive(&mut parser, &[br#"{"errors":[{"code":1234,"msg":"x"}]}"# as &[u8]]);

        assert!(parser.header().is_none());
        match parser.error().unwrap() {
            KelpError::Generic(msg) => {
                assert!(msg.contains("1234"), "{}", msg);
                assert!(msg.contains('x'), "{}", msg);
            }
            other => panic!("Expected generic server error, got {:?}", other),
        }
    }

    #[test]
    fn test_errors_after_rows_terminate_stream() {
        let mut parser = JsonChunkParser::new();
        drive(
            &mut parser,
            &[br#"{"requestID":"a","rows":[{"n":1}],"errors":[{"code":5,"msg":"boom"}],"status":"errors"}"#
                as &[u8]],
        );

        let rows = collect_rows(parser.take_rows().unwrap());
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_ok());
        assert!(rows[1].is_err(), "stream error-terminated");
    }

    #[test]
    fn test_truncated_stream_drops_trailer() {
        let mut parser = JsonChunkParser::new();
        drive(&mut parser, &[br#"{"requestID":"a","rows":[{"n":1}"# as &[u8]]);
        parser.signal_complete();

        let mut trailer = parser.take_trailer().unwrap();
        assert!(trailer.try_recv().is_err(), "trailer lost with the channel");
    }

    #[test]
    fn test_malformed_envelope_is_rejected() {
        let mut parser = JsonChunkParser::new();
        assert!(parser.parse(b"not json").is_err());
    }

    #[test]
    fn test_fields_between_header_and_rows_are_ignored() {
        let mut parser = JsonChunkParser::new();
        drive(
            &mut parser,
            &[br#"{"requestID":"a","signature":{"*":"*"},"unknown":[1,2],"rows":[],"status":"success"}"#
                as &[u8]],
        );
        let header = parser.header().unwrap();
        assert_eq!(&header.signature.unwrap()[..], br#"{"*":"*"}"#);
        assert_eq!(
            parser
                .take_trailer()
                .unwrap()
                .try_recv()
                .unwrap()
                .status
                .as_deref(),
            Some("success")
        );
    }
}

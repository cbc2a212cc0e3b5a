//! Body capture and reassembly
//!
//! Everything here works on copies. The bytes the client receives are never
//! touched, so decoding or parsing failures only degrade the record.

use super::record::{CapturedBody, CapturedEvent};
use super::sse::{SseAssembler, SseEvent};
use crate::providers::ResponseShape;
use base64::Engine;
use serde_json::Value;
use std::io::Read;

/// Content types treated as text when not JSON
const TEXT_CONTENT_TYPES: &[&str] = &["text/", "application/xml", "application/x-www-form-urlencoded"];

/// How a body should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Json,
    EventStream,
    Text,
    Raw,
}

impl BodyKind {
    /// Pick a kind from the signature's shape and the message headers
    pub fn detect(shape: ResponseShape, content_type: Option<&str>) -> Self {
        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
        match shape {
            ResponseShape::Json => Self::Json,
            ResponseShape::EventStream => Self::EventStream,
            ResponseShape::Raw => Self::Raw,
            ResponseShape::Auto if content_type.starts_with("text/event-stream") => {
                Self::EventStream
            }
            ResponseShape::Auto if content_type.contains("json") => Self::Json,
            ResponseShape::Auto
                if TEXT_CONTENT_TYPES
                    .iter()
                    .any(|prefix| content_type.starts_with(prefix)) =>
            {
                Self::Text
            }
            // Unlabelled bodies are usually JSON from LLM clients
            ResponseShape::Auto if content_type.is_empty() => Self::Json,
            ResponseShape::Auto => Self::Raw,
        }
    }
}

/// Supported `content-encoding` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Deflate,
    Brotli,
    Unsupported,
}

impl ContentEncoding {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("identity") => Self::Identity,
            Some("gzip") | Some("x-gzip") => Self::Gzip,
            Some("deflate") => Self::Deflate,
            Some("br") => Self::Brotli,
            Some(_) => Self::Unsupported,
        }
    }

    pub fn is_identity(self) -> bool {
        self == Self::Identity
    }
}

/// Output of [`decode`], never longer than the requested limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub bytes: Vec<u8>,
    /// The decoded body continued past the limit
    pub truncated: bool,
}

/// Decode a captured copy, keeping at most `limit` decoded bytes
///
/// `None` when the encoding is unsupported or the data is corrupt.
pub fn decode(bytes: &[u8], encoding: ContentEncoding, limit: usize) -> Option<Decoded> {
    let result = match encoding {
        ContentEncoding::Identity => read_capped(bytes, limit),
        ContentEncoding::Unsupported => return None,
        ContentEncoding::Gzip => read_capped(flate2::read::MultiGzDecoder::new(bytes), limit),
        ContentEncoding::Deflate => {
            // `deflate` is zlib-wrapped in practice, raw in some servers
            read_capped(flate2::read::ZlibDecoder::new(bytes), limit)
                .or_else(|_| read_capped(flate2::read::DeflateDecoder::new(bytes), limit))
        }
        ContentEncoding::Brotli => read_capped(brotli::Decompressor::new(bytes, 4096), limit),
    };
    result.ok()
}

/// Read one byte past `limit` to learn whether the source continues
fn read_capped<R: Read>(reader: R, limit: usize) -> std::io::Result<Decoded> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut bytes = Vec::new();
    reader.take(cap).read_to_end(&mut bytes)?;

    let truncated = bytes.len() > limit;
    bytes.truncate(limit);
    Ok(Decoded { bytes, truncated })
}

/// Build a captured body from a complete buffer
///
/// `truncated` tells whether `bytes` is a prefix of the real body. Decoded
/// content is capped at `limit` bytes as well.
pub fn capture_bytes(
    bytes: &[u8],
    kind: BodyKind,
    encoding: ContentEncoding,
    encoding_label: Option<&str>,
    limit: usize,
    truncated: bool,
) -> CapturedBody {
    if bytes.is_empty() {
        return CapturedBody::Empty;
    }

    // A truncated compressed body cannot be decoded reliably
    let decoded = if truncated && !encoding.is_identity() {
        None
    } else {
        decode(bytes, encoding, limit)
    };

    let Some(Decoded {
        bytes: decoded,
        truncated: cut,
    }) = decoded
    else {
        let kept = &bytes[..bytes.len().min(limit)];
        return binary(kept, encoding_label, truncated || kept.len() < bytes.len());
    };
    let truncated = truncated || cut;

    match kind {
        BodyKind::Json => match serde_json::from_slice::<Value>(&decoded) {
            Ok(value) => CapturedBody::Json { value, truncated },
            Err(_) => text_or_binary(&decoded, encoding_label, truncated),
        },
        BodyKind::EventStream => {
            let mut assembler = SseAssembler::new();
            assembler.push(&decoded);
            let (events, pending) = assembler.finish();
            reassemble_events(events, pending, !truncated, truncated)
        }
        BodyKind::Text => text_or_binary(&decoded, encoding_label, truncated),
        BodyKind::Raw => binary(&decoded, encoding_label, truncated),
    }
}

fn text_or_binary(bytes: &[u8], encoding: Option<&str>, truncated: bool) -> CapturedBody {
    match std::str::from_utf8(bytes) {
        Ok(text) => CapturedBody::Text {
            text: text.to_string(),
            truncated,
        },
        Err(_) => binary(bytes, encoding, truncated),
    }
}

fn binary(bytes: &[u8], encoding: Option<&str>, truncated: bool) -> CapturedBody {
    CapturedBody::Binary {
        len: bytes.len(),
        encoding: encoding.map(str::to_string),
        data: Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
        truncated,
    }
}

/// Turn parsed events into an event-stream body
///
/// `[DONE]` sentinels are dropped. A partial trailing event is kept and marks
/// the stream incomplete.
pub fn reassemble_events(
    events: Vec<SseEvent>,
    pending: Option<SseEvent>,
    ended: bool,
    truncated: bool,
) -> CapturedBody {
    let complete = ended && pending.is_none();
    let mut text = String::new();
    let captured = events
        .into_iter()
        .chain(pending)
        .filter(|event| !event.is_done_sentinel())
        .map(|event| {
            let data = serde_json::from_str::<Value>(&event.data)
                .unwrap_or_else(|_| Value::String(event.data.clone()));
            if let Some(delta) = text_delta(&data) {
                text.push_str(&delta);
            }
            CapturedEvent {
                event: event.event,
                id: event.id,
                data,
            }
        })
        .collect();

    CapturedBody::EventStream {
        events: captured,
        text,
        complete,
        truncated,
    }
}

/// Text carried by one streamed payload, across the known API shapes
pub fn text_delta(payload: &Value) -> Option<String> {
    // OpenAI Responses API
    if payload.get("type").and_then(Value::as_str) == Some("response.output_text.delta") {
        return payload
            .get("delta")
            .and_then(Value::as_str)
            .map(str::to_string);
    }

    // OpenAI chat and completions
    if let Some(choices) = payload.get("choices").and_then(Value::as_array) {
        let text: String = choices
            .iter()
            .filter_map(|choice| {
                choice
                    .pointer("/delta/content")
                    .and_then(Value::as_str)
                    .or_else(|| choice.get("text").and_then(Value::as_str))
            })
            .collect();
        return (!text.is_empty()).then_some(text);
    }

    // Anthropic content_block_delta
    if let Some(text) = payload.pointer("/delta/text").and_then(Value::as_str) {
        return Some(text.to_string());
    }

    // Gemini
    if let Some(candidates) = payload.get("candidates").and_then(Value::as_array) {
        let text: String = candidates
            .iter()
            .filter_map(|c| c.pointer("/content/parts").and_then(Value::as_array))
            .flatten()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect();
        return (!text.is_empty()).then_some(text);
    }

    // Ollama chat, then generate
    if let Some(text) = payload.pointer("/message/content").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    payload
        .get("response")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// `model` from a JSON request body
pub fn extract_model(body: &CapturedBody) -> Option<String> {
    body.as_json()
        .and_then(|value| value.get("model"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Incremental capture of a response body as it streams past
#[derive(Debug)]
pub struct BodyAccumulator {
    kind: BodyKind,
    encoding: ContentEncoding,
    encoding_label: Option<String>,
    limit: usize,
    buffer: Vec<u8>,
    /// Only used for identity-encoded event streams
    assembler: Option<SseAssembler>,
    seen: usize,
}

impl BodyAccumulator {
    pub fn new(
        kind: BodyKind,
        encoding_label: Option<&str>,
        limit: usize,
    ) -> Self {
        let encoding = ContentEncoding::from_header(encoding_label);
        let assembler =
            (kind == BodyKind::EventStream && encoding.is_identity()).then(SseAssembler::new);
        Self {
            kind,
            encoding,
            encoding_label: encoding_label.map(str::to_string),
            limit,
            buffer: Vec::new(),
            assembler,
            seen: 0,
        }
    }

    pub fn is_event_stream(&self) -> bool {
        self.kind == BodyKind::EventStream
    }

    /// Total bytes observed, including those beyond the capture limit
    pub fn bytes_seen(&self) -> usize {
        self.seen
    }

    pub fn truncated(&self) -> bool {
        self.seen > self.limit
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.seen);
        self.seen = self.seen.saturating_add(chunk.len());
        let kept = &chunk[..chunk.len().min(room)];
        if kept.is_empty() {
            return;
        }

        match &mut self.assembler {
            Some(assembler) => {
                assembler.push(kept);
            }
            None => self.buffer.extend_from_slice(kept),
        }
    }

    /// Produce the captured body; `ended` is false when the stream was cut off
    pub fn finish(self, ended: bool) -> CapturedBody {
        let truncated = self.truncated();
        match self.assembler {
            Some(assembler) => {
                if self.seen == 0 {
                    return CapturedBody::Empty;
                }
                let (events, pending) = assembler.finish();
                reassemble_events(events, pending, ended && !truncated, truncated)
            }
            None => {
                let body = capture_bytes(
                    &self.buffer,
                    self.kind,
                    self.encoding,
                    self.encoding_label.as_deref(),
                    self.limit,
                    truncated || !ended,
                );
                match body {
                    // Cut-off streams never count as complete
                    CapturedBody::EventStream {
                        events,
                        text,
                        truncated,
                        ..
                    } if !ended => CapturedBody::EventStream {
                        events,
                        text,
                        complete: false,
                        truncated,
                    },
                    other => other,
                }
            }
        }
    }
}

/// Capture a buffered request body
///
/// `complete` is false when `bytes` is only the prefix read before the rest
/// of the body was streamed upstream.
pub fn capture_request(
    bytes: &[u8],
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    limit: usize,
    complete: bool,
) -> CapturedBody {
    let kind = BodyKind::detect(ResponseShape::Auto, content_type);
    let truncated = !complete || bytes.len() > limit;
    let kept = &bytes[..bytes.len().min(limit)];
    capture_bytes(
        kept,
        kind,
        ContentEncoding::from_header(content_encoding),
        content_encoding,
        limit,
        truncated,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use rstest::rstest;
    use serde_json::json;
    use std::io::Write;

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[rstest]
    #[case(ResponseShape::Auto, Some("application/json"), BodyKind::Json)]
    #[case(ResponseShape::Auto, Some("text/event-stream; charset=utf-8"), BodyKind::EventStream)]
    #[case(ResponseShape::Auto, Some("text/plain"), BodyKind::Text)]
    #[case(ResponseShape::Auto, Some("audio/mpeg"), BodyKind::Raw)]
    #[case(ResponseShape::Auto, None, BodyKind::Json)]
    #[case(ResponseShape::EventStream, Some("application/json"), BodyKind::EventStream)]
    #[case(ResponseShape::Raw, Some("application/json"), BodyKind::Raw)]
    fn test_body_kind_detection(
        #[case] shape: ResponseShape,
        #[case] content_type: Option<&str>,
        #[case] expected: BodyKind,
    ) {
        assert_eq!(BodyKind::detect(shape, content_type), expected);
    }

    #[test]
    fn test_request_json_and_model() {
        let body = br#"{"model":"gpt-4o","messages":[]}"#;
        let captured = capture_request(body, Some("application/json"), None, 1024, true);
        assert_eq!(extract_model(&captured).as_deref(), Some("gpt-4o"));
        assert!(!captured.is_truncated());
    }

    #[test]
    fn test_request_truncated_to_limit() {
        let body = br#"{"model":"gpt-4o","messages":[]}"#;
        let captured = capture_request(body, Some("application/json"), None, 8, true);
        // A cut JSON document falls back to text
        match captured {
            CapturedBody::Text { text, truncated } => {
                assert_eq!(text, r#"{"model""#);
                assert!(truncated);
            }
            other => panic!("Expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_request_prefix_is_marked_truncated() {
        let captured = capture_request(b"partial upload", Some("text/plain"), None, 1024, false);
        match captured {
            CapturedBody::Text { text, truncated } => {
                assert_eq!(text, "partial upload");
                assert!(truncated);
            }
            other => panic!("Expected text, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(capture_request(b"", None, None, 10, true), CapturedBody::Empty);
    }

    #[test]
    fn test_gzip_body_is_decoded_for_capture() {
        let compressed = gzip(br#"{"id":"cmpl-1"}"#);
        let mut acc = BodyAccumulator::new(BodyKind::Json, Some("gzip"), 1 << 20);
        acc.push(&compressed);
        let body = acc.finish(true);
        assert_eq!(body.as_json(), Some(&json!({"id": "cmpl-1"})));
    }

    #[test]
    fn test_brotli_body_is_decoded_for_capture() {
        let mut compressed = Vec::new();
        {
            let mut writer = brotli::CompressorWriter::new(&mut compressed, 4096, 5, 22);
            writer.write_all(br#"{"ok":true}"#).unwrap();
        }
        let decoded = decode(&compressed, ContentEncoding::Brotli, 1024).unwrap();
        assert_eq!(decoded.bytes, br#"{"ok":true}"#);
        assert!(!decoded.truncated);
    }

    #[test]
    fn test_decompressed_capture_is_capped() {
        let plain = vec![b' '; 4 << 20];
        let compressed = gzip(&plain);
        assert!(compressed.len() < 64 * 1024);

        let mut acc = BodyAccumulator::new(BodyKind::Text, Some("gzip"), 64 * 1024);
        acc.push(&compressed);
        assert!(!acc.truncated());
        match acc.finish(true) {
            CapturedBody::Text { text, truncated } => {
                assert_eq!(text.len(), 64 * 1024);
                assert!(truncated);
            }
            other => panic!("Expected text, got {other:?}"),
        }
    }

    #[rstest]
    #[case(ContentEncoding::Gzip)]
    #[case(ContentEncoding::Identity)]
    fn test_decode_stops_at_limit(#[case] encoding: ContentEncoding) {
        let plain = b"0123456789".repeat(100);
        let input = match encoding {
            ContentEncoding::Gzip => gzip(&plain),
            _ => plain.clone(),
        };

        let decoded = decode(&input, encoding, 10).unwrap();
        assert_eq!(decoded.bytes, b"0123456789");
        assert!(decoded.truncated);

        let whole = decode(&input, encoding, plain.len()).unwrap();
        assert_eq!(whole.bytes, plain);
        assert!(!whole.truncated);
    }

    #[test]
    fn test_unknown_encoding_is_kept_as_binary() {
        let mut acc = BodyAccumulator::new(BodyKind::Json, Some("zstd"), 1024);
        acc.push(&[1, 2, 3]);
        match acc.finish(true) {
            CapturedBody::Binary { len, encoding, .. } => {
                assert_eq!(len, 3);
                assert_eq!(encoding.as_deref(), Some("zstd"));
            }
            other => panic!("Expected binary, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_stream_reassembly() {
        let stream = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mut acc = BodyAccumulator::new(BodyKind::EventStream, None, 1 << 20);
        for chunk in stream.as_bytes().chunks(7) {
            acc.push(chunk);
        }
        match acc.finish(true) {
            CapturedBody::EventStream {
                events,
                text,
                complete,
                truncated,
            } => {
                assert_eq!(events.len(), 3);
                assert_eq!(text, "Hello");
                assert!(complete);
                assert!(!truncated);
            }
            other => panic!("Expected event stream, got {other:?}"),
        }
    }

    #[test]
    fn test_cut_off_stream_is_incomplete() {
        let mut acc = BodyAccumulator::new(BodyKind::EventStream, None, 1 << 20);
        acc.push(b"data: {\"delta\":{\"text\":\"Hi\"}}\n\ndata: {\"delta\":");
        match acc.finish(false) {
            CapturedBody::EventStream { events, text, complete, .. } => {
                assert_eq!(events.len(), 2);
                assert_eq!(text, "Hi");
                assert!(!complete);
            }
            other => panic!("Expected event stream, got {other:?}"),
        }
    }

    #[test]
    fn test_accumulator_respects_limit() {
        let mut acc = BodyAccumulator::new(BodyKind::Text, None, 4);
        acc.push(b"abc");
        acc.push(b"defg");
        assert_eq!(acc.bytes_seen(), 7);
        assert!(acc.truncated());
        match acc.finish(true) {
            CapturedBody::Text { text, truncated } => {
                assert_eq!(text, "abcd");
                assert!(truncated);
            }
            other => panic!("Expected text, got {other:?}"),
        }
    }

    #[rstest]
    #[case(json!({"type": "response.output_text.delta", "delta": "a"}), Some("a"))]
    #[case(json!({"choices": [{"delta": {"content": "b"}}]}), Some("b"))]
    #[case(json!({"choices": [{"text": "c"}]}), Some("c"))]
    #[case(json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "d"}}), Some("d"))]
    #[case(json!({"candidates": [{"content": {"parts": [{"text": "e"}, {"text": "f"}]}}]}), Some("ef"))]
    #[case(json!({"message": {"role": "assistant", "content": "g"}}), Some("g"))]
    #[case(json!({"model": "llama3", "response": "h", "done": false}), Some("h"))]
    #[case(json!({"type": "message_stop"}), None)]
    #[case(json!({"choices": [{"delta": {"role": "assistant"}}]}), None)]
    fn test_text_delta_shapes(#[case] payload: Value, #[case] expected: Option<&str>) {
        assert_eq!(text_delta(&payload).as_deref(), expected);
    }
}

//! Capture record types
//!
//! A [`CaptureRecord`] is assembled from a [`PendingCapture`] owned by a single
//! exchange. Once finished it is frozen and shared as `Arc<CaptureRecord>`.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;
use uuid::Uuid;

/// Time-ordered capture identifier
#[nutype(derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Deserialize,
    Serialize,
    From,
    AsRef,
    FromStr
))]
pub struct CaptureId(Uuid);

impl CaptureId {
    /// Fresh v7 id; ids generated later sort later
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Captured headers, lower-cased names, duplicate values joined with `, `
pub type CapturedHeaders = BTreeMap<String, String>;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Parsed JSON when the payload is JSON, otherwise the raw string
    pub data: Value,
}

/// A request or response body as it appears in a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapturedBody {
    Empty,
    Json {
        value: Value,
        truncated: bool,
    },
    Text {
        text: String,
        truncated: bool,
    },
    Binary {
        len: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
        /// Base64 of the captured bytes
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        truncated: bool,
    },
    EventStream {
        events: Vec<CapturedEvent>,
        /// Concatenated text deltas
        text: String,
        /// The stream ended and its last event was dispatched
        complete: bool,
        truncated: bool,
    },
}

impl CapturedBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_truncated(&self) -> bool {
        match self {
            Self::Empty => false,
            Self::Json { truncated, .. }
            | Self::Text { truncated, .. }
            | Self::Binary { truncated, .. }
            | Self::EventStream { truncated, .. } => *truncated,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// Where a trace id was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceSource {
    Traceparent,
    Header,
    Body,
    Generated,
}

/// Trace context used to group related calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    /// Fresh for every exchange
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub source: TraceSource,
}

/// Byte counts for an opaque CONNECT tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelStats {
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    pub duration_ms: u64,
}

/// One captured exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub id: CaptureId,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub provider: String,
    pub passthrough: bool,
    pub method: String,
    pub path: String,
    pub host: String,
    pub upstream_url: String,
    pub status_code: Option<u16>,
    pub latency_ms: u64,
    pub request_headers: CapturedHeaders,
    pub request_body: CapturedBody,
    pub response_headers: CapturedHeaders,
    /// `None` when no response arrived or for metadata-only records
    pub response_body: Option<CapturedBody>,
    pub streaming: bool,
    pub model: Option<String>,
    pub trace: Option<TraceContext>,
    pub tunnel: Option<TunnelStats>,
    pub error: Option<String>,
}

impl CaptureRecord {
    /// Short label used by sinks, e.g. `openai/v1/chat/completions`
    pub fn op_name(&self) -> String {
        format!("{}{}", self.provider, self.path)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_code.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Per-exchange record under construction
#[derive(Debug)]
pub struct PendingCapture {
    pub id: CaptureId,
    pub provider: String,
    pub passthrough: bool,
    pub method: String,
    pub path: String,
    pub host: String,
    pub upstream_url: String,
    pub request_headers: CapturedHeaders,
    pub request_body: CapturedBody,
    pub model: Option<String>,
    pub trace: Option<TraceContext>,
    pub status_code: Option<u16>,
    pub response_headers: CapturedHeaders,
    pub streaming: bool,
    started_wall: DateTime<Utc>,
    started: Instant,
}

impl PendingCapture {
    pub fn new(
        provider: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        host: impl Into<String>,
        upstream_url: impl Into<String>,
    ) -> Self {
        Self {
            id: CaptureId::generate(),
            provider: provider.into(),
            passthrough: false,
            method: method.into(),
            path: path.into(),
            host: host.into(),
            upstream_url: upstream_url.into(),
            request_headers: CapturedHeaders::new(),
            request_body: CapturedBody::Empty,
            model: None,
            trace: None,
            status_code: None,
            response_headers: CapturedHeaders::new(),
            streaming: false,
            started_wall: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Freeze into a record
    pub fn finish(self, response_body: Option<CapturedBody>, error: Option<String>) -> CaptureRecord {
        self.build(response_body, None, error)
    }

    /// Freeze a CONNECT tunnel into a record
    pub fn finish_tunnel(self, tunnel: TunnelStats, error: Option<String>) -> CaptureRecord {
        self.build(None, Some(tunnel), error)
    }

    fn build(
        self,
        response_body: Option<CapturedBody>,
        tunnel: Option<TunnelStats>,
        error: Option<String>,
    ) -> CaptureRecord {
        let latency_ms = self.elapsed_ms();
        CaptureRecord {
            id: self.id,
            timestamp_start: self.started_wall,
            timestamp_end: Utc::now(),
            provider: self.provider,
            passthrough: self.passthrough,
            method: self.method,
            path: self.path,
            host: self.host,
            upstream_url: self.upstream_url,
            status_code: self.status_code,
            latency_ms,
            request_headers: self.request_headers,
            request_body: self.request_body,
            response_headers: self.response_headers,
            response_body,
            streaming: self.streaming,
            model: self.model,
            trace: self.trace,
            tunnel,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capture_ids_are_time_ordered() {
        let first = CaptureId::generate();
        let second = CaptureId::generate();
        assert!(first < second);
        assert_eq!(first.as_ref().get_version_num(), 7);
    }

    #[test]
    fn test_capture_id_parses_from_string() {
        let id = CaptureId::generate();
        let parsed: CaptureId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_finish_keeps_exchange_metadata() {
        let mut pending = PendingCapture::new(
            "openai",
            "POST",
            "/v1/chat/completions",
            "api.openai.com",
            "https://api.openai.com/v1/chat/completions",
        );
        pending.status_code = Some(200);
        pending.model = Some("gpt-4o".to_string());
        let id = pending.id;

        let record = pending.finish(
            Some(CapturedBody::Json {
                value: json!({"ok": true}),
                truncated: false,
            }),
            None,
        );

        assert_eq!(record.id, id);
        assert_eq!(record.op_name(), "openai/v1/chat/completions");
        assert!(record.is_success());
        assert!(record.timestamp_end >= record.timestamp_start);
        assert!(record.tunnel.is_none());
    }

    #[test]
    fn test_failed_record_is_not_success() {
        let pending = PendingCapture::new("openai", "POST", "/x", "h", "http://h/x");
        let record = pending.finish(None, Some("upstream timed out".to_string()));
        assert!(!record.is_success());
        assert!(record.status_code.is_none());
        assert!(record.response_body.is_none());
    }

    #[test]
    fn test_body_serializes_with_kind_tag() {
        let body = CapturedBody::EventStream {
            events: vec![],
            text: "hi".to_string(),
            complete: true,
            truncated: false,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["kind"], "event_stream");
        assert_eq!(value["text"], "hi");
    }
}

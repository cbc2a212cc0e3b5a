//! Trace context extraction for grouping related calls

use super::record::{TraceContext, TraceSource};
use http::HeaderMap;
use serde_json::Value;
use uuid::Uuid;

const TRACE_ID_HEADERS: &[&str] = &["x-trace-id", "x-request-id", "x-correlation-id", "x-b3-traceid"];
const PARENT_ID_HEADERS: &[&str] = &["x-parent-id", "x-b3-parentspanid", "x-parent-span-id"];
const TRACE_ID_LEN: usize = 32;
const SPAN_ID_LEN: usize = 16;

/// Resolve the trace context for one exchange
///
/// Priority: `traceparent`, custom trace headers, request body metadata,
/// then a fresh id. The span id is always new.
pub fn extract(headers: &HeaderMap, body: Option<&Value>) -> TraceContext {
    let mut trace_id = None;
    let mut parent_span_id = None;
    let mut source = TraceSource::Generated;

    if let Some((trace, parent)) = header_str(headers, "traceparent").and_then(parse_traceparent) {
        trace_id = Some(trace);
        parent_span_id = Some(parent);
        source = TraceSource::Traceparent;
    }

    if trace_id.is_none() {
        if let Some(value) = first_header(headers, TRACE_ID_HEADERS) {
            trace_id = Some(truncate(value, TRACE_ID_LEN));
            source = TraceSource::Header;
        }
    }

    if parent_span_id.is_none() {
        parent_span_id = first_header(headers, PARENT_ID_HEADERS).map(|v| truncate(v, SPAN_ID_LEN));
    }

    if trace_id.is_none() {
        if let Some((trace, parent)) = body.and_then(from_body) {
            trace_id = Some(trace);
            parent_span_id = parent_span_id.or(parent);
            source = TraceSource::Body;
        }
    }

    TraceContext {
        trace_id: trace_id.unwrap_or_else(new_trace_id),
        span_id: new_span_id(),
        parent_span_id,
        source,
    }
}

/// `version-traceid-parentid-flags`, all lower-case hex
fn parse_traceparent(value: &str) -> Option<(String, String)> {
    let value = value.trim().to_ascii_lowercase();
    let fields: Vec<&str> = value.split('-').collect();
    let &[version, trace, parent, flags] = fields.as_slice() else {
        return None;
    };

    let is_hex = |field: &str, len: usize| {
        field.len() == len && field.bytes().all(|b| b.is_ascii_hexdigit())
    };
    let valid = is_hex(version, 2)
        && is_hex(trace, TRACE_ID_LEN)
        && is_hex(parent, SPAN_ID_LEN)
        && is_hex(flags, 2);
    if !valid {
        return None;
    }
    Some((trace.to_string(), parent.to_string()))
}

fn from_body(body: &Value) -> Option<(String, Option<String>)> {
    let object = body.as_object()?;

    let metadata = object.get("metadata").and_then(Value::as_object);
    let parent = metadata.and_then(|m| {
        ["parent_id", "parentId", "span_id"]
            .iter()
            .find_map(|key| value_string(m.get(*key)?))
    });

    let trace = metadata
        .and_then(|m| ["trace_id", "traceId"].iter().find_map(|key| value_string(m.get(*key)?)))
        .or_else(|| {
            [
                "run_id",
                "runId",
                "session_id",
                "sessionId",
                "conversation_id",
                "conversationId",
                "thread_id",
                "threadId",
            ]
            .iter()
            .find_map(|key| value_string(object.get(*key)?))
            .map(|id| truncate(&id, TRACE_ID_LEN))
        })?;

    Some((trace, parent))
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn first_header<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| header_str(headers, name).filter(|v| !v.is_empty()))
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

fn new_trace_id() -> String {
    hex::encode(Uuid::new_v4().as_bytes())
}

fn new_span_id() -> String {
    hex::encode(&Uuid::new_v4().as_bytes()[..SPAN_ID_LEN / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use serde_json::json;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_traceparent_wins() {
        let ctx = extract(
            &headers(&[
                ("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
                ("x-trace-id", "ignored"),
            ]),
            None,
        );
        assert_eq!(ctx.trace_id, "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("b7ad6b7169203331"));
        assert_eq!(ctx.source, TraceSource::Traceparent);
        assert_eq!(ctx.span_id.len(), 16);
    }

    #[test]
    fn test_malformed_traceparent_falls_back_to_headers() {
        let ctx = extract(
            &headers(&[("traceparent", "garbage"), ("x-request-id", "req-123")]),
            None,
        );
        assert_eq!(ctx.trace_id, "req-123");
        assert_eq!(ctx.source, TraceSource::Header);
    }

    #[test]
    fn test_header_ids_are_truncated() {
        let long = "a".repeat(40);
        let parent = "b".repeat(20);
        let ctx = extract(
            &headers(&[
                ("x-correlation-id", long.as_str()),
                ("x-b3-parentspanid", parent.as_str()),
            ]),
            None,
        );
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.parent_span_id.as_deref(), Some("bbbbbbbbbbbbbbbb"));
    }

    #[test]
    fn test_body_metadata() {
        let body = json!({"metadata": {"trace_id": "t-1", "parentId": "p-1"}, "run_id": "r"});
        let ctx = extract(&HeaderMap::new(), Some(&body));
        assert_eq!(ctx.trace_id, "t-1");
        assert_eq!(ctx.parent_span_id.as_deref(), Some("p-1"));
        assert_eq!(ctx.source, TraceSource::Body);
    }

    #[test]
    fn test_body_run_and_session_ids() {
        let ctx = extract(&HeaderMap::new(), Some(&json!({"runId": "run-9"})));
        assert_eq!(ctx.trace_id, "run-9");

        let ctx = extract(&HeaderMap::new(), Some(&json!({"thread_id": 42})));
        assert_eq!(ctx.trace_id, "42");
    }

    #[test]
    fn test_fresh_ids_when_nothing_found() {
        let first = extract(&HeaderMap::new(), Some(&json!({"model": "x"})));
        let second = extract(&HeaderMap::new(), None);
        assert_eq!(first.source, TraceSource::Generated);
        assert_eq!(first.trace_id.len(), 32);
        assert_ne!(first.trace_id, second.trace_id);
        assert_ne!(first.span_id, second.span_id);
    }
}

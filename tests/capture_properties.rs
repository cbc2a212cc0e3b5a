//! Property-based tests for classification and capture invariants

use proptest::prelude::*;
use std::sync::Arc;
use tracerun::capture::body::{BodyAccumulator, BodyKind};
use tracerun::capture::{CaptureBuffer, CapturedBody, PendingCapture};
use tracerun::providers::{
    Classification, NormalizedRequest, ProviderConfigFile, ProviderRegistry, ResponseShape,
    SignatureSpec,
};

pub mod generators {
    use super::*;
    use proptest::collection::vec;
    use proptest::string::string_regex;

    pub fn host() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("api.openai.com".to_string()),
            Just("api.anthropic.com".to_string()),
            Just("localhost:11434".to_string()),
            Just("127.0.0.1:8000".to_string()),
            string_regex("[a-z]{1,12}\\.(com|io|dev)").unwrap(),
        ]
    }

    pub fn path() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("/v1/chat/completions".to_string()),
            Just("/v1/messages".to_string()),
            Just("/api/chat".to_string()),
            Just("/v1/embeddings".to_string()),
            string_regex("(/[a-z0-9]{1,8}){1,4}").unwrap(),
        ]
    }

    /// Text deltas that survive JSON and SSE framing untouched
    pub fn deltas() -> impl Strategy<Value = Vec<String>> {
        vec(string_regex("[A-Za-z0-9 ,.!?]{0,12}").unwrap(), 1..12)
    }

    pub fn split_points(len: usize) -> impl Strategy<Value = Vec<usize>> {
        vec(0..=len, 0..16).prop_map(|mut points| {
            points.sort_unstable();
            points.dedup();
            points
        })
    }
}

fn event_stream(deltas: &[String]) -> Vec<u8> {
    let mut body = String::new();
    for delta in deltas {
        let payload = serde_json::json!({"choices": [{"delta": {"content": delta}}]});
        body.push_str(&format!("data: {payload}\r\n\r\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body.into_bytes()
}

fn accumulate(bytes: &[u8], splits: &[usize]) -> CapturedBody {
    let mut accumulator = BodyAccumulator::new(BodyKind::EventStream, None, 1 << 20);
    let mut start = 0;
    for &split in splits.iter().chain(std::iter::once(&bytes.len())) {
        if split > start {
            accumulator.push(&bytes[start..split]);
            start = split;
        }
    }
    accumulator.finish(true)
}

proptest! {
    #[test]
    fn classification_is_deterministic(host in generators::host(), path in generators::path()) {
        let registry = ProviderRegistry::build(&ProviderConfigFile::default()).unwrap();
        let uri: http::Uri = format!("http://{host}{path}").parse().unwrap();
        let request = NormalizedRequest::new(&http::Method::POST, &uri);

        let first = registry.classify(&request.as_meta(None));
        let second = registry.classify(&request.as_meta(None));
        prop_assert_eq!(first, second);
    }

    #[test]
    fn user_entries_shadow_builtins_when_first(path in generators::path()) {
        let config = ProviderConfigFile {
            providers: vec![SignatureSpec {
                name: "gateway".to_string(),
                path_patterns: vec![".*".to_string()],
                host_patterns: Vec::new(),
                is_regex: true,
                response_shape: ResponseShape::Auto,
            }],
            ..ProviderConfigFile::default()
        };
        let registry = ProviderRegistry::build(&config).unwrap();
        let uri: http::Uri = format!("https://api.openai.com{path}").parse().unwrap();
        let request = NormalizedRequest::new(&http::Method::POST, &uri);

        match registry.classify(&request.as_meta(None)) {
            Classification::Provider(found) => prop_assert_eq!(found.name.as_ref(), "gateway"),
            Classification::Unknown => prop_assert!(false, "catch-all entry must match"),
        }
    }

    #[test]
    fn event_stream_capture_ignores_chunk_boundaries(
        (deltas, splits) in generators::deltas().prop_flat_map(|deltas| {
            let len = event_stream(&deltas).len();
            (Just(deltas), generators::split_points(len))
        })
    ) {
        let bytes = event_stream(&deltas);
        let whole = accumulate(&bytes, &[]);
        let split = accumulate(&bytes, &splits);
        prop_assert_eq!(&whole, &split);

        match split {
            CapturedBody::EventStream { text, events, complete, .. } => {
                prop_assert_eq!(text, deltas.concat());
                prop_assert_eq!(events.len(), deltas.len());
                prop_assert!(complete);
            }
            other => prop_assert!(false, "unexpected body {:?}", other),
        }
    }

    #[test]
    fn buffer_never_exceeds_capacity(capacity in 1usize..32, inserts in 0usize..128) {
        let buffer = CaptureBuffer::new(capacity);
        for i in 0..inserts {
            let record = PendingCapture::new("openai", "POST", format!("/v1/{i}"), "h", "u")
                .finish(None, None);
            buffer.insert(Arc::new(record));
        }

        prop_assert!(buffer.len() <= capacity);
        prop_assert_eq!(buffer.len(), inserts.min(capacity));
        let stats = buffer.stats();
        prop_assert_eq!(stats.total_inserted, inserts as u64);
        prop_assert_eq!(stats.evicted, inserts.saturating_sub(capacity) as u64);

        // Newest records survive, oldest first
        let paths: Vec<String> = buffer.snapshot().iter().map(|r| r.path.clone()).collect();
        let expected: Vec<String> = (inserts.saturating_sub(capacity)..inserts)
            .map(|i| format!("/v1/{i}"))
            .collect();
        prop_assert_eq!(paths, expected);
    }
}

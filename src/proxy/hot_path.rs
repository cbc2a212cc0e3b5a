//! Forwarding engine: classify, capture and forward one exchange
//!
//! Captured exchanges buffer the request body up to `max_request_bytes` and
//! forward the identical bytes. A larger body is forwarded as the buffered
//! prefix followed by the rest of the stream, and only the prefix is captured.
//! Response bodies are teed through [`CapturingBody`]. Everything else streams
//! straight through.

use crate::capture::body::{self, BodyAccumulator, BodyKind};
use crate::capture::{trace_context, CaptureRecorder, HeaderRedactor, PendingCapture};
use crate::providers::{
    Classification, NormalizedRequest, PassthroughPolicy, ProviderMatch, ProviderRegistry,
};
use crate::proxy::client::{build_client, HttpsClient};
use crate::proxy::error_response::ErrorResponseExt;
use crate::proxy::headers::{
    header_str, inbound_response_headers, outbound_request_headers, X_CAPTURE_ID,
};
use crate::proxy::streaming::{CapturingBody, ResponseCapture};
use crate::proxy::types::*;
use crate::proxy::url_resolver::UpstreamResolver;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE};
use http::request::Parts;
use http::{HeaderValue, Request, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use std::sync::Arc;
use tracing::{debug, field, info_span, warn, Instrument, Span};

/// What happens to an exchange after classification
#[derive(Debug, Clone)]
enum CaptureMode {
    /// Known provider: bodies captured
    Full(ProviderMatch),
    /// Unknown host under `passthrough: record`: metadata only
    Metadata,
    /// Unknown host under `passthrough: ignore`
    Bypass,
}

/// A request body read up to the buffering limit
enum RequestBody {
    /// The whole body fit under the limit
    Complete(Bytes),
    /// The limit was hit; `rest` has not been read yet
    Overflow { prefix: Bytes, rest: Body },
}

impl RequestBody {
    fn buffered(&self) -> &Bytes {
        match self {
            Self::Complete(bytes) | Self::Overflow { prefix: bytes, .. } => bytes,
        }
    }

    fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// The exact bytes the client sent, buffered part first
    fn into_outbound(self) -> Body {
        match self {
            Self::Complete(bytes) => Body::from(bytes),
            Self::Overflow { prefix, rest } => Body::from_stream(
                stream::once(async move { Ok::<_, axum::Error>(prefix) })
                    .chain(rest.into_data_stream()),
            ),
        }
    }
}

/// Shared, cloneable request handler for the proxy surface
#[derive(Clone)]
pub struct ForwardingEngine {
    config: Arc<ProxyConfig>,
    resolver: UpstreamResolver,
    registry: Arc<ProviderRegistry>,
    redactor: Arc<HeaderRedactor>,
    recorder: Arc<dyn CaptureRecorder>,
    client: HttpsClient<Body>,
}

impl ForwardingEngine {
    pub fn new(
        config: ProxyConfig,
        registry: Arc<ProviderRegistry>,
        recorder: Arc<dyn CaptureRecorder>,
    ) -> Self {
        let client = build_client(config.connect_timeout);
        let resolver = UpstreamResolver::new(&config);
        let redactor = Arc::new(HeaderRedactor::new(&config.redact_headers));

        Self {
            config: Arc::new(config),
            resolver,
            registry,
            redactor,
            recorder,
            client,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<dyn CaptureRecorder> {
        &self.recorder
    }

    pub fn redactor(&self) -> &HeaderRedactor {
        &self.redactor
    }

    /// Forward one exchange; never fails, errors become JSON responses
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let span = info_span!(
            "exchange",
            capture_id = field::Empty,
            provider = field::Empty,
            method = %request.method(),
            path = %request.uri().path(),
        );
        self.handle_inner(request).instrument(span).await
    }

    async fn handle_inner(&self, request: Request<Body>) -> Response {
        let (parts, body) = request.into_parts();
        let upstream = self.resolver.resolve(&parts.uri);

        let normalized = NormalizedRequest::new(
            &parts.method,
            upstream.as_ref().unwrap_or(&parts.uri),
        );
        let classification = self
            .registry
            .classify(&normalized.as_meta(Some(&parts.headers)));
        let mode = match (classification, self.config.passthrough) {
            (Classification::Provider(provider), _) => CaptureMode::Full(provider),
            (Classification::Unknown, PassthroughPolicy::Record) => CaptureMode::Metadata,
            (Classification::Unknown, PassthroughPolicy::Ignore) => CaptureMode::Bypass,
        };

        if let CaptureMode::Bypass = mode {
            return match upstream {
                Ok(uri) => self.forward_uncaptured(parts, uri, body).await,
                Err(e) => {
                    warn!(error = %e, "Cannot resolve upstream");
                    e.into_response()
                }
            };
        }

        let provider = match &mode {
            CaptureMode::Full(provider) => provider.name.as_ref().to_string(),
            _ => crate::providers::UNKNOWN_PROVIDER.to_string(),
        };
        let upstream_url = upstream
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let mut pending = PendingCapture::new(
            provider,
            parts.method.as_str(),
            parts.uri.path(),
            normalized.host.clone(),
            upstream_url,
        );
        if let CaptureMode::Metadata = mode {
            pending = pending.passthrough();
        }
        pending.request_headers = self.redactor.capture(&parts.headers);

        let span = Span::current();
        span.record("capture_id", field::display(&pending.id));
        span.record("provider", pending.provider.as_str());

        let uri = match upstream {
            Ok(uri) => uri,
            Err(e) => {
                warn!(error = %e, "Cannot resolve upstream");
                return self.fail(pending, e);
            }
        };

        match mode {
            CaptureMode::Full(provider) => self.forward_captured(parts, uri, body, pending, provider).await,
            _ => self.forward_metadata(parts, uri, body, pending).await,
        }
    }

    /// Buffer, capture and forward a known provider's exchange
    async fn forward_captured(
        &self,
        parts: Parts,
        uri: Uri,
        body: Body,
        mut pending: PendingCapture,
        provider: ProviderMatch,
    ) -> Response {
        let request_body = match self.read_body(body).await {
            Ok(request_body) => request_body,
            Err(e) => return self.fail(pending, e),
        };
        if !request_body.is_complete() {
            debug!(
                buffered = request_body.buffered().len(),
                "Request body exceeds buffer limit, streaming the rest"
            );
        }

        let limit = *self.config.max_capture_size.as_ref();
        pending.request_body = body::capture_request(
            request_body.buffered(),
            header_str(&parts.headers, CONTENT_TYPE),
            header_str(&parts.headers, CONTENT_ENCODING),
            limit,
            request_body.is_complete(),
        );
        pending.model = body::extract_model(&pending.request_body);
        pending.trace = Some(trace_context::extract(
            &parts.headers,
            pending.request_body.as_json(),
        ));

        let request = match outbound_request(&parts, uri, request_body.into_outbound()) {
            Ok(request) => request,
            Err(e) => return self.fail(pending, e),
        };
        let response = match self.send(request).await {
            Ok(response) => response,
            Err(e) => return self.fail(pending, e),
        };

        let (mut head, incoming) = response.into_parts();
        pending.status_code = Some(head.status.as_u16());
        pending.response_headers = self.redactor.capture(&head.headers);

        let kind = BodyKind::detect(
            provider.response_shape,
            header_str(&head.headers, CONTENT_TYPE),
        );
        let accumulator =
            BodyAccumulator::new(kind, header_str(&head.headers, CONTENT_ENCODING), limit);
        pending.streaming = accumulator.is_event_stream();

        head.headers = inbound_response_headers(std::mem::take(&mut head.headers));
        insert_capture_id(&mut head.headers, &pending);
        debug!(status = head.status.as_u16(), streaming = pending.streaming, "Upstream responded");

        let capture = ResponseCapture::new(pending, accumulator, Arc::clone(&self.recorder));
        Response::from_parts(head, Body::new(CapturingBody::new(incoming, capture)))
    }

    /// Stream an unknown host's exchange and record its metadata
    async fn forward_metadata(
        &self,
        parts: Parts,
        uri: Uri,
        body: Body,
        mut pending: PendingCapture,
    ) -> Response {
        let request = match outbound_request(&parts, uri, body) {
            Ok(request) => request,
            Err(e) => return self.fail(pending, e),
        };
        let response = match self.send(request).await {
            Ok(response) => response,
            Err(e) => return self.fail(pending, e),
        };

        let (mut head, incoming) = response.into_parts();
        pending.status_code = Some(head.status.as_u16());
        pending.response_headers = self.redactor.capture(&head.headers);
        head.headers = inbound_response_headers(std::mem::take(&mut head.headers));
        insert_capture_id(&mut head.headers, &pending);

        self.recorder.record(pending.finish(None, None));
        Response::from_parts(head, Body::new(incoming))
    }

    async fn forward_uncaptured(&self, parts: Parts, uri: Uri, body: Body) -> Response {
        let result = async {
            let request = outbound_request(&parts, uri, body)?;
            self.send(request).await
        }
        .await;

        match result {
            Ok(response) => {
                let (mut head, incoming) = response.into_parts();
                head.headers = inbound_response_headers(std::mem::take(&mut head.headers));
                Response::from_parts(head, Body::new(incoming))
            }
            Err(e) => {
                warn!(error = %e, "Passthrough request failed");
                e.into_response()
            }
        }
    }

    /// Buffer until the body ends or passes `max_request_bytes`
    async fn read_body(&self, mut body: Body) -> ProxyResult<RequestBody> {
        let max_size = *self.config.max_request_size.as_ref();
        let mut buffer = BytesMut::new();

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| ProxyError::RequestBody(e.to_string()))?;
            let Ok(data) = frame.into_data() else {
                continue;
            };
            buffer.extend_from_slice(&data);
            if buffer.len() > max_size {
                return Ok(RequestBody::Overflow {
                    prefix: buffer.freeze(),
                    rest: body,
                });
            }
        }

        Ok(RequestBody::Complete(buffer.freeze()))
    }

    /// Send upstream; the timeout bounds the wait for the response head only
    async fn send(&self, request: Request<Body>) -> ProxyResult<http::Response<Incoming>> {
        let timeout = self.config.request_timeout;
        tokio::time::timeout(timeout, self.client.request(request))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(timeout))?
            .map_err(|e| ProxyError::UpstreamConnection(error_chain(&e)))
    }

    /// Record a failed exchange and answer with its JSON error
    fn fail(&self, pending: PendingCapture, error: ProxyError) -> Response {
        warn!(error = %error, "Exchange failed");
        let status = error.status_code();
        let capture_id = pending.id.to_string();
        self.recorder
            .record(pending.finish(None, Some(error.record_message())));
        error
            .to_error_response()
            .with_capture_id(capture_id)
            .into_response_with_status(status)
    }
}

fn outbound_request(parts: &Parts, uri: Uri, body: Body) -> ProxyResult<Request<Body>> {
    let mut request = Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)?;
    *request.headers_mut() = outbound_request_headers(parts.headers.clone());
    Ok(request)
}

fn insert_capture_id(headers: &mut http::HeaderMap, pending: &PendingCapture) {
    if let Ok(value) = HeaderValue::from_str(&pending.id.to_string()) {
        headers.insert(X_CAPTURE_ID, value);
    }
}

/// Flatten an error and its sources into one line
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

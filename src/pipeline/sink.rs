//! Remote trace sinks

use crate::capture::record::CaptureRecord;
use crate::config::SinkSettings;
use crate::proxy::client::{build_client, HttpsClient};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Launcher-provided run id, shared by every record of one run
pub const RUN_ID_ENV: &str = "TRACERUN_RUN_ID";

/// Optional application name attached to every envelope
pub const APP_NAME_ENV: &str = "TRACERUN_APP_NAME";

const ERROR_BODY_PREVIEW: usize = 256;

/// Sink failures, split by whether a retry can help
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Network errors, timeouts, 5xx and 429
    #[error("transient sink failure: {0}")]
    Transient(String),

    /// 4xx and serialization failures
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Map a non-success HTTP status
    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
        let message = format!("HTTP {status}: {preview}");
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::Transient(message)
        } else {
            Self::Permanent(message)
        }
    }
}

/// Destination for finished capture records
#[async_trait]
pub trait TraceSink: Send + Sync + 'static {
    async fn log(&self, record: &CaptureRecord) -> Result<(), SinkError>;

    fn name(&self) -> &'static str;
}

/// Writes a one-line summary per record through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl TraceSink for TracingSink {
    async fn log(&self, record: &CaptureRecord) -> Result<(), SinkError> {
        info!(
            capture_id = %record.id,
            provider = %record.provider,
            method = %record.method,
            path = %record.path,
            status = ?record.status_code,
            latency_ms = record.latency_ms,
            model = ?record.model,
            streaming = record.streaming,
            error = ?record.error,
            "Captured exchange"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
    run_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    app: Option<&'a str>,
    record: &'a CaptureRecord,
}

/// POSTs each record as a JSON envelope to a trace store endpoint
#[derive(Clone)]
pub struct HttpTraceSink {
    client: HttpsClient<Full<Bytes>>,
    endpoint: Uri,
    api_key: Option<String>,
    project: Option<String>,
    run_id: String,
    app: Option<String>,
    timeout: Duration,
}

impl std::fmt::Debug for HttpTraceSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTraceSink")
            .field("endpoint", &self.endpoint)
            .field("project", &self.project)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl HttpTraceSink {
    pub fn new(endpoint: Uri, run_id: impl Into<String>) -> Self {
        Self {
            client: build_client(Duration::from_secs(10)),
            endpoint,
            api_key: None,
            project: None,
            run_id: run_id.into(),
            app: None,
            timeout: Duration::from_secs(30),
        }
    }

    /// Build from settings; `None` when no endpoint is configured
    pub fn from_settings(
        settings: &SinkSettings,
        run_id: impl Into<String>,
        app: Option<String>,
    ) -> crate::Result<Option<Self>> {
        let Some(endpoint) = settings.endpoint.as_deref() else {
            return Ok(None);
        };
        let endpoint: Uri = endpoint
            .parse()
            .map_err(|e| crate::Error::invalid_setting("sink.endpoint", format!("{e}")))?;

        let mut sink = Self::new(endpoint, run_id)
            .with_timeout(Duration::from_secs(settings.timeout_secs))
            .with_app(app);
        sink.api_key = settings.api_key.clone();
        sink.project = settings.project.clone();
        Ok(Some(sink))
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_app(mut self, app: Option<String>) -> Self {
        self.app = app;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn envelope<'a>(&'a self, record: &'a CaptureRecord) -> Envelope<'a> {
        Envelope {
            op: record.op_name(),
            project: self.project.as_deref(),
            run_id: &self.run_id,
            app: self.app.as_deref(),
            record,
        }
    }

    async fn send(&self, record: &CaptureRecord) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(&self.envelope(record))
            .map_err(|e| SinkError::Permanent(format!("serialization: {e}")))?;

        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(api_key) = &self.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {api_key}"));
        }
        let request = builder
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| SinkError::Permanent(format!("request: {e}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| SinkError::Transient(format!("connection: {e}")))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();

        if status.is_success() {
            debug!(capture_id = %record.id, %status, "Record delivered");
            Ok(())
        } else {
            Err(SinkError::from_status(
                status,
                &String::from_utf8_lossy(&body),
            ))
        }
    }
}

#[async_trait]
impl TraceSink for HttpTraceSink {
    async fn log(&self, record: &CaptureRecord) -> Result<(), SinkError> {
        tokio::time::timeout(self.timeout, self.send(record))
            .await
            .map_err(|_| SinkError::Transient(format!("timed out after {:?}", self.timeout)))?
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

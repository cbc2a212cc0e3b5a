//! Unified error responses for the proxy and dashboard surfaces

use crate::proxy::headers::X_CAPTURE_ID;
use crate::proxy::types::ProxyError;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Unique error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Capture id, when the failed exchange was recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            capture_id: None,
        }
    }

    pub fn with_capture_id(mut self, capture_id: impl Into<String>) -> Self {
        self.capture_id = Some(capture_id.into());
        self
    }

    /// Convert to HTTP response, echoing the capture id as a header
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let capture_id = self.capture_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = capture_id {
            if let Ok(value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(X_CAPTURE_ID, value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    fn to_error_response(&self) -> ErrorResponse;

    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        use ProxyError::*;

        match self {
            RequestBody(msg) => ErrorResponse::new("INVALID_REQUEST_BODY", msg.clone()),
            UpstreamTimeout(duration) => ErrorResponse::new(
                "UPSTREAM_TIMEOUT",
                format!("Upstream did not respond within {duration:?}"),
            ),
            UpstreamConnection(msg) => ErrorResponse::new(
                "UPSTREAM_CONNECTION_FAILED",
                format!("Upstream connection failed: {msg}"),
            ),
            InvalidUpstream(msg) => {
                ErrorResponse::new("INVALID_UPSTREAM", format!("Invalid upstream target: {msg}"))
            }
            MethodNotAllowed(method) => ErrorResponse::new(
                "METHOD_NOT_ALLOWED",
                format!("{method} requires proxy-all mode"),
            ),
            HttpError(e) => ErrorResponse::new("HTTP_ERROR", format!("HTTP error: {e}")),
            Internal(msg) => ErrorResponse::new("INTERNAL_ERROR", msg.clone()),
        }
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            RequestBody(_) => StatusCode::BAD_REQUEST,
            UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            UpstreamConnection(_) | InvalidUpstream(_) => StatusCode::BAD_GATEWAY,
            MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            HttpError(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        self.to_error_response().into_response_with_status(status)
    }
}

/// Create an error response for common HTTP errors
pub fn standard_error_response(status: StatusCode) -> Response {
    let (code, message) = match status {
        StatusCode::NOT_FOUND => ("NOT_FOUND", "Resource not found"),
        StatusCode::METHOD_NOT_ALLOWED => ("METHOD_NOT_ALLOWED", "Method not allowed"),
        StatusCode::INTERNAL_SERVER_ERROR => ("INTERNAL_ERROR", "Internal server error"),
        StatusCode::BAD_GATEWAY => ("BAD_GATEWAY", "Upstream service error"),
        StatusCode::GATEWAY_TIMEOUT => ("GATEWAY_TIMEOUT", "Upstream service timeout"),
        _ => ("ERROR", "An error occurred"),
    };

    ErrorResponse::new(code, message).into_response_with_status(status)
}

//! Type definitions for the proxy module

use crate::config::Settings;
use crate::providers::{PassthroughPolicy, ProviderConfigFile};
use nutype::nutype;
use std::time::Duration;
use thiserror::Error;

/// Maximum size of a buffered request body in bytes
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0)
)]
pub struct RequestSizeLimit(usize);

/// Maximum number of body bytes copied into a record
#[nutype(
    derive(Clone, Copy, Debug, Display, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |size: &usize| *size > 0)
)]
pub struct CaptureSizeLimit(usize);

/// Absolute http(s) base URL of an upstream
#[nutype(
    sanitize(trim),
    derive(Clone, Debug, Display, PartialEq, Eq, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://"))
)]
pub struct TargetUrl(String);

/// Base used when neither an original nor an explicit upstream is configured
pub const DEFAULT_UPSTREAM: &str = "https://api.openai.com/v1";

/// Forwarding engine configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub max_request_size: RequestSizeLimit,
    pub max_capture_size: CaptureSizeLimit,
    /// Bounds the wait for the upstream response head
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Accept CONNECT and absolute-form targets for arbitrary hosts
    pub proxy_all: bool,
    pub passthrough: PassthroughPolicy,
    pub original_base_url: Option<TargetUrl>,
    pub upstream_base_url: Option<TargetUrl>,
    pub redact_headers: Vec<String>,
}

impl ProxyConfig {
    pub fn from_settings(settings: &Settings, providers: &ProviderConfigFile) -> ProxyResult<Self> {
        let proxy = &settings.proxy;
        let target = |field: &str, value: &Option<String>| {
            value
                .as_ref()
                .map(|url| {
                    TargetUrl::try_new(url.clone())
                        .map_err(|e| ProxyError::InvalidUpstream(format!("{field} '{url}': {e}")))
                })
                .transpose()
        };

        Ok(Self {
            max_request_size: RequestSizeLimit::try_new(proxy.max_request_bytes)
                .map_err(|e| ProxyError::Internal(format!("max_request_bytes: {e}")))?,
            max_capture_size: CaptureSizeLimit::try_new(proxy.max_capture_bytes)
                .map_err(|e| ProxyError::Internal(format!("max_capture_bytes: {e}")))?,
            request_timeout: settings.request_timeout(),
            connect_timeout: settings.connect_timeout(),
            proxy_all: proxy.proxy_all,
            passthrough: providers.passthrough,
            original_base_url: target("original_base_url", &proxy.original_base_url)?,
            upstream_base_url: target("upstream_base_url", &proxy.upstream_base_url)?,
            redact_headers: providers.redact_headers.clone(),
        })
    }
}

/// Errors that can occur on the proxied path
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("Upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream connection failed: {0}")]
    UpstreamConnection(String),

    #[error("Invalid upstream target: {0}")]
    InvalidUpstream(String),

    #[error("Method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] http::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Message stored on the capture record
    pub fn record_message(&self) -> String {
        self.to_string()
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_default_settings() {
        let config =
            ProxyConfig::from_settings(&Settings::default(), &ProviderConfigFile::default())
                .unwrap();
        assert_eq!(*config.max_request_size.as_ref(), 64 * 1024 * 1024);
        assert_eq!(config.passthrough, PassthroughPolicy::Ignore);
        assert!(config.original_base_url.is_none());
    }

    #[test]
    fn test_invalid_upstream_is_rejected() {
        let mut settings = Settings::default();
        settings.proxy.upstream_base_url = Some("api.example.com".to_string());
        let err = ProxyConfig::from_settings(&settings, &ProviderConfigFile::default())
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidUpstream(_)));
    }

    #[test]
    fn test_zero_limits_are_rejected() {
        assert!(RequestSizeLimit::try_new(0).is_err());
        assert!(CaptureSizeLimit::try_new(0).is_err());
    }

    #[test]
    fn test_target_url_is_trimmed() {
        let url = TargetUrl::try_new("  https://api.example.com ".to_string()).unwrap();
        assert_eq!(url.as_ref(), "https://api.example.com");
    }
}

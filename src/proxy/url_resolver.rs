//! Upstream target resolution for proxied requests

use crate::proxy::types::*;
use hyper::Uri;

/// Picks the upstream for each inbound request
///
/// Absolute-form targets (an HTTP proxy client in proxy-all mode) go to their
/// own authority. Everything else is joined onto a base: the child's preserved
/// original base URL, then the configured upstream base, then the default.
#[derive(Clone, Debug)]
pub struct UpstreamResolver {
    base: String,
    proxy_all: bool,
}

impl UpstreamResolver {
    pub fn new(config: &ProxyConfig) -> Self {
        let base = config
            .original_base_url
            .as_ref()
            .or(config.upstream_base_url.as_ref())
            .map(|url| url.as_ref().to_string())
            .unwrap_or_else(|| DEFAULT_UPSTREAM.to_string());

        Self {
            base: base.trim_end_matches('/').to_string(),
            proxy_all: config.proxy_all,
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Resolve the outgoing URI for an inbound request target
    pub fn resolve(&self, original: &Uri) -> ProxyResult<Uri> {
        if original.scheme().is_some() && original.authority().is_some() {
            if !self.proxy_all {
                return Err(ProxyError::InvalidUpstream(format!(
                    "absolute-form target {original} requires proxy-all mode"
                )));
            }
            return Ok(original.clone());
        }

        let path_and_query = original
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let joined = if path_and_query.starts_with('/') {
            format!("{}{path_and_query}", self.base)
        } else {
            format!("{}/{path_and_query}", self.base)
        };

        let uri: Uri = joined
            .parse()
            .map_err(|e| ProxyError::InvalidUpstream(format!("'{joined}': {e}")))?;
        if uri.authority().is_none() {
            return Err(ProxyError::InvalidUpstream(format!("'{joined}' has no host")));
        }
        Ok(uri)
    }
}

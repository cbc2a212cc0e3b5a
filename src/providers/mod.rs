//! Provider signatures and request classification
//!
//! The registry is an ordered list of [`ProviderSignature`]s built once at
//! startup from the built-in table and the user's provider config. Lookups are
//! pure: the same request metadata against the same registry always yields the
//! same [`Classification`], and the first matching signature wins.
//!
//! A signature that defines both path and host patterns matches only when a
//! path pattern **and** a host pattern hit. Signatures with a single pattern
//! set match on that set alone.

pub mod builtin;
pub mod config_file;

use derive_more::Display;
use nutype::nutype;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use config_file::{PassthroughPolicy, ProviderConfigFile, SignatureSpec};

/// Name reported for every request when capture-all mode is on
pub const CAPTURE_ALL_PROVIDER: &str = "custom";

/// Name reported for passthrough records
pub const UNKNOWN_PROVIDER: &str = "unknown";

/// Unique provider signature name
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRef)
)]
pub struct ProviderName(String);

/// Strategy used to turn a captured response body into a record payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// Decide from the response `content-type`
    #[default]
    #[display("auto")]
    Auto,
    #[display("json")]
    Json,
    #[display("event_stream")]
    EventStream,
    /// Keep the bytes, never parse
    #[display("raw")]
    Raw,
}

/// Errors raised while building the registry
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid provider name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("provider '{name}' has neither path nor host patterns")]
    NoPatterns { name: String },

    #[error("provider '{name}' has malformed regex '{pattern}': {source}")]
    InvalidRegex {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("provider config file {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: config::ConfigError,
    },
}

#[derive(Debug, Clone)]
enum PathMatcher {
    Suffix(String),
    Regex(Regex),
}

impl PathMatcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            Self::Suffix(suffix) => path.ends_with(suffix.as_str()),
            Self::Regex(regex) => regex.is_match(path),
        }
    }
}

#[derive(Debug, Clone)]
enum HostMatcher {
    /// Exact host or dot-separated domain suffix, case-insensitive
    Domain(String),
    Regex(Regex),
}

impl HostMatcher {
    fn matches(&self, host: &str) -> bool {
        match self {
            Self::Domain(domain) => {
                // Compare without the port unless the pattern names one
                let candidate = if domain.contains(':') {
                    host
                } else {
                    strip_port(host)
                };
                candidate == domain || candidate.ends_with(&format!(".{domain}"))
            }
            Self::Regex(regex) => regex.is_match(host),
        }
    }
}

/// A compiled, immutable provider signature
#[derive(Debug, Clone)]
pub struct ProviderSignature {
    name: ProviderName,
    path_patterns: Vec<PathMatcher>,
    host_patterns: Vec<HostMatcher>,
    is_regex: bool,
    response_shape: ResponseShape,
}

impl ProviderSignature {
    /// Compile a signature, failing on an invalid name or malformed regex
    pub fn compile(spec: &SignatureSpec) -> Result<Self, ProviderError> {
        let name =
            ProviderName::try_new(spec.name.clone()).map_err(|e| ProviderError::InvalidName {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        if spec.path_patterns.is_empty() && spec.host_patterns.is_empty() {
            return Err(ProviderError::NoPatterns {
                name: spec.name.clone(),
            });
        }

        let compile_regex = |pattern: &str| {
            RegexBuilder::new(pattern)
                .build()
                .map_err(|source| ProviderError::InvalidRegex {
                    name: spec.name.clone(),
                    pattern: pattern.to_string(),
                    source,
                })
        };

        let path_patterns = spec
            .path_patterns
            .iter()
            .map(|pattern| {
                if spec.is_regex {
                    compile_regex(pattern).map(PathMatcher::Regex)
                } else {
                    Ok(PathMatcher::Suffix(normalize_path(pattern)))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let host_patterns = spec
            .host_patterns
            .iter()
            .map(|pattern| {
                if spec.is_regex {
                    RegexBuilder::new(pattern)
                        .case_insensitive(true)
                        .build()
                        .map(HostMatcher::Regex)
                        .map_err(|source| ProviderError::InvalidRegex {
                            name: spec.name.clone(),
                            pattern: pattern.clone(),
                            source,
                        })
                } else {
                    Ok(HostMatcher::Domain(pattern.trim().to_ascii_lowercase()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name,
            path_patterns,
            host_patterns,
            is_regex: spec.is_regex,
            response_shape: spec.response_shape,
        })
    }

    pub fn name(&self) -> &ProviderName {
        &self.name
    }

    pub fn response_shape(&self) -> ResponseShape {
        self.response_shape
    }

    pub fn is_regex(&self) -> bool {
        self.is_regex
    }

    fn matches_path(&self, path: &str) -> bool {
        self.path_patterns.iter().any(|m| m.matches(path))
    }

    fn matches_host(&self, host: &str) -> bool {
        self.host_patterns.iter().any(|m| m.matches(host))
    }

    /// Apply the match semantics described in the module docs
    pub fn matches(&self, request: &RequestMeta<'_>) -> bool {
        let has_paths = !self.path_patterns.is_empty();
        let has_hosts = !self.host_patterns.is_empty();
        let host_known = !request.host.is_empty();

        match (has_paths, has_hosts) {
            (true, true) => {
                self.matches_path(request.path) && (!host_known || self.matches_host(request.host))
            }
            (true, false) => self.matches_path(request.path),
            (false, true) => host_known && self.matches_host(request.host),
            (false, false) => false,
        }
    }
}

/// Normalized request metadata used for classification
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    pub method: &'a str,
    /// Lower-cased host, optionally with `:port`
    pub host: &'a str,
    /// Path with a leading slash and no query string
    pub path: &'a str,
    pub headers: Option<&'a http::HeaderMap>,
}

/// Owned variant of [`RequestMeta`], built from a URI
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub method: String,
    pub host: String,
    pub path: String,
}

impl NormalizedRequest {
    pub fn new(method: &http::Method, uri: &http::Uri) -> Self {
        let host = uri
            .authority()
            .map(|authority| authority.as_str().to_ascii_lowercase())
            .unwrap_or_default();

        Self {
            method: method.as_str().to_string(),
            host,
            path: normalize_path(uri.path()),
        }
    }

    pub fn as_meta<'a>(&'a self, headers: Option<&'a http::HeaderMap>) -> RequestMeta<'a> {
        RequestMeta {
            method: &self.method,
            host: &self.host,
            path: &self.path,
            headers,
        }
    }
}

/// A successful classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMatch {
    pub name: ProviderName,
    pub response_shape: ResponseShape,
}

/// Outcome of [`ProviderRegistry::classify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Provider(ProviderMatch),
    Unknown,
}

impl Classification {
    pub fn provider_name(&self) -> &str {
        match self {
            Self::Provider(m) => m.name.as_ref(),
            Self::Unknown => UNKNOWN_PROVIDER,
        }
    }
}

/// Ordered, immutable set of provider signatures
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    signatures: Vec<ProviderSignature>,
    capture_all: Option<ProviderMatch>,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from compiled signatures, keeping their order
    pub fn from_signatures(signatures: Vec<ProviderSignature>) -> Self {
        Self {
            signatures,
            capture_all: None,
        }
    }

    /// Merge built-ins with the user's config and compile everything
    ///
    /// User entries replace built-ins of the same name. Ordering is user
    /// entries first unless `user_providers_first` is false. Disabled names
    /// are removed last.
    pub fn build(config: &ProviderConfigFile) -> Result<Self, ProviderError> {
        let user_names: HashSet<&str> = config.providers.iter().map(|s| s.name.trim()).collect();

        let builtins: Vec<SignatureSpec> = if config.include_builtins {
            builtin::builtin_specs()
                .into_iter()
                .filter(|spec| !user_names.contains(spec.name.as_str()))
                .collect()
        } else {
            Vec::new()
        };

        let ordered: Vec<&SignatureSpec> = if config.user_providers_first {
            config.providers.iter().chain(builtins.iter()).collect()
        } else {
            builtins.iter().chain(config.providers.iter()).collect()
        };

        let disabled: HashSet<&str> = config
            .disable_providers
            .iter()
            .map(|name| name.trim())
            .collect();

        let mut seen = HashSet::new();
        let mut signatures = Vec::with_capacity(ordered.len());
        for spec in ordered {
            if disabled.contains(spec.name.trim()) {
                continue;
            }
            // Names are unique; a later duplicate never shadows an earlier entry
            if !seen.insert(spec.name.trim().to_string()) {
                continue;
            }
            signatures.push(ProviderSignature::compile(spec)?);
        }

        let registry = Self::from_signatures(signatures);
        if config.capture_all_requests {
            registry.with_capture_all()
        } else {
            Ok(registry)
        }
    }

    /// Classify every request as [`CAPTURE_ALL_PROVIDER`]
    pub fn with_capture_all(mut self) -> Result<Self, ProviderError> {
        let name = ProviderName::try_new(CAPTURE_ALL_PROVIDER.to_string()).map_err(|e| {
            ProviderError::InvalidName {
                name: CAPTURE_ALL_PROVIDER.to_string(),
                reason: e.to_string(),
            }
        })?;
        self.capture_all = Some(ProviderMatch {
            name,
            response_shape: ResponseShape::Auto,
        });
        Ok(self)
    }

    /// Classify a request; first matching signature wins
    pub fn classify(&self, request: &RequestMeta<'_>) -> Classification {
        if let Some(capture_all) = &self.capture_all {
            return Classification::Provider(capture_all.clone());
        }

        self.signatures
            .iter()
            .find(|signature| signature.matches(request))
            .map(|signature| {
                Classification::Provider(ProviderMatch {
                    name: signature.name.clone(),
                    response_shape: signature.response_shape,
                })
            })
            .unwrap_or(Classification::Unknown)
    }

    pub fn names(&self) -> impl Iterator<Item = &ProviderName> {
        self.signatures.iter().map(|s| &s.name)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Leading slash, no query string
pub fn normalize_path(path: &str) -> String {
    let without_query = path.split('?').next().unwrap_or_default();
    if without_query.starts_with('/') {
        without_query.to_string()
    } else {
        format!("/{without_query}")
    }
}

fn strip_port(host: &str) -> &str {
    // IPv6 literals keep their brackets
    if host.starts_with('[') {
        return host.split(']').next().map_or(host, |h| &host[..h.len() + 1]);
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(h, _)| h)
}

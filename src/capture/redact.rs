//! Header capture with secret redaction

use super::record::CapturedHeaders;
use http::HeaderMap;
use std::collections::btree_map::Entry;
use std::collections::HashSet;

pub const REDACTED: &str = "[REDACTED]";

/// Headers never stored in clear text
pub const DEFAULT_REDACTED_HEADERS: &[&str] = &[
    "authorization",
    "proxy-authorization",
    "x-api-key",
    "api-key",
    "x-goog-api-key",
    "cookie",
    "set-cookie",
];

#[derive(Debug, Clone)]
pub struct HeaderRedactor {
    names: HashSet<String>,
}

impl Default for HeaderRedactor {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

impl HeaderRedactor {
    /// Default list plus `extra` names (case-insensitive)
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names = DEFAULT_REDACTED_HEADERS
            .iter()
            .map(|name| (*name).to_string())
            .chain(
                extra
                    .into_iter()
                    .map(|name| name.as_ref().trim().to_ascii_lowercase()),
            )
            .filter(|name| !name.is_empty())
            .collect();
        Self { names }
    }

    pub fn is_redacted(&self, name: &str) -> bool {
        self.names.contains(&name.to_ascii_lowercase())
    }

    /// Copy headers for a record, masking secrets
    pub fn capture(&self, headers: &HeaderMap) -> CapturedHeaders {
        let mut captured = CapturedHeaders::new();
        for (name, value) in headers {
            let value = if self.is_redacted(name.as_str()) {
                REDACTED.to_string()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            match captured.entry(name.as_str().to_string()) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) if slot.get() != REDACTED => {
                    let existing = slot.get_mut();
                    existing.push_str(", ");
                    existing.push_str(&value);
                }
                Entry::Occupied(_) => {}
            }
        }
        captured
    }
}

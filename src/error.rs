use crate::providers::ProviderError;
use crate::proxy::ProxyError;
use thiserror::Error;

/// tracerun application error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Provider configuration error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Proxy configuration error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No free port found (tried {start}-{end})")]
    NoFreePort { start: u16, end: u32 },

    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: String, reason: String },

    #[error("Application error: {0}")]
    Application(String),
}

impl Error {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    pub fn invalid_setting(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

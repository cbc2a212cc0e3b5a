use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Environment variable a launcher sets to preserve the child's own base URL.
pub const ORIGINAL_BASE_URL_ENV: &str = "TRACERUN_ORIGINAL_OPENAI_BASE_URL";

/// Explicit upstream override used when no original base URL was preserved.
pub const UPSTREAM_BASE_ENV: &str = "TRACERUN_UPSTREAM_BASE";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub proxy: ProxySettings,
    pub dashboard: DashboardSettings,
    pub pipeline: PipelineSettings,
    pub sink: SinkSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProxySettings {
    pub host: String,
    /// First port tried; the proxy walks upwards until one is free.
    pub port: u16,
    pub port_search_attempts: u16,
    pub upstream_base_url: Option<String>,
    pub original_base_url: Option<String>,
    pub proxy_all: bool,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_request_bytes: usize,
    pub max_capture_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DashboardSettings {
    pub buffer_capacity: usize,
    /// Serve the dashboard on its own port in addition to the reserved prefix.
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub shutdown_grace_ms: u64,
    pub warn_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkSettings {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub project: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy: ProxySettings {
                host: "127.0.0.1".to_string(),
                port: 7777,
                port_search_attempts: 100,
                upstream_base_url: None,
                original_base_url: None,
                proxy_all: false,
                request_timeout_secs: 90,
                connect_timeout_secs: 10,
                max_request_bytes: 64 * 1024 * 1024,
                max_capture_bytes: 4 * 1024 * 1024,
            },
            dashboard: DashboardSettings {
                buffer_capacity: 200,
                port: None,
            },
            pipeline: PipelineSettings {
                queue_capacity: 1000,
                workers: 2,
                max_attempts: 3,
                initial_backoff_ms: 200,
                max_backoff_ms: 5_000,
                shutdown_grace_ms: 5_000,
                warn_interval_secs: 30,
            },
            sink: SinkSettings {
                endpoint: None,
                api_key: None,
                project: None,
                timeout_secs: 30,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .add_source(Config::try_from(&Settings::default())?)
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(
                Environment::with_prefix("TRACERUN")
                    .separator("__")
                    .try_parsing(true),
            )
            // The launcher's env contract wins over everything else
            .set_override_option("proxy.original_base_url", non_empty_env(ORIGINAL_BASE_URL_ENV))?
            .set_override_option("proxy.upstream_base_url", non_empty_env(UPSTREAM_BASE_ENV))?
            .build()?;

        config.try_deserialize()
    }

    /// Reject values that would make the proxy unusable before anything binds.
    pub fn validate(&self) -> crate::Result<()> {
        if self.dashboard.buffer_capacity == 0 {
            return Err(crate::Error::invalid_setting(
                "dashboard.buffer_capacity",
                "must be greater than zero",
            ));
        }
        if self.pipeline.queue_capacity == 0 {
            return Err(crate::Error::invalid_setting(
                "pipeline.queue_capacity",
                "must be greater than zero",
            ));
        }
        if self.pipeline.workers == 0 {
            return Err(crate::Error::invalid_setting(
                "pipeline.workers",
                "must be greater than zero",
            ));
        }
        if self.pipeline.max_attempts == 0 {
            return Err(crate::Error::invalid_setting(
                "pipeline.max_attempts",
                "must be at least one",
            ));
        }
        for (field, url) in [
            ("proxy.original_base_url", &self.proxy.original_base_url),
            ("proxy.upstream_base_url", &self.proxy.upstream_base_url),
            ("sink.endpoint", &self.sink.endpoint),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(crate::Error::invalid_setting(
                        field,
                        format!("'{url}' is not an http(s) URL"),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy.connect_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.pipeline.shutdown_grace_ms)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_can_be_loaded() {
        let settings = Settings::new();
        assert!(settings.is_ok());
    }

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.dashboard.buffer_capacity, 200);
        assert_eq!(settings.proxy.host, "127.0.0.1");
        assert_eq!(settings.request_timeout(), Duration::from_secs(90));
    }

    #[test]
    fn test_zero_buffer_capacity_is_rejected() {
        let mut settings = Settings::default();
        settings.dashboard.buffer_capacity = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("dashboard.buffer_capacity"));
    }

    #[test]
    fn test_non_http_upstream_is_rejected() {
        let mut settings = Settings::default();
        settings.proxy.upstream_base_url = Some("ftp://example.com".to_string());
        assert!(settings.validate().is_err());
    }
}

//! User provider config (`tracerun.config.yaml`)

use super::{ProviderError, ResponseShape};
use config::{Config, File, FileFormat};
use serde::{Deserialize, Deserializer, Serialize};
use std::env;
use std::path::{Path, PathBuf};

/// Explicit config file location
pub const CONFIG_PATH_ENV: &str = "TRACERUN_CONFIG";

/// Forces debug mode when set to `1`, `true` or `yes`
pub const DEBUG_ENV: &str = "TRACERUN_DEBUG";

pub const CONFIG_FILE_NAME: &str = "tracerun.config.yaml";
pub const HOME_CONFIG_FILE_NAME: &str = ".tracerun.config.yaml";

/// What happens to requests no signature claims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassthroughPolicy {
    /// Forward without creating a record
    #[default]
    Ignore,
    /// Forward and create a metadata-only record
    Record,
}

/// A provider signature as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureSpec {
    pub name: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub path_patterns: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub host_patterns: Vec<String>,
    #[serde(default = "default_is_regex")]
    pub is_regex: bool,
    #[serde(default)]
    pub response_shape: ResponseShape,
}

fn default_is_regex() -> bool {
    true
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(pattern)) => vec![pattern],
        Some(OneOrMany::Many(patterns)) => patterns,
        None => Vec::new(),
    })
}

/// Parsed provider config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfigFile {
    pub providers: Vec<SignatureSpec>,
    pub disable_providers: Vec<String>,
    pub user_providers_first: bool,
    pub include_builtins: bool,
    pub capture_all_requests: bool,
    pub passthrough: PassthroughPolicy,
    pub redact_headers: Vec<String>,
    /// Observe traffic without shipping records to the remote sink
    pub debug: bool,
    /// Where this config came from, if a file was found
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for ProviderConfigFile {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            disable_providers: Vec::new(),
            user_providers_first: true,
            include_builtins: true,
            capture_all_requests: false,
            passthrough: PassthroughPolicy::default(),
            redact_headers: Vec::new(),
            debug: false,
            source: None,
        }
    }
}

impl ProviderConfigFile {
    /// Load from the first location that exists, falling back to defaults
    ///
    /// Search order: `$TRACERUN_CONFIG`, `./tracerun.config.yaml`,
    /// `~/.tracerun.config.yaml`. `TRACERUN_DEBUG` is applied last.
    pub fn load() -> Result<Self, ProviderError> {
        let found = discover(
            env::var_os(CONFIG_PATH_ENV).map(PathBuf::from),
            Path::new("."),
            dirs::home_dir(),
        );

        let mut config = match found {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };

        if env::var(DEBUG_ENV).is_ok_and(|value| is_truthy(&value)) {
            config.debug = true;
        }

        Ok(config)
    }

    /// Parse a YAML config file
    pub fn from_path(path: &Path) -> Result<Self, ProviderError> {
        let to_error = |source| ProviderError::ConfigFile {
            path: path.display().to_string(),
            source,
        };

        let path_str = path.to_string_lossy();
        let mut config: Self = Config::builder()
            .add_source(File::new(&path_str, FileFormat::Yaml))
            .build()
            .and_then(Config::try_deserialize)
            .map_err(to_error)?;

        config.source = Some(path.to_path_buf());
        Ok(config)
    }
}

/// First existing candidate among env path, working directory and home
pub fn discover(env_path: Option<PathBuf>, cwd: &Path, home: Option<PathBuf>) -> Option<PathBuf> {
    let candidates = [
        env_path,
        Some(cwd.join(CONFIG_FILE_NAME)),
        home.map(|home| home.join(HOME_CONFIG_FILE_NAME)),
    ];

    candidates.into_iter().flatten().find(|path| path.is_file())
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

//! TOML Configuration File Support
//!
//! This module provides centralized configuration loading for the client,
//! supporting a TOML configuration file at `~/.config/medqa/client.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (when applicable)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file follows XDG Base Directory specification:
//! - `$XDG_CONFIG_HOME/medqa/client.toml` (typically `~/.config/medqa/client.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! base_url = "http://127.0.0.1:8000"
//! connect_timeout_ms = 10000
//!
//! [stream]
//! idle_timeout_secs = 120      # 0 disables the idle timeout
//! trailing_line = "discard"    # or "emit"
//!
//! [model]
//! source = "local"             # or "siliconflow"
//! name = "qwen2.5:7b"
//! api_key = "sk-..."
//!
//! [graph]
//! password = "..."
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{ModelSource, DEFAULT_CONNECT_TIMEOUT};
use crate::protocol::TrailingLinePolicy;
use crate::selection::ModelSelection;
use crate::session::SessionConfig;

/// Default answer service address
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Answer service base URL
    pub base_url: Option<String>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Stream section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamToml {
    /// Idle timeout in seconds (0 = no timeout)
    pub idle_timeout_secs: Option<u64>,

    /// `discard` or `emit`
    pub trailing_line: Option<String>,
}

/// Model section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelToml {
    /// `local` or `siliconflow`
    pub source: Option<String>,

    /// Model name within the source
    pub name: Option<String>,

    /// SiliconFlow API key
    pub api_key: Option<String>,
}

/// Graph database section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphToml {
    /// Graph database password
    pub password: Option<String>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Stream configuration section
    pub stream: StreamToml,

    /// Model configuration section
    pub model: ModelToml,

    /// Graph database configuration section
    pub graph: GraphToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the client
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Answer service base URL
    pub base_url: String,

    /// Connect timeout for the HTTP client
    pub connect_timeout: Duration,

    /// Stream session tunables
    pub session: SessionConfig,

    /// Initial model selection and credentials
    pub selection: ModelSelection,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            session: SessionConfig::default(),
            selection: ModelSelection::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/medqa/client.toml` or
/// `~/.config/medqa/client.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("medqa").join("client.toml"))
}

/// Load configuration from all sources with proper priority
///
/// Priority order (highest first):
/// 1. CLI arguments (not handled here - caller should apply after)
/// 2. Environment variables
/// 3. TOML configuration file
/// 4. Default values
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or a value
/// is out of range. A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ClientConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ClientConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with a custom environment lookup
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ClientConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Start with defaults
    let mut config = ClientConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ClientToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config, env)?;

    Ok(config)
}

fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn parse_trailing_line(value: &str) -> Result<TrailingLinePolicy, ConfigError> {
    value.parse().map_err(ConfigError::ValidationError)
}

fn parse_model_source(value: &str) -> Result<ModelSource, ConfigError> {
    value.parse().map_err(ConfigError::ValidationError)
}

/// Keep `None` for empty strings
fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ClientConfig, toml: &ClientToml) -> Result<(), ConfigError> {
    // Server settings
    if let Some(ref url) = toml.server.base_url {
        config.base_url = url.clone();
    }
    if let Some(timeout) = toml.server.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }

    // Stream settings
    if let Some(secs) = toml.stream.idle_timeout_secs {
        config.session.idle_timeout = idle_timeout_from_secs(secs);
    }
    if let Some(ref policy) = toml.stream.trailing_line {
        config.session.trailing_line = parse_trailing_line(policy)?;
    }

    // Model settings
    if let Some(ref source) = toml.model.source {
        config.selection.source = parse_model_source(source)?;
    }
    if let Some(ref name) = toml.model.name {
        config.selection.model_name = non_empty(name);
    }
    if let Some(ref key) = toml.model.api_key {
        config.selection.api_key = non_empty(key);
    }

    // Graph settings
    if let Some(ref password) = toml.graph.password {
        config.selection.graph_password = non_empty(password);
    }

    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ClientConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    // Server settings from environment
    if let Some(url) = env("MEDQA_BASE_URL") {
        config.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("MEDQA_CONNECT_TIMEOUT_MS") {
        if let Ok(ms) = timeout.parse::<u64>() {
            config.connect_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }

    // Stream settings from environment
    if let Some(timeout) = env("MEDQA_IDLE_TIMEOUT_SECS") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.session.idle_timeout = idle_timeout_from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(policy) = env("MEDQA_TRAILING_LINE") {
        config.session.trailing_line = parse_trailing_line(&policy)?;
        config.source = ConfigSource::Env;
    }

    // Model settings from environment
    if let Some(source) = env("MEDQA_MODEL_SOURCE") {
        config.selection.source = parse_model_source(&source)?;
        config.source = ConfigSource::Env;
    }
    if let Some(model) = env("MEDQA_MODEL") {
        config.selection.model_name = non_empty(&model);
        config.source = ConfigSource::Env;
    }
    if let Some(key) = env("SILICONFLOW_API_KEY") {
        config.selection.api_key = non_empty(&key);
        config.source = ConfigSource::Env;
    }

    // Graph settings from environment
    if let Some(password) = env("MEDQA_GRAPH_PASSWORD") {
        config.selection.graph_password = non_empty(&password);
        config.source = ConfigSource::Env;
    }

    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Base URL override
    pub base_url: Option<String>,

    /// Idle timeout override (seconds, 0 disables)
    pub idle_timeout_secs: Option<u64>,

    /// Model source override
    pub model_source: Option<ModelSource>,

    /// Model name override
    pub model: Option<String>,

    /// API key override
    pub api_key: Option<String>,

    /// Graph password override
    pub graph_password: Option<String>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URL override
    #[must_use]
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = Some(url);
        self
    }

    /// Set idle timeout override
    #[must_use]
    pub fn with_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.idle_timeout_secs = Some(secs);
        self
    }

    /// Set model source override
    #[must_use]
    pub fn with_model_source(mut self, source: ModelSource) -> Self {
        self.model_source = Some(source);
        self
    }

    /// Set model name override
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Set API key override
    #[must_use]
    pub fn with_api_key(mut self, key: String) -> Self {
        self.api_key = Some(key);
        self
    }

    /// Set graph password override
    #[must_use]
    pub fn with_graph_password(mut self, password: String) -> Self {
        self.graph_password = Some(password);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ClientConfig) {
        if self.base_url.is_some()
            || self.idle_timeout_secs.is_some()
            || self.model_source.is_some()
            || self.model.is_some()
            || self.api_key.is_some()
            || self.graph_password.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref url) = self.base_url {
            config.base_url = url.clone();
        }

        if let Some(secs) = self.idle_timeout_secs {
            config.session.idle_timeout = idle_timeout_from_secs(secs);
        }

        if let Some(source) = self.model_source {
            config.selection.source = source;
        }

        if let Some(ref model) = self.model {
            config.selection.model_name = non_empty(model);
        }

        if let Some(ref key) = self.api_key {
            config.selection.api_key = non_empty(key);
        }

        if let Some(ref password) = self.graph_password {
            config.selection.graph_password = non_empty(password);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn toml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();

        assert_eq!(config.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.session.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.session.trailing_line, TrailingLinePolicy::Discard);
        assert_eq!(config.selection.source, ModelSource::Local);
        assert_eq!(config.selection.model_name, None);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        // Should return Some path (depends on environment)
        if let Some(p) = path {
            assert!(p.to_string_lossy().contains("medqa"));
            assert!(p.to_string_lossy().contains("client.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = toml_file(
            r#"
[server]
base_url = "http://10.0.0.5:8000"
connect_timeout_ms = 3000

[stream]
idle_timeout_secs = 30
trailing_line = "emit"

[model]
source = "siliconflow"
name = "Qwen/Qwen2.5-7B-Instruct"
api_key = "sk-file"

[graph]
password = "neo4j-secret"
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.base_url, "http://10.0.0.5:8000");
        assert_eq!(config.connect_timeout, Duration::from_millis(3000));
        assert_eq!(config.session.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.session.trailing_line, TrailingLinePolicy::Emit);
        assert_eq!(config.selection.source, ModelSource::Siliconflow);
        assert_eq!(
            config.selection.model_name.as_deref(),
            Some("Qwen/Qwen2.5-7B-Instruct")
        );
        assert_eq!(config.selection.api_key.as_deref(), Some("sk-file"));
        assert_eq!(config.selection.graph_password.as_deref(), Some("neo4j-secret"));
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = toml_file("[stream]\nidle_timeout_secs = 0\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.session.idle_timeout, None);
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn test_missing_file_graceful() {
        let config = load_config_with_env(
            Some(PathBuf::from("/nonexistent/medqa/client.toml")),
            no_env,
        )
        .unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = toml_file("[server\nbase_url = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = toml_file("[stream]\ntrailing_line = \"keep\"\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        let result = load_config_with_env(None, env_of(&[("MEDQA_MODEL_SOURCE", "openai")]));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Priority Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = toml_file("[model]\nname = \"file-model\"\n[server]\nconnect_timeout_ms = 1000\n");
        let env = env_of(&[
            ("MEDQA_MODEL", "env-model"),
            ("MEDQA_CONNECT_TIMEOUT_MS", "not-a-number"),
            ("SILICONFLOW_API_KEY", ""),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.selection.model_name.as_deref(), Some("env-model"));
        // Unparseable numbers are ignored
        assert_eq!(config.connect_timeout, Duration::from_millis(1000));
        assert_eq!(config.selection.api_key, None);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_env() {
        let env = env_of(&[("MEDQA_BASE_URL", "http://env:8000"), ("MEDQA_MODEL", "env-model")]);
        let mut config = load_config_with_env(None, env).unwrap();

        ConfigOverrides::new()
            .with_base_url("http://cli:8000".to_string())
            .with_model_source(ModelSource::Siliconflow)
            .with_idle_timeout_secs(0)
            .apply(&mut config);

        assert_eq!(config.base_url, "http://cli:8000");
        assert_eq!(config.selection.source, ModelSource::Siliconflow);
        assert_eq!(config.selection.model_name.as_deref(), Some("env-model"));
        assert_eq!(config.session.idle_timeout, None);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = ClientConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}

//! Layered configuration: defaults, then an optional TOML file, then
//! `ARBITER_*` environment variables.
//!
//! ```toml
//! data_dir = "/var/lib/arbiter"
//! metrics_port = 9464
//!
//! [oracle]
//! endpoint = "https://api.openai.com"
//! model = "gpt-4o-mini"
//! timeout_ms = 8000
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::oracle::{LlmOracle, OracleAdapter};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for '{field}': {message}")]
    Validation { field: String, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// Directory holding the WAL.
    pub data_dir: PathBuf,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub oracle: OracleConfig,
    pub logging: LoggingConfig,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            oracle: OracleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Base URL of an OpenAI-compatible API. No endpoint means offline mode.
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    /// Upper bound for each oracle call, after which the fallback is used.
    pub timeout_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// HTTP oracle when an endpoint is configured, offline fallbacks otherwise.
    pub fn build_adapter(&self) -> OracleAdapter {
        match &self.endpoint {
            Some(endpoint) => {
                let oracle = LlmOracle::new(
                    endpoint.clone(),
                    self.api_key.clone(),
                    self.model.clone(),
                    self.timeout(),
                    Arc::new(reqwest::Client::new()),
                );
                OracleAdapter::new(Arc::new(oracle), self.timeout())
            }
            None => OracleAdapter::offline(),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!("invalid log format: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `arbiter::engine=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl ArbiterConfig {
    /// Load from a TOML file, or defaults when `path` is None.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply `ARBITER_*` overrides. Unparseable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = var("ARBITER_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = var("ARBITER_METRICS_PORT").and_then(|p| p.parse().ok()) {
            self.metrics_port = Some(port);
        }
        if let Some(endpoint) = var("ARBITER_ORACLE_ENDPOINT") {
            self.oracle.endpoint = Some(endpoint).filter(|e| !e.is_empty());
        }
        if let Some(key) = var("ARBITER_ORACLE_API_KEY") {
            self.oracle.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(model) = var("ARBITER_ORACLE_MODEL") {
            self.oracle.model = model;
        }
        if let Some(ms) = var("ARBITER_ORACLE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.oracle.timeout_ms = ms;
        }
        if let Some(level) = var("ARBITER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("ARBITER_LOG_FORMAT").and_then(|f| f.parse().ok()) {
            self.logging.format = format;
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation {
                field: "data_dir".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.metrics_port == Some(0) {
            return Err(ConfigError::Validation {
                field: "metrics_port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }
        if self.oracle.timeout_ms == 0 {
            return Err(ConfigError::Validation {
                field: "oracle.timeout_ms".to_string(),
                message: "timeout must be non-zero".to_string(),
            });
        }
        if let Some(endpoint) = &self.oracle.endpoint
            && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(ConfigError::Validation {
                field: "oracle.endpoint".to_string(),
                message: format!("expected an http(s) URL, got {endpoint:?}"),
            });
        }
        if self.oracle.model.trim().is_empty() {
            return Err(ConfigError::Validation {
                field: "oracle.model".to_string(),
                message: "model cannot be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("arbiter.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid_and_offline() {
        let config = ArbiterConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.oracle.endpoint.is_none());
        assert_eq!(config.oracle.timeout(), Duration::from_secs(10));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.wal_path(), PathBuf::from("./data/arbiter.wal"));
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let toml = r#"
        data_dir = "/tmp/arb"

        [oracle]
        endpoint = "http://localhost:11434"
        "#;
        let config: ArbiterConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/arb"));
        assert_eq!(config.oracle.endpoint.as_deref(), Some("http://localhost:11434"));
        assert_eq!(config.oracle.timeout_ms, 10_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let result = ArbiterConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbiter.toml");
        std::fs::write(&path, "metrics_port = 9464\n[logging]\nformat = \"json\"\n").unwrap();
        let config = ArbiterConfig::load(Some(&path)).unwrap();
        assert_eq!(config.metrics_port, Some(9464));
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn load_garbage_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "data_dir = [").unwrap();
        assert!(matches!(
            ArbiterConfig::load(Some(&path)),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = [
            ("ARBITER_DATA_DIR", "/srv/arbiter"),
            ("ARBITER_METRICS_PORT", "not-a-port"),
            ("ARBITER_ORACLE_ENDPOINT", "https://llm.internal"),
            ("ARBITER_ORACLE_TIMEOUT_MS", "2500"),
            ("ARBITER_LOG_FORMAT", "JSON"),
        ]
        .into_iter()
        .collect();
        let config = ArbiterConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/srv/arbiter"));
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.oracle.endpoint.as_deref(), Some("https://llm.internal"));
        assert_eq!(config.oracle.timeout_ms, 2500);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ArbiterConfig::default();
        config.oracle.timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { ref field, .. }) if field == "oracle.timeout_ms"
        ));

        let mut config = ArbiterConfig::default();
        config.oracle.endpoint = Some("ftp://nope".into());
        assert!(config.validate().is_err());

        let mut config = ArbiterConfig::default();
        config.metrics_port = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut config = ArbiterConfig::default();
        config.oracle.api_key = Some("sk-secret".into());
        let out = toml::to_string(&config).unwrap();
        assert!(!out.contains("sk-secret"));
    }
}

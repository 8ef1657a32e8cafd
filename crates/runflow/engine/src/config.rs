//! Runflow configuration
//!
//! Loaded in layers: built-in defaults, an optional file, then environment
//! variables prefixed `RUNFLOW_` with `__` between nested keys
//! (`RUNFLOW_QUEUE__CONCURRENCY=4`).

use runflow_queue::QueueConfig;
use runflow_script::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// Orchestration engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stable identity of this deployment; part of every job id
    #[serde(default = "default_deployment_id")]
    pub deployment_id: String,

    /// How long a step waits for a capability reply
    #[serde(default = "default_capability_timeout")]
    pub capability_timeout_ms: u64,

    /// Upper bound on loop step iterations
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,

    /// SLA applied to runs whose definition has none
    #[serde(default)]
    pub default_sla_minutes: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deployment_id: default_deployment_id(),
            capability_timeout_ms: default_capability_timeout(),
            max_loop_iterations: default_max_loop_iterations(),
            default_sla_minutes: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

/// Process host settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory of run definition JSON files loaded at startup
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,

    /// Directory of business rule JSON files loaded at startup
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
}

// Default value helpers
fn default_deployment_id() -> String {
    "runflow".to_string()
}

fn default_capability_timeout() -> u64 {
    30_000
}

fn default_max_loop_iterations() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RunflowConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&RunflowConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RUNFLOW")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runflow_queue::BackendConfig;

    #[test]
    fn test_default_config() {
        let config = RunflowConfig::default();
        assert_eq!(config.engine.capability_timeout_ms, 30_000);
        assert_eq!(config.engine.max_loop_iterations, 1000);
        assert_eq!(config.sandbox.default_timeout_ms, 5_000);
        assert_eq!(config.sandbox.max_timeout_ms, 30_000);
        assert_eq!(config.queue.concurrency, 2);
        assert_eq!(config.queue.backend, BackendConfig::Memory);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = RunflowConfig::load(None).unwrap();
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.engine.deployment_id.is_empty(), false);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runflow.toml");
        std::fs::write(
            &path,
            r#"
            [engine]
            deployment_id = "node-7"
            capability_timeout_ms = 1500

            [queue]
            concurrency = 4

            [queue.backend]
            kind = "sqlite"
            url = "sqlite://jobs.db"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        let config = RunflowConfig::load(path.to_str()).unwrap();
        assert_eq!(config.engine.deployment_id, "node-7");
        assert_eq!(config.engine.capability_timeout_ms, 1500);
        assert_eq!(config.queue.concurrency, 4);
        assert!(matches!(config.queue.backend, BackendConfig::Sqlite { .. }));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.sandbox.max_log_entries, 100);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}

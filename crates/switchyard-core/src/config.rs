//! Broker configuration.
//!
//! Loaded from TOML. Every option has a default, so an empty file (or no
//! file at all) yields a working broker.

use crate::error::{SwitchyardError, SwitchyardResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full broker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Scheduling policy.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Agent liveness policy.
    #[serde(default)]
    pub liveness: LivenessConfig,
    /// Connection authentication.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Terminal task recording.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Period of the dispatch / timeout / liveness sweep.
    #[serde(default = "default_supervisor_interval_ms")]
    pub supervisor_interval_ms: u64,
}

/// Longest per-attempt timeout a task or the queue default may carry.
pub const MAX_TASK_TIMEOUT_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// Task queue policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Admission ceiling on PENDING + ASSIGNED + RUNNING tasks.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// Default per-attempt deadline.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Default `max_attempts` for submissions that do not set one.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// First retry delay; doubles per failed attempt.
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Upper bound for the retry delay.
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// How long a task may wait with no agent declaring its capability.
    #[serde(default = "default_starvation_window_ms")]
    pub starvation_window_ms: u64,
    /// How long terminal tasks stay inspectable before being purged.
    #[serde(default = "default_terminal_retention_ms")]
    pub terminal_retention_ms: u64,
}

/// Agent liveness policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessConfig {
    /// Interval agents are told to heartbeat at.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence after which an agent becomes UNAVAILABLE.
    #[serde(default = "default_liveness_threshold_ms")]
    pub liveness_threshold_ms: u64,
    /// Further silence after which an UNAVAILABLE agent is disconnected.
    #[serde(default = "default_unavailable_grace_ms")]
    pub unavailable_grace_ms: u64,
}

/// Connection authentication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Accepted API keys. Empty = no auth required.
    #[serde(default)]
    pub api_keys: Vec<String>,
}

/// Terminal task recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// JSON-lines file receiving one record per terminal task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7400
}
fn default_supervisor_interval_ms() -> u64 {
    250
}
fn default_max_concurrent_tasks() -> usize {
    1000
}
fn default_task_timeout_ms() -> u64 {
    300_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_base_ms() -> u64 {
    500
}
fn default_retry_backoff_max_ms() -> u64 {
    30_000
}
fn default_starvation_window_ms() -> u64 {
    60_000
}
fn default_terminal_retention_ms() -> u64 {
    300_000
}
fn default_heartbeat_interval_ms() -> u64 {
    10_000
}
fn default_liveness_threshold_ms() -> u64 {
    30_000
}
fn default_unavailable_grace_ms() -> u64 {
    30_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            supervisor_interval_ms: default_supervisor_interval_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_timeout_ms: default_task_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            starvation_window_ms: default_starvation_window_ms(),
            terminal_retention_ms: default_terminal_retention_ms(),
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            liveness_threshold_ms: default_liveness_threshold_ms(),
            unavailable_grace_ms: default_unavailable_grace_ms(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            queue: QueueConfig::default(),
            liveness: LivenessConfig::default(),
            auth: AuthConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Default per-attempt deadline.
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Delay before a task that failed `failed_attempts` times is retried:
    /// `base * 2^(failed_attempts - 1)`, capped at the configured maximum.
    pub fn retry_backoff(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(31);
        let delay = self
            .retry_backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exp));
        Duration::from_millis(delay.min(self.retry_backoff_max_ms))
    }

    /// Starvation window.
    pub fn starvation_window(&self) -> Duration {
        Duration::from_millis(self.starvation_window_ms)
    }

    /// Terminal task retention.
    pub fn terminal_retention(&self) -> Duration {
        Duration::from_millis(self.terminal_retention_ms)
    }
}

impl LivenessConfig {
    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence before an agent is UNAVAILABLE.
    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.liveness_threshold_ms)
    }

    /// Silence after UNAVAILABLE before the agent is dropped.
    pub fn unavailable_grace(&self) -> Duration {
        Duration::from_millis(self.unavailable_grace_ms)
    }
}

impl BrokerConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml_str(s: &str) -> SwitchyardResult<Self> {
        let config: BrokerConfig =
            toml::from_str(s).map_err(|e| SwitchyardError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> SwitchyardResult<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// `host:port` to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Supervisor sweep period.
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.server.supervisor_interval_ms)
    }

    /// Rejects settings the control plane cannot run with.
    pub fn validate(&self) -> SwitchyardResult<()> {
        if self.queue.max_concurrent_tasks == 0 {
            return Err(SwitchyardError::Config(
                "queue.max_concurrent_tasks must be positive".into(),
            ));
        }
        if self.queue.retry_attempts == 0 {
            return Err(SwitchyardError::Config(
                "queue.retry_attempts must be at least 1".into(),
            ));
        }
        if self.queue.task_timeout_ms == 0 {
            return Err(SwitchyardError::Config(
                "queue.task_timeout_ms must be positive".into(),
            ));
        }
        if self.queue.task_timeout_ms > MAX_TASK_TIMEOUT_MS {
            return Err(SwitchyardError::Config(format!(
                "queue.task_timeout_ms must not exceed {MAX_TASK_TIMEOUT_MS}"
            )));
        }
        if self.server.supervisor_interval_ms == 0 {
            return Err(SwitchyardError::Config(
                "server.supervisor_interval_ms must be positive".into(),
            ));
        }
        if self.liveness.liveness_threshold_ms <= self.liveness.heartbeat_interval_ms {
            return Err(SwitchyardError::Config(format!(
                "liveness.liveness_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.liveness.liveness_threshold_ms, self.liveness.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = BrokerConfig::from_toml_str("").unwrap();
        assert_eq!(config, BrokerConfig::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:7400");
    }

    #[test]
    fn test_partial_document() {
        let config = BrokerConfig::from_toml_str(
            r#"
            [server]
            port = 9000

            [queue]
            max_concurrent_tasks = 4
            retry_attempts = 2

            [auth]
            api_keys = ["k1"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.queue.max_concurrent_tasks, 4);
        assert_eq!(config.queue.retry_attempts, 2);
        assert_eq!(config.queue.task_timeout_ms, 300_000);
        assert_eq!(config.auth.api_keys, vec!["k1".to_string()]);
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let err = BrokerConfig::from_toml_str("[queue]\nretry_attempts = 0").unwrap_err();
        assert!(err.to_string().contains("retry_attempts"));
    }

    #[test]
    fn test_validation_rejects_short_liveness() {
        let err = BrokerConfig::from_toml_str(
            "[liveness]\nheartbeat_interval_ms = 5000\nliveness_threshold_ms = 5000",
        )
        .unwrap_err();
        assert!(matches!(err, SwitchyardError::Config(_)));
    }

    #[test]
    fn test_validation_bounds_task_timeout() {
        let err = BrokerConfig::from_toml_str(&format!(
            "[queue]\ntask_timeout_ms = {}",
            i64::MAX
        ))
        .unwrap_err();
        assert!(err.to_string().contains("task_timeout_ms"));

        let config = BrokerConfig::from_toml_str(&format!(
            "[queue]\ntask_timeout_ms = {MAX_TASK_TIMEOUT_MS}"
        ))
        .unwrap();
        assert_eq!(config.queue.task_timeout_ms, MAX_TASK_TIMEOUT_MS);
    }

    #[test]
    fn test_retry_backoff_is_exponential_and_capped() {
        let queue = QueueConfig {
            retry_backoff_base_ms: 100,
            retry_backoff_max_ms: 350,
            ..QueueConfig::default()
        };
        assert_eq!(queue.retry_backoff(1), Duration::from_millis(100));
        assert_eq!(queue.retry_backoff(2), Duration::from_millis(200));
        assert_eq!(queue.retry_backoff(3), Duration::from_millis(350));
        assert_eq!(queue.retry_backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 7400);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchyard.toml");
        std::fs::write(&path, "[server]\nhost = \"127.0.0.1\"").unwrap();
        let config = BrokerConfig::load(&path).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:7400");
    }
}

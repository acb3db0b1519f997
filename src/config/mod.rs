//! Configuration management for the madang server
//!
//! This module handles loading and validating configuration from environment
//! variables, files, and command-line arguments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General server configuration
    pub general: GeneralConfig,

    /// HTTP transport configuration
    pub web: WebConfig,

    /// Background task system configuration
    pub tasks: TaskConfig,

    /// Redis queue store configuration
    pub redis: RedisConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// User-facing error message templates
    #[serde(default)]
    pub errors: ErrorMessages,
}

/// General server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Server name reported in status responses
    pub server_name: String,

    /// Identity of this node within the cluster
    pub node_id: String,

    /// Maximum number of actions one connection may have in flight
    pub simultaneous_actions: usize,

    /// Whether undeclared params are scrubbed before validation
    pub enable_param_scrubbing: bool,

    /// Values treated as "missing" by the required-param check
    /// (an absent key is always missing; defaults add `null` and `""`)
    #[serde(default = "default_missing_param_values")]
    pub missing_param_values: Vec<Value>,

    /// Param names accepted on every action regardless of declared inputs
    #[serde(default = "default_safe_params")]
    pub safe_params: Vec<String>,

    /// Param names redacted from completion log lines
    #[serde(default = "default_secret_params")]
    pub secret_params: Vec<String>,

    /// Maximum length of a single param value in completion log lines
    pub max_logged_param_length: usize,
}

/// HTTP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,

    /// Enable permissive CORS headers
    pub enable_cors: bool,

    /// Enable per-request tracing
    pub enable_request_logging: bool,
}

/// Background task system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Whether this process runs task workers
    pub enabled: bool,

    /// Number of workers to run in this process
    pub workers: usize,

    /// Worker tick interval in milliseconds
    pub tick_interval_ms: u64,

    /// Key namespace prefix shared by every node in the cluster
    pub namespace: String,

    /// Lock time-to-live for periodic job locks, in seconds
    pub lock_ttl_secs: u64,

    /// Re-enqueue a periodic task even when its run body failed
    pub re_enqueue_periodic_on_exception: bool,
}

impl TaskConfig {
    /// Worker tick interval as a [`Duration`]
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 1,
            tick_interval_ms: 5000,
            namespace: String::from("madang"),
            lock_ttl_secs: 300,
            re_enqueue_periodic_on_exception: true,
        }
    }
}

/// Redis queue store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL (e.g., redis://localhost:6379)
    pub url: String,

    /// Connection pool size
    pub pool_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

fn default_missing_param_values() -> Vec<Value> {
    vec![Value::Null, Value::String(String::new())]
}

fn default_safe_params() -> Vec<String> {
    ["action", "apiVersion", "callback", "file", "messageId"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_secret_params() -> Vec<String> {
    ["password", "token", "secret"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

// ============================================================================
// Error Message Templates
// ============================================================================

/// Templates for the user-facing messages produced by terminal action
/// statuses. `{action}`, `{type}`, `{param}`, and `{errors}` placeholders are
/// substituted at completion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessages {
    pub server_shutting_down: String,
    pub too_many_pending_actions: String,
    pub unknown_action: String,
    pub unsupported_server_type: String,
    pub missing_params: String,
    pub validator_errors: String,
}

impl Default for ErrorMessages {
    fn default() -> Self {
        Self {
            server_shutting_down: String::from("the server is shutting down"),
            too_many_pending_actions: String::from(
                "you have too many pending requests on this connection",
            ),
            unknown_action: String::from("unknown action '{action}' or invalid apiVersion"),
            unsupported_server_type: String::from(
                "this action does not support the '{type}' connection type",
            ),
            missing_params: String::from("{param} is a required parameter for this action"),
            validator_errors: String::from("{errors}"),
        }
    }
}

impl ErrorMessages {
    pub fn server_shutting_down(&self) -> String {
        self.server_shutting_down.clone()
    }

    pub fn too_many_pending_actions(&self) -> String {
        self.too_many_pending_actions.clone()
    }

    pub fn unknown_action(&self, action: &str) -> String {
        self.unknown_action.replace("{action}", action)
    }

    pub fn unsupported_server_type(&self, connection_type: &str) -> String {
        self.unsupported_server_type
            .replace("{type}", connection_type)
    }

    pub fn missing_params(&self, missing: &[String]) -> String {
        // The first missing param names the error, matching how the
        // validator reports them one at a time.
        let first = missing.first().map(String::as_str).unwrap_or("unknown");
        self.missing_params.replace("{param}", first)
    }

    pub fn validator_errors(&self, errors: &[String]) -> String {
        self.validator_errors.replace("{errors}", &errors.join("; "))
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let server_name =
            std::env::var("MADANG_SERVER_NAME").unwrap_or_else(|_| String::from("madang"));

        let node_id = std::env::var("MADANG_NODE_ID")
            .unwrap_or_else(|_| format!("node-{}", uuid::Uuid::new_v4().simple()));

        let simultaneous_actions = std::env::var("MADANG_SIMULTANEOUS_ACTIONS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(5);

        let enable_param_scrubbing = std::env::var("MADANG_SCRUB_PARAMS")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        let max_logged_param_length = std::env::var("MADANG_MAX_LOGGED_PARAM_LENGTH")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(256);

        let host = std::env::var("MADANG_HOST").unwrap_or_else(|_| String::from("0.0.0.0"));

        let port = std::env::var("MADANG_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(8080);

        let tasks_enabled = std::env::var("MADANG_TASKS_ENABLED")
            .ok()
            .and_then(|v| v.parse::<bool>().ok())
            .unwrap_or(true);

        let workers = std::env::var("MADANG_TASK_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(1);

        let tick_interval_ms = std::env::var("MADANG_TASK_TICK_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(5000);

        let namespace =
            std::env::var("MADANG_NAMESPACE").unwrap_or_else(|_| String::from("madang"));

        let lock_ttl_secs = std::env::var("MADANG_LOCK_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| String::from("redis://localhost:6379"));

        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(10);

        let log_level = std::env::var("MADANG_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));

        let log_format = std::env::var("MADANG_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            general: GeneralConfig {
                server_name,
                node_id,
                simultaneous_actions,
                enable_param_scrubbing,
                missing_param_values: default_missing_param_values(),
                safe_params: default_safe_params(),
                secret_params: default_secret_params(),
                max_logged_param_length,
            },
            web: WebConfig {
                host,
                port,
                enable_cors: true,
                enable_request_logging: true,
            },
            tasks: TaskConfig {
                enabled: tasks_enabled,
                workers,
                tick_interval_ms,
                namespace,
                lock_ttl_secs,
                re_enqueue_periodic_on_exception: true,
            },
            redis: RedisConfig {
                url: redis_url,
                pool_size,
            },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
            errors: ErrorMessages::default(),
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.general.simultaneous_actions == 0 {
            anyhow::bail!("simultaneous_actions must be greater than 0");
        }

        if self.general.node_id.is_empty() {
            anyhow::bail!("node_id cannot be empty");
        }

        if self.tasks.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be greater than 0");
        }

        if self.tasks.namespace.is_empty() {
            anyhow::bail!("namespace cannot be empty");
        }

        if self.redis.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        Ok(())
    }

    /// Get the worker tick interval as a Duration
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tasks.tick_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                server_name: String::from("madang"),
                node_id: String::from("node-1"),
                simultaneous_actions: 5,
                enable_param_scrubbing: true,
                missing_param_values: default_missing_param_values(),
                safe_params: default_safe_params(),
                secret_params: default_secret_params(),
                max_logged_param_length: 256,
            },
            web: WebConfig {
                host: String::from("0.0.0.0"),
                port: 8080,
                enable_cors: true,
                enable_request_logging: true,
            },
            tasks: TaskConfig::default(),
            redis: RedisConfig {
                url: String::from("redis://localhost:6379"),
                pool_size: 10,
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
            errors: ErrorMessages::default(),
        }
    }
}

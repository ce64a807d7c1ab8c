/// Configuration management for the dagloop engine
///
/// Handles server binding, the SQLite location, sandbox limits, the polling-loop
/// scheduler and outbound action endpoints. Every field can be overridden through a
/// `DAGLOOP_*` environment variable for container deployments.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Script sandbox limits
    pub sandbox: SandboxConfig,
    /// Outbound HTTP defaults
    pub http: HttpConfig,
    /// Polling-loop scheduler settings
    pub scheduler: SchedulerConfig,
    /// Email relay used by email nodes
    pub email: EmailConfig,
    /// LLM provider used by llm nodes
    pub llm: LlmConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding `engine.db` (default: "data")
    pub data_dir: String,
    /// Optional directory of `*.json` workflow definitions imported at startup
    pub workflows_dir: Option<String>,
}

/// Script sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget for a single condition/transformer call
    pub timeout_ms: u64,
    /// Upper bound on interpreter allocations
    pub memory_limit_bytes: usize,
}

/// Outbound HTTP defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Response bodies beyond this size are truncated before parsing
    pub max_response_bytes: usize,
    /// User-Agent header sent with every request
    pub user_agent: String,
}

/// Polling-loop scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between scans for due loops
    pub tick_interval_ms: u64,
    /// Size of the iteration worker pool
    pub max_concurrent_iterations: usize,
    /// Hard cap on a single iteration's request timeout
    pub max_iteration_timeout_seconds: u64,
    /// Iteration history entries kept per loop
    pub max_history_entries: usize,
    /// Characters of response body kept per history entry
    pub history_snippet_chars: usize,
    /// Safety re-check interval for executions waiting on a loop
    pub completion_poll_ms: u64,
    /// Finished loops older than this are purged at startup
    pub terminal_retention_hours: u64,
}

/// Email relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// JSON endpoint accepting `{from, to, cc, subject, body}`
    pub relay_url: Option<String>,
    /// Bearer token for the relay
    pub api_key: Option<String>,
    /// Sender used when the node does not set one
    pub default_from: String,
}

/// LLM provider configuration (Anthropic messages API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_version: String,
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms.max(10))
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 1_000,
            memory_limit_bytes: 32 * 1024 * 1024,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_response_bytes: 10 * 1024 * 1024,
            user_agent: format!("dagloop/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_concurrent_iterations: 16,
            max_iteration_timeout_seconds: 300,
            max_history_entries: 100,
            history_snippet_chars: 1_000,
            completion_poll_ms: 5_000,
            terminal_retention_hours: 7 * 24,
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            api_key: None,
            default_from: "noreply@localhost".to_string(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            api_version: "2023-06-01".to_string(),
        }
    }
}

/// Read an environment variable and parse it, falling back when absent or malformed
fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        let sandbox = SandboxConfig::default();
        let http = HttpConfig::default();
        let scheduler = SchedulerConfig::default();
        let email = EmailConfig::default();
        let llm = LlmConfig::default();

        Self {
            server: ServerConfig {
                host: std::env::var("DAGLOOP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_or("DAGLOOP_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("DAGLOOP_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
                workflows_dir: std::env::var("DAGLOOP_WORKFLOWS_DIR").ok(),
            },
            sandbox: SandboxConfig {
                timeout_ms: env_or("DAGLOOP_SCRIPT_TIMEOUT_MS", sandbox.timeout_ms),
                memory_limit_bytes: env_or("DAGLOOP_SCRIPT_MEMORY_LIMIT", sandbox.memory_limit_bytes),
            },
            http: HttpConfig {
                max_response_bytes: env_or("DAGLOOP_HTTP_MAX_RESPONSE_BYTES", http.max_response_bytes),
                user_agent: http.user_agent,
            },
            scheduler: SchedulerConfig {
                tick_interval_ms: env_or("DAGLOOP_LOOP_TICK_MS", scheduler.tick_interval_ms),
                max_concurrent_iterations: env_or(
                    "DAGLOOP_LOOP_WORKERS",
                    scheduler.max_concurrent_iterations,
                ),
                max_iteration_timeout_seconds: env_or(
                    "DAGLOOP_LOOP_MAX_ITERATION_TIMEOUT",
                    scheduler.max_iteration_timeout_seconds,
                ),
                max_history_entries: env_or("DAGLOOP_LOOP_HISTORY", scheduler.max_history_entries),
                history_snippet_chars: scheduler.history_snippet_chars,
                completion_poll_ms: scheduler.completion_poll_ms,
                terminal_retention_hours: env_or(
                    "DAGLOOP_LOOP_RETENTION_HOURS",
                    scheduler.terminal_retention_hours,
                ),
            },
            email: EmailConfig {
                relay_url: std::env::var("DAGLOOP_EMAIL_RELAY_URL").ok(),
                api_key: std::env::var("DAGLOOP_EMAIL_API_KEY").ok(),
                default_from: std::env::var("DAGLOOP_EMAIL_FROM").unwrap_or(email.default_from),
            },
            llm: LlmConfig {
                base_url: std::env::var("DAGLOOP_LLM_BASE_URL").unwrap_or(llm.base_url),
                api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
                api_version: llm.api_version,
            },
        }
    }
}

//! Application configuration: `mcp-agent.yaml`.
//!
//! Lookup order:
//! 1. An explicit path (`--config`)
//! 2. `$MCP_AGENT_CONFIG`
//! 3. `mcp-agent.yaml` in the working directory or any parent
//!
//! When no file is found the built-in defaults reproduce the stock
//! deployment: four streamable-HTTP servers on localhost and a local
//! Ollama model. String values support `${VAR}` / `${VAR:-default}`
//! interpolation before parsing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::agent_loop::{LoopSettings, DEFAULT_MAX_OBSERVATION_CHARS};
use crate::agent_core::tool_router::Dispatcher;
use crate::inference::client::DEFAULT_SYSTEM_PROMPT;
use crate::inference::ModelConfig;
use crate::mcp_client::lifecycle::RetryPolicy;
use crate::mcp_client::{ClientSettings, CollisionPolicy, ServerDescriptor, TransportConfig};

/// File name searched for when no path is given.
pub const CONFIG_FILE_NAME: &str = "mcp-agent.yaml";

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "MCP_AGENT_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

// ─── Sections ────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default = "default_servers")]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// `agent:` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub max_steps: u32,
    pub tool_timeout_secs: u64,
    pub tool_retries: u32,
    pub time_budget_secs: u64,
    pub max_observation_chars: usize,
    pub collision_policy: CollisionPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: 5,
            tool_timeout_secs: 30,
            tool_retries: 0,
            time_budget_secs: 300,
            max_observation_chars: DEFAULT_MAX_OBSERVATION_CHARS,
            collision_policy: CollisionPolicy::Namespace,
        }
    }
}

/// `connection:` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub connect_timeout_secs: u64,
    pub manifest_timeout_secs: u64,
    /// Seconds between reconnect sweeps over degraded servers. `0` disables.
    pub reconnect_interval_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1000,
            connect_timeout_secs: 30,
            manifest_timeout_secs: 15,
            reconnect_interval_secs: 60,
        }
    }
}

fn http_server(id: &str, port: u16) -> ServerDescriptor {
    ServerDescriptor {
        id: id.to_string(),
        transport: TransportConfig::StreamableHttp {
            url: format!("http://localhost:{port}/mcp/"),
            headers: Default::default(),
        },
        required_env: Vec::new(),
        connect_timeout_secs: None,
    }
}

fn default_servers() -> Vec<ServerDescriptor> {
    vec![
        http_server("search_mcp_server", 1000),
        http_server("rag_mcp_server", 2000),
        http_server("db_mcp_server", 3000),
        http_server("fs_mcp_server", 4000),
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            model: ModelConfig::default(),
            agent: AgentConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

// ─── Derived Settings ────────────────────────────────────────────────────────

impl AppConfig {
    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            retry: RetryPolicy {
                max_attempts: self.connection.max_attempts,
                backoff_base: Duration::from_millis(self.connection.backoff_base_ms),
                connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            },
            manifest_timeout: Duration::from_secs(self.connection.manifest_timeout_secs),
            collision_policy: self.agent.collision_policy,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Duration::from_secs(self.agent.tool_timeout_secs),
            self.agent.tool_retries,
        )
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            time_budget: Duration::from_secs(self.agent.time_budget_secs),
            max_observation_chars: self.agent.max_observation_chars,
        }
    }

    /// `None` when periodic reconnects are disabled.
    pub fn reconnect_interval(&self) -> Option<Duration> {
        match self.connection.reconnect_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Check cross-field constraints serde cannot express.
    ///
    /// Only settings that affect every server are checked here. A server
    /// whose own transport settings are unusable fails at connect time and
    /// leaves the others running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { reason });

        let mut seen = HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return invalid("server id must not be empty".into());
            }
            if !seen.insert(server.id.as_str()) {
                return invalid(format!("duplicate server id '{}'", server.id));
            }
        }

        if self.agent.max_steps == 0 {
            return invalid("agent.max_steps must be at least 1".into());
        }
        if self.agent.tool_timeout_secs == 0 {
            return invalid("agent.tool_timeout_secs must be positive".into());
        }
        if self.agent.time_budget_secs == 0 {
            return invalid("agent.time_budget_secs must be positive".into());
        }
        if self.connection.max_attempts == 0 {
            return invalid("connection.max_attempts must be at least 1".into());
        }

        self.model
            .validate()
            .map_err(|e| ConfigError::Invalid { reason: e.to_string() })
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file. `Ok(None)` means "use the defaults".
///
/// An explicit path or `$MCP_AGENT_CONFIG` that does not exist is an error;
/// the upward search quietly finds nothing.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit {
        return require_exists(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.is_empty() {
            return require_exists(PathBuf::from(expand_tilde(&path)));
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(Some(candidate));
        }
        if !dir.pop() {
            return Ok(None);
        }
    }
}

fn require_exists(path: PathBuf) -> Result<Option<PathBuf>, ConfigError> {
    if path.is_file() {
        Ok(Some(path))
    } else {
        Err(ConfigError::Read {
            path: path.display().to_string(),
            reason: "file not found".into(),
        })
    }
}

/// Load, interpolate, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let config = parse_config(&raw).map_err(|e| match e {
        ConfigError::Parse { reason, .. } => ConfigError::Parse {
            path: path.display().to_string(),
            reason,
        },
        other => other,
    })?;
    tracing::info!(path = %path.display(), servers = config.servers.len(), "loaded config");
    Ok(config)
}

/// Parse config text. Empty text yields the defaults.
pub fn parse_config(raw: &str) -> Result<AppConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config = if interpolated.trim().is_empty() {
        AppConfig::default()
    } else {
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?
    };
    config.validate()?;
    Ok(config)
}

/// Resolve and load the effective configuration.
pub fn resolve_config(explicit: Option<&Path>) -> Result<(AppConfig, Option<PathBuf>), ConfigError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    match find_config_path(explicit, &cwd)? {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => {
            tracing::info!("no {CONFIG_FILE_NAME} found, using built-in defaults");
            let config = AppConfig::default();
            config.validate()?;
            Ok((config, None))
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Set-but-empty counts as unset.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

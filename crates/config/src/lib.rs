//! Configuration loading, validation, and management for Skein.
//!
//! Loads configuration from `~/.skein/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.skein/config.toml`. Every section is optional in the
/// file; missing values fall back to the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,

    /// Background run scheduling
    #[serde(default)]
    pub runs: RunsConfig,

    /// Tool-call loop detection
    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,

    /// Retry policy for non-streaming model calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Tool result truncation for the action stream
    #[serde(default)]
    pub transport: TransportConfig,

    /// Persona/tool-doc text cache
    #[serde(default)]
    pub prompt_cache: PromptCacheConfig,

    /// Best-effort run history store
    #[serde(default)]
    pub run_store: RunStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model identifier passed through to the provider
    #[serde(default = "default_model")]
    pub name: String,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunsConfig {
    /// Max concurrently running children per parent
    #[serde(default = "default_max_children")]
    pub max_children: usize,

    /// Max spawn depth; runs at this depth cannot spawn further
    #[serde(default = "default_max_spawn_depth")]
    pub max_spawn_depth: u32,

    /// Wall-clock timeout for one background run
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// How long terminal runs are kept before the sweep drops them
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Interval of the periodic background sweep
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Minimum gap between two delta events of the same run
    #[serde(default = "default_delta_throttle_ms")]
    pub delta_throttle_ms: u64,

    /// Max messages of context a sub-agent inherits
    #[serde(default = "default_max_subagent_context")]
    pub max_subagent_context: usize,
}

fn default_max_children() -> usize {
    5
}
fn default_max_spawn_depth() -> u32 {
    1
}
fn default_run_timeout_secs() -> u64 {
    180
}
fn default_retention_secs() -> u64 {
    600
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_delta_throttle_ms() -> u64 {
    100
}
fn default_max_subagent_context() -> usize {
    20
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_children: default_max_children(),
            max_spawn_depth: default_max_spawn_depth(),
            run_timeout_secs: default_run_timeout_secs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            delta_throttle_ms: default_delta_throttle_ms(),
            max_subagent_context: default_max_subagent_context(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Identical call+result streak that counts as no progress
    #[serde(default = "default_repeat_no_progress")]
    pub repeat_no_progress: usize,

    /// Alternating pairs that count as ping-pong
    #[serde(default = "default_ping_pong_pairs")]
    pub ping_pong_pairs: usize,

    /// Same call+params count in the window that trips the breaker
    #[serde(default = "default_global_breaker")]
    pub global_breaker: usize,
}

fn default_window_size() -> usize {
    40
}
fn default_repeat_no_progress() -> usize {
    8
}
fn default_ping_pong_pairs() -> usize {
    5
}
fn default_global_breaker() -> usize {
    25
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            repeat_no_progress: default_repeat_no_progress(),
            ping_pong_pairs: default_ping_pong_pairs(),
            global_breaker: default_global_breaker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles after each failure
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Model context window in tokens
    #[serde(default = "default_context_window")]
    pub context_window: usize,

    /// Fraction of the context window one tool result may occupy
    #[serde(default = "default_tool_result_share")]
    pub tool_result_share: f64,

    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: f64,

    #[serde(default = "default_head_chars")]
    pub head_chars: usize,

    #[serde(default = "default_tail_chars")]
    pub tail_chars: usize,
}

fn default_context_window() -> usize {
    128_000
}
fn default_tool_result_share() -> f64 {
    0.3
}
fn default_chars_per_token() -> f64 {
    3.5
}
fn default_head_chars() -> usize {
    1500
}
fn default_tail_chars() -> usize {
    1500
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            tool_result_share: default_tool_result_share(),
            chars_per_token: default_chars_per_token(),
            head_chars: default_head_chars(),
            tail_chars: default_tail_chars(),
        }
    }
}

/// Character budget for persona and tool-doc text in one prompt mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharBudget {
    pub soul: usize,
    pub tools: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptCacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    /// Files longer than this are logged as candidates for distilling
    #[serde(default = "default_size_warn_chars")]
    pub size_warn_chars: usize,

    #[serde(default = "default_full_budget")]
    pub full: CharBudget,

    #[serde(default = "default_minimal_budget")]
    pub minimal: CharBudget,

    #[serde(default = "default_micro_budget")]
    pub micro: CharBudget,
}

fn default_cache_ttl_secs() -> u64 {
    60
}
fn default_size_warn_chars() -> usize {
    8000
}
fn default_full_budget() -> CharBudget {
    CharBudget {
        soul: 3000,
        tools: 3000,
    }
}
fn default_minimal_budget() -> CharBudget {
    CharBudget {
        soul: 800,
        tools: 800,
    }
}
fn default_micro_budget() -> CharBudget {
    CharBudget { soul: 0, tools: 0 }
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            size_warn_chars: default_size_warn_chars(),
            full: default_full_budget(),
            minimal: default_minimal_budget(),
            micro: default_micro_budget(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStoreConfig {
    /// Base URL of the run history API. Unset disables persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.skein/config.toml).
    ///
    /// Environment variables override the file:
    /// - `SKEIN_MODEL`
    /// - `SKEIN_CONTEXT_WINDOW`
    /// - `SKEIN_RUN_STORE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("SKEIN_MODEL") {
            self.model.name = model;
        }

        if let Some(window) = lookup("SKEIN_CONTEXT_WINDOW") {
            self.transport.context_window = window.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!(
                    "SKEIN_CONTEXT_WINDOW must be a positive integer, got {window:?}"
                ))
            })?;
        }

        if let Some(url) = lookup("SKEIN_RUN_STORE_URL") {
            self.run_store.base_url = if url.trim().is_empty() {
                None
            } else {
                Some(url)
            };
        }

        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".skein")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let runs = &self.runs;
        if runs.max_children == 0 {
            return Err(ConfigError::ValidationError(
                "runs.max_children must be > 0".into(),
            ));
        }
        if runs.run_timeout_secs == 0 || runs.sweep_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "runs.run_timeout_secs and runs.sweep_interval_secs must be > 0".into(),
            ));
        }

        let ld = &self.loop_detection;
        if ld.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "loop_detection.window_size must be > 0".into(),
            ));
        }
        if ld.repeat_no_progress == 0 || ld.repeat_no_progress > ld.window_size {
            return Err(ConfigError::ValidationError(
                "loop_detection.repeat_no_progress must be between 1 and window_size".into(),
            ));
        }
        if ld.ping_pong_pairs == 0 || ld.ping_pong_pairs * 2 > ld.window_size {
            return Err(ConfigError::ValidationError(
                "loop_detection.ping_pong_pairs * 2 must be between 2 and window_size".into(),
            ));
        }
        if ld.global_breaker == 0 || ld.global_breaker > ld.window_size {
            return Err(ConfigError::ValidationError(
                "loop_detection.global_breaker must be between 1 and window_size".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be > 0".into(),
            ));
        }

        let t = &self.transport;
        if t.context_window == 0 {
            return Err(ConfigError::ValidationError(
                "transport.context_window must be > 0".into(),
            ));
        }
        if !(t.tool_result_share > 0.0 && t.tool_result_share <= 1.0) {
            return Err(ConfigError::ValidationError(
                "transport.tool_result_share must be in (0, 1]".into(),
            ));
        }
        if t.chars_per_token <= 0.0 {
            return Err(ConfigError::ValidationError(
                "transport.chars_per_token must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

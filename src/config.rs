use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{DroidClawError, DroidClawResult};

/// Immutable settings snapshot handed to a task at start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    /// Human-readable app name → package id.
    #[serde(default)]
    pub apps: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub active_provider: String,
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    /// Role-to-model mapping. If a role is absent, falls back to active_provider defaults.
    #[serde(default)]
    pub roles: RolesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub display_name: String,
    /// Full chat-completions endpoint URL.
    pub api_base: String,
    /// Default model for this provider (used as fallback when no role config exists).
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Optional API key stored in config.toml (falls back to env var DROIDCLAW_<ID>_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Maps agent roles to specific provider+model combinations.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolesConfig {
    /// Multimodal model that reads the screen and picks the next action.
    pub vision: Option<RoleEntry>,
    /// Text model used to summarize recorded notes for `call_api`.
    pub summary: Option<RoleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    /// Must match a key under [llm.providers.*].
    pub provider: String,
    /// Model name sent to the API.
    pub model: String,
    #[serde(default)]
    pub stream: bool,
    /// Overrides the provider-level temperature for this role.
    pub temperature: Option<f64>,
}

fn default_temperature() -> f64 {
    0.1
}

fn default_request_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    /// Pause before retrying after a step that produced no command.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_true")]
    pub record_history: bool,
    /// Language the model is asked to reason in ("en" or "zh").
    #[serde(default = "default_language")]
    pub language: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_consecutive_failures: default_max_failures(),
            retry_delay_ms: default_retry_delay(),
            record_history: true,
            language: default_language(),
        }
    }
}

fn default_max_steps() -> u32 {
    50
}

fn default_max_failures() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_language() -> String {
    "en".into()
}

/// Per-action timing and the automation input method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub automation_ime: String,
    pub double_tap_gap_ms: u64,
    pub long_press_ms: u64,
    pub swipe_ms: u64,
    pub wait_ms: u64,
    /// Settle time after taps, presses and key events.
    pub post_action_delay_ms: u64,
    pub post_swipe_delay_ms: u64,
    pub post_launch_delay_ms: u64,
    pub post_type_delay_ms: u64,
    pub ime_switch_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            automation_ime: "com.android.adbkeyboard/.AdbIME".into(),
            double_tap_gap_ms: 100,
            long_press_ms: 1000,
            swipe_ms: 300,
            wait_ms: 2000,
            post_action_delay_ms: 500,
            post_swipe_delay_ms: 500,
            post_launch_delay_ms: 1500,
            post_type_delay_ms: 300,
            ime_switch_delay_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub adb_path: String,
    /// Target device serial; `None` lets adb pick the only attached device.
    pub serial: Option<String>,
    /// Where captured frames are written. Defaults to the system temp dir.
    pub capture_dir: Option<PathBuf>,
    /// Shell commands must start with one of these prefixes.
    pub allowed_shell_prefixes: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_path: "adb".into(),
            serial: None,
            capture_dir: None,
            allowed_shell_prefixes: vec![
                "input ".into(),
                "monkey ".into(),
                "am ".into(),
                "ime ".into(),
                "settings get ".into(),
                "dumpsys window".into(),
                "screencap ".into(),
            ],
        }
    }
}

fn default_true() -> bool {
    true
}

fn resolve_config_path() -> DroidClawResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(DroidClawError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config() -> DroidClawResult<AppConfig> {
    let path = resolve_config_path()?;
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> DroidClawResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::info!(path = %path.display(), provider = %config.llm.active_provider, "config loaded");
    Ok(config)
}

pub fn parse_config(content: &str) -> DroidClawResult<AppConfig> {
    let config: AppConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> DroidClawResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}

impl AppConfig {
    fn validate(&self) -> DroidClawResult<()> {
        if self.agent.max_steps == 0 {
            return Err(DroidClawError::Config("agent.max_steps must be at least 1".into()));
        }
        if self.agent.max_consecutive_failures == 0 {
            return Err(DroidClawError::Config(
                "agent.max_consecutive_failures must be at least 1".into(),
            ));
        }
        if !self.llm.active_provider.is_empty()
            && !self.llm.providers.contains_key(&self.llm.active_provider)
        {
            return Err(DroidClawError::Config(format!(
                "active_provider '{}' has no [llm.providers.{}] entry",
                self.llm.active_provider, self.llm.active_provider
            )));
        }
        Ok(())
    }
}

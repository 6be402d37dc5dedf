//! Configuration loading, validation, and management for meshtalk.
//!
//! Loads configuration from `~/.meshtalk/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use meshtalk_core::tool::PermissionLevel;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.meshtalk/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which back-end to talk to and how to reach it
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Selected model. There is deliberately no default: a round without a
    /// model is a configuration error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Optional system prompt sent ahead of the history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Tool settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Permission engine settings
    #[serde(default)]
    pub permissions: PermissionsConfig,

    /// Agent loop settings
    #[serde(default)]
    pub agent: AgentConfig,
}

/// Supported back-end wire protocols.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local daemon speaking NDJSON on `/api/chat`
    #[default]
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` endpoint (SSE)
    #[serde(alias = "openai_compat")]
    OpenAi,
    /// Anthropic Messages API (SSE with discrete tool_use blocks)
    Anthropic,
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "openai_compat" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(ConfigError::ValidationError(format!(
                "unknown provider kind '{other}' (expected ollama, openai or anthropic)"
            ))),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,

    /// Base URL; each kind has its own default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Tunnel HTTP through a local Unix domain socket instead of TCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<PathBuf>,
}

impl ProviderConfig {
    /// The base URL to use, falling back to the kind's well-known default.
    pub fn effective_base_url(&self) -> String {
        if let Some(url) = &self.base_url {
            return url.trim_end_matches('/').to_string();
        }
        match self.kind {
            ProviderKind::Ollama => "http://localhost:11434".into(),
            ProviderKind::OpenAi => "https://api.openai.com/v1".into(),
            ProviderKind::Anthropic => "https://api.anthropic.com".into(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("unix_socket", &self.unix_socket)
            .finish()
    }
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Send tool schemas to the model at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deadline for a single handler invocation
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    /// Tool output beyond this many bytes is truncated
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    #[serde(default = "default_web_search_url")]
    pub web_search_url: String,

    /// Gateway of the local mesh node
    #[serde(default = "default_mesh_url")]
    pub mesh_url: String,
}

fn default_true() -> bool {
    true
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_max_output_bytes() -> usize {
    32 * 1024
}
fn default_web_search_url() -> String {
    "https://api.duckduckgo.com".into()
}
fn default_mesh_url() -> String {
    "http://127.0.0.1:7946".into()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_secs: default_tool_timeout(),
            max_output_bytes: default_max_output_bytes(),
            web_search_url: default_web_search_url(),
            mesh_url: default_mesh_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionsConfig {
    /// Level used when no rule matches: Ask when true, Allow when false
    #[serde(default = "default_true")]
    pub default_requires_approval: bool,

    /// Per-tool level overrides, keyed by tool name
    #[serde(default)]
    pub tools: HashMap<String, PermissionLevel>,

    /// Filesystem allow list (directories or `prefix*` patterns)
    #[serde(default)]
    pub allowed_paths: Vec<String>,

    /// Filesystem deny list, checked first
    #[serde(default = "default_denied_paths")]
    pub denied_paths: Vec<String>,

    /// Executables considered known-safe; this only changes prompt framing
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Any command containing one of these substrings is denied
    #[serde(default = "default_denied_commands")]
    pub denied_commands: Vec<String>,
}

fn default_denied_paths() -> Vec<String> {
    vec![
        "~/.ssh".into(),
        "~/.gnupg".into(),
        "~/.aws".into(),
        "/etc/shadow".into(),
        "/etc/sudoers".into(),
        "*.pem".into(),
    ]
}

fn default_allowed_commands() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "echo", "pwd", "date", "whoami", "wc", "grep", "find",
        "which", "git", "cargo", "rustc",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_denied_commands() -> Vec<String> {
    [
        "rm -rf /",
        "mkfs",
        "dd if=",
        ":(){",
        "shutdown",
        "reboot",
        "> /dev/sd",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            default_requires_approval: true,
            tools: HashMap::new(),
            allowed_paths: Vec::new(),
            denied_paths: default_denied_paths(),
            allowed_commands: default_allowed_commands(),
            denied_commands: default_denied_commands(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Re-poll delay of the cooperative loop
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Maximum tool-driven resubmissions per user message
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

fn default_poll_interval() -> u64 {
    25
}
fn default_max_rounds() -> u32 {
    25
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            max_rounds: default_max_rounds(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Environment variables override file values:
    /// - `MESHTALK_PROVIDER`, `MESHTALK_MODEL`, `MESHTALK_BASE_URL`, `MESHTALK_API_KEY`
    /// - `OLLAMA_HOST` (only when no base URL is set and the provider is Ollama)
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
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
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(kind) = lookup("MESHTALK_PROVIDER") {
            self.provider.kind = kind.parse()?;
        }
        if let Some(model) = lookup("MESHTALK_MODEL").filter(|m| !m.is_empty()) {
            self.model = Some(model);
        }
        if let Some(url) = lookup("MESHTALK_BASE_URL") {
            self.provider.base_url = Some(url);
        } else if self.provider.base_url.is_none()
            && self.provider.kind == ProviderKind::Ollama
            && let Some(host) = lookup("OLLAMA_HOST")
        {
            let url = if host.starts_with("http://") || host.starts_with("https://") {
                host
            } else {
                format!("http://{host}")
            };
            self.provider.base_url = Some(url);
        }
        if let Some(key) = lookup("MESHTALK_API_KEY") {
            self.provider.api_key = Some(key);
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".meshtalk")
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.tools.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tools.timeout_secs must be > 0".into(),
            ));
        }

        if self.agent.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "agent.poll_interval_ms must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// The selected model, or the configuration error a round reports.
    pub fn require_model(&self) -> Result<&str, ConfigError> {
        self.model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or(ConfigError::NoModelSelected)
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            model: None,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            tools: ToolsConfig::default(),
            permissions: PermissionsConfig::default(),
            agent: AgentConfig::default(),
        }
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

    #[error("No model selected; set `model` in config.toml or MESHTALK_MODEL")]
    NoModelSelected,
}

impl From<ConfigError> for meshtalk_core::Error {
    fn from(e: ConfigError) -> Self {
        meshtalk_core::Error::Config {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.provider.kind, ProviderKind::Ollama);
        assert_eq!(config.tools.timeout_secs, 60);
        assert!(config.permissions.default_requires_approval);
        assert_eq!(config.agent.poll_interval_ms, 25);
    }

    #[test]
    fn config_roundtrip_toml() {
        let mut config = AppConfig::default();
        config.model = Some("llama3.1".into());
        config.permissions.tools.insert("web_search".into(), PermissionLevel::Allow);
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model.as_deref(), Some("llama3.1"));
        assert_eq!(parsed.permissions.tools["web_search"], PermissionLevel::Allow);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            temperature: Some(5.0),
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut config = AppConfig::default();
        config.tools.timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(config.model.is_none());
    }

    #[test]
    fn loads_file_with_partial_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
model = "qwen2.5"

[provider]
kind = "anthropic"
api_key = "sk-test"

[permissions]
denied_commands = ["curl"]

[permissions.tools]
read_file = "allow"
execute_command = "deny"
"#
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.provider.kind, ProviderKind::Anthropic);
        assert_eq!(config.require_model().unwrap(), "qwen2.5");
        assert_eq!(config.permissions.denied_commands, vec!["curl"]);
        assert_eq!(config.permissions.tools["execute_command"], PermissionLevel::Deny);
        // Untouched sections keep their defaults.
        assert!(!config.permissions.denied_paths.is_empty());
        assert_eq!(config.tools.timeout_secs, 60);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = [unclosed").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn no_model_is_a_config_error() {
        let config = AppConfig::default();
        assert!(matches!(config.require_model(), Err(ConfigError::NoModelSelected)));

        let blank = AppConfig {
            model: Some("  ".into()),
            ..AppConfig::default()
        };
        assert!(blank.require_model().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::default();
        let env: HashMap<&str, &str> = [
            ("MESHTALK_MODEL", "mistral"),
            ("OLLAMA_HOST", "10.0.0.5:11434"),
            ("MESHTALK_API_KEY", "secret"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.model.as_deref(), Some("mistral"));
        assert_eq!(config.provider.effective_base_url(), "http://10.0.0.5:11434");
        assert_eq!(config.provider.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn env_provider_kind_must_be_known() {
        let mut config = AppConfig::default();
        let result = config.apply_env(|k| (k == "MESHTALK_PROVIDER").then(|| "gopher".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn api_key_redacted_in_debug() {
        let provider = ProviderConfig {
            api_key: Some("sk-very-secret".into()),
            ..ProviderConfig::default()
        };
        let debug = format!("{provider:?}");
        assert!(!debug.contains("sk-very-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn default_base_urls_per_kind() {
        let mut p = ProviderConfig::default();
        assert_eq!(p.effective_base_url(), "http://localhost:11434");
        p.kind = ProviderKind::Anthropic;
        assert_eq!(p.effective_base_url(), "https://api.anthropic.com");
        p.base_url = Some("http://proxy/".into());
        assert_eq!(p.effective_base_url(), "http://proxy");
    }
}

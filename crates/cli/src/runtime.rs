//! Wiring shared by the commands: config loading and agent assembly.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use meshtalk_agent::{AgentLoop, ApprovalMode, RequestBuilder, ToolExecutor};
use meshtalk_config::{AppConfig, ConfigError};
use meshtalk_core::event::EventBus;
use meshtalk_security::{AuditLogger, PermissionEngine, TracingSink};

/// Load `path` if given, else the default location; env overrides apply
/// either way.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => {
            let mut config = AppConfig::load_from(path)?;
            config.apply_env(|key| std::env::var(key).ok())?;
            Ok(config)
        }
        None => AppConfig::load(),
    }
}

/// Build an agent for the current directory.
pub fn build_agent(
    config: &AppConfig,
    approval: ApprovalMode,
) -> Result<AgentLoop, Box<dyn std::error::Error>> {
    let working_dir = std::env::current_dir()?;
    build_agent_in(config, approval, &working_dir)
}

pub fn build_agent_in(
    config: &AppConfig,
    approval: ApprovalMode,
    working_dir: &Path,
) -> Result<AgentLoop, Box<dyn std::error::Error>> {
    let provider = meshtalk_providers::build_provider(config)?;

    let audit = Arc::new(AuditLogger::with_sinks(vec![Box::new(TracingSink)]));
    let bus = Arc::new(EventBus::default());
    let permissions = Arc::new(
        PermissionEngine::from_config(&config.permissions, working_dir).with_audit(audit.clone()),
    );
    let catalog = Arc::new(meshtalk_tools::default_catalog(&config.tools));

    let executor = ToolExecutor::new(catalog, permissions)
        .with_approval(approval)
        .with_timeout(Duration::from_secs(config.tools.timeout_secs))
        .with_max_output_bytes(config.tools.max_output_bytes)
        .with_event_bus(bus.clone())
        .with_audit(audit);

    tracing::debug!(
        provider = provider.name(),
        working_dir = %working_dir.display(),
        tools = executor.catalog().len(),
        "Agent assembled"
    );

    Ok(
        AgentLoop::new(provider, Arc::new(executor), RequestBuilder::from_config(config))
            .with_max_rounds(config.agent.max_rounds)
            .with_event_bus(bus),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshtalk_config::ProviderKind;

    #[test]
    fn explicit_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "model = \"qwen2.5\"\n[agent]\nmax_rounds = 3\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.agent.max_rounds, 3);
        assert!(config.model.is_some());
    }

    #[tokio::test]
    async fn agent_uses_working_dir_for_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.provider.kind = ProviderKind::Ollama;
        config.model = Some("llama3.1".into());

        let agent = build_agent_in(&config, ApprovalMode::Unavailable, dir.path()).unwrap();
        assert_eq!(agent.executor().permissions().working_dir(), dir.path());
        assert_eq!(agent.provider().name(), "ollama");
        assert_eq!(agent.model(), Some("llama3.1"));
    }

    #[test]
    fn anthropic_without_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.provider.kind = ProviderKind::Anthropic;
        config.provider.api_key = None;

        assert!(build_agent_in(&config, ApprovalMode::Unavailable, dir.path()).is_err());
    }
}

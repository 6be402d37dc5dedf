//! Provider selection: builds the configured back-end.

use std::sync::Arc;

use meshtalk_config::{AppConfig, ProviderKind};
use meshtalk_core::error::ProviderError;
use meshtalk_core::provider::Provider;
use tracing::info;

use crate::anthropic::AnthropicProvider;
use crate::ollama::OllamaProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::transport::Transport;

/// Build the provider named by `config.provider`.
///
/// With a `unix_socket` set, requests go over that socket and the base URL
/// only contributes the path prefix (defaulting to `http://localhost`).
pub fn build_provider(config: &AppConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider_config = &config.provider;

    let (transport, base_url) = match &provider_config.unix_socket {
        Some(socket) => (
            Transport::unix(socket),
            provider_config
                .base_url
                .as_deref()
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "http://localhost".into()),
        ),
        None => (Transport::http(), provider_config.effective_base_url()),
    };
    info!(kind = ?provider_config.kind, base_url = %base_url, ?transport, "Building provider");

    let provider: Arc<dyn Provider> = match provider_config.kind {
        ProviderKind::Ollama => {
            Arc::new(OllamaProvider::new(base_url).with_transport(transport))
        }
        ProviderKind::OpenAi => Arc::new(
            OpenAiCompatProvider::new("openai", base_url, provider_config.api_key.clone())
                .with_transport(transport),
        ),
        ProviderKind::Anthropic => {
            let api_key = provider_config
                .api_key
                .clone()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    ProviderError::NotConfigured(
                        "the anthropic provider needs an api_key (or MESHTALK_API_KEY)".into(),
                    )
                })?;
            Arc::new(AnthropicProvider::new(base_url, api_key).with_transport(transport))
        }
    };
    Ok(provider)
}

//! Builds the provider request for a round from the conversation.

use meshtalk_config::AppConfig;
use meshtalk_core::error::Error;
use meshtalk_core::message::Conversation;
use meshtalk_core::provider::ProviderRequest;
use meshtalk_core::tool::ToolCatalog;

#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools_enabled: bool,
}

impl RequestBuilder {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            model: config.model.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            tools_enabled: config.tools.enabled,
        }
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }

    /// Serialize the model-visible history, the system prompt and, when tool
    /// use is on and the catalog has entries, the tool schemas.
    pub fn build(&self, conversation: &Conversation, catalog: &ToolCatalog) -> Result<ProviderRequest, Error> {
        let model = self
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| Error::Config {
                message: "no model selected (set `model` in config.toml or MESHTALK_MODEL)".into(),
            })?;

        let tools = if self.tools_enabled && !catalog.is_empty() {
            catalog.definitions()
        } else {
            Vec::new()
        };

        Ok(ProviderRequest {
            model: model.to_string(),
            messages: conversation.model_visible().cloned().collect(),
            system_prompt: self.system_prompt.clone().filter(|p| !p.is_empty()),
            tools,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: true,
        })
    }
}

//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI and any endpoint exposing `/chat/completions`
//! (OpenRouter, vLLM, llama.cpp server, LM Studio, Ollama's `/v1`).
//!
//! Streams SSE. Tool calls arrive as fragments keyed by index: the first
//! fragment carries the id and name, later ones append to the argument
//! text. They are assembled here and emitted as one chunk of embedded
//! calls once the choice finishes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use meshtalk_core::error::ProviderError;
use meshtalk_core::message::{Message, Role};
use meshtalk_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolDefinition, Usage,
};
use meshtalk_core::tool::ToolCall;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::framing::{DecodeError, Framing, WireDecoder, spawn_reader};
use crate::transport::Transport;
use crate::wire::{arguments_from_str, synthesize_call_id};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    transport: Transport,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            transport: Transport::http(),
        }
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", DEFAULT_BASE_URL, Some(api_key.into()))
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        self.api_key
            .iter()
            .map(|key| ("Authorization", format!("Bearer {key}")))
            .collect()
    }

    fn build_body(request: &ProviderRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(ApiMessage {
                role: "system",
                content: Some(prompt.to_string()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        messages.extend(request.messages.iter().map(to_api_message));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if request.stream {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(n);
        }
        body
    }
}

fn to_api_message(message: &Message) -> ApiMessage {
    let tool_calls: Vec<ApiToolCall> = message
        .tool_calls
        .iter()
        .map(|tc| ApiToolCall {
            id: tc.id.clone(),
            r#type: "function".into(),
            function: ApiFunction {
                name: tc.name.clone(),
                arguments: match &tc.arguments {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
            },
        })
        .collect();

    // An assistant turn that only called tools sends null content.
    let content = if message.role == Role::Assistant
        && message.content.is_empty()
        && !tool_calls.is_empty()
    {
        None
    } else {
        Some(message.content.clone())
    };

    ApiMessage {
        role: message.role.as_str(),
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<ApiToolDefinition> {
    tools
        .iter()
        .map(|t| ApiToolDefinition {
            r#type: "function".into(),
            function: ApiFunctionDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect()
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::build_body(&request);
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let headers = self.headers();
        let response = tokio::select! {
            r = self.transport.post_json(&url, &headers, &body) => r?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };
        let response = response.error_for_status().await?;

        Ok(spawn_reader(
            "openai",
            response.body,
            Framing::Sse,
            OpenAiDecoder::default(),
            cancel,
        ))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let models: ModelsResponse = self
            .transport
            .get(&url, &self.headers())
            .await?
            .error_for_status()
            .await?
            .json()
            .await?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        Ok(self.transport.get(&url, &self.headers()).await?.is_success())
    }
}

/// Tool-call fragments for one index.
#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

/// Decodes `chat.completion.chunk` SSE payloads.
#[derive(Debug, Default)]
pub struct OpenAiDecoder {
    pending: BTreeMap<u32, PartialCall>,
    usage: Option<Usage>,
}

impl OpenAiDecoder {
    fn take_calls(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.pending)
            .into_values()
            .filter(|c| !c.name.is_empty())
            .map(|c| {
                let id = if c.id.is_empty() { synthesize_call_id() } else { c.id };
                ToolCall::new(id, c.name, arguments_from_str(&c.arguments))
            })
            .collect()
    }

    fn terminal(&mut self) -> Vec<StreamChunk> {
        vec![StreamChunk {
            tool_calls: self.take_calls(),
            done: true,
            usage: self.usage.take(),
            ..StreamChunk::default()
        }]
    }
}

impl WireDecoder for OpenAiDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamChunk>, DecodeError> {
        let event: StreamResponse = serde_json::from_str(payload)?;

        if let Some(error) = event.error {
            return Err(DecodeError::Remote(ProviderError::ApiError {
                status_code: 200,
                message: error.message,
            }));
        }

        let mut chunks = Vec::new();
        for choice in event.choices {
            if let Some(delta) = choice.delta {
                if let Some(text) = delta.content.filter(|c| !c.is_empty()) {
                    chunks.push(StreamChunk::text(text));
                }
                for fragment in delta.tool_calls {
                    let entry = self.pending.entry(fragment.index).or_default();
                    if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                        entry.id = id;
                    }
                    if let Some(function) = fragment.function {
                        if let Some(name) = function.name.filter(|n| !n.is_empty()) {
                            entry.name = name;
                        }
                        if let Some(args) = function.arguments {
                            entry.arguments.push_str(&args);
                        }
                    }
                }
            }
            if choice.finish_reason.is_some() && !self.pending.is_empty() {
                let calls = self.take_calls();
                if !calls.is_empty() {
                    chunks.push(StreamChunk {
                        tool_calls: calls,
                        ..StreamChunk::default()
                    });
                }
            }
        }

        if let Some(u) = event.usage {
            let usage = Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
                ..Usage::default()
            };
            self.usage = Some(usage);
        }

        Ok(chunks)
    }

    fn done_marker(&mut self) -> Vec<StreamChunk> {
        self.terminal()
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        self.terminal()
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiFunctionDef,
}

#[derive(Debug, Serialize)]
struct ApiFunctionDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<StreamToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

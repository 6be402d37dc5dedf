//! Ollama provider: the local daemon's native `/api/chat` endpoint.
//!
//! Streams newline-delimited JSON. Tool calls arrive embedded in a normal
//! message line, usually with `done: false`, and carry no id, so one is
//! synthesized when the line is decoded.

use async_trait::async_trait;
use meshtalk_core::error::ProviderError;
use meshtalk_core::message::Role;
use meshtalk_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolDefinition, Usage,
};
use meshtalk_core::tool::ToolCall;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::framing::{DecodeError, Framing, WireDecoder, spawn_reader};
use crate::transport::Transport;
use crate::wire::{normalize_arguments, ns_to_ms, synthesize_call_id};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    base_url: String,
    transport: Transport,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport: Transport::http(),
        }
    }

    /// Reach the daemon through a Unix domain socket instead of TCP.
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    fn build_body(request: &ProviderRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(prompt) = request.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(ApiMessage {
                role: "system",
                content: prompt.to_string(),
                tool_calls: Vec::new(),
                tool_call_id: None,
            });
        }
        messages.extend(request.messages.iter().map(|m| ApiMessage {
            role: m.role.as_str(),
            content: m.content.clone(),
            tool_calls: if m.role == Role::Assistant {
                m.tool_calls
                    .iter()
                    .map(|tc| ApiToolCall {
                        id: Some(tc.id.clone()),
                        function: ApiFunction {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect()
            } else {
                Vec::new()
            },
            tool_call_id: m.tool_call_id.clone(),
        }));

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(to_api_tools(&request.tools));
        }
        let mut options = serde_json::Map::new();
        if let Some(t) = request.temperature {
            options.insert("temperature".into(), serde_json::json!(t));
        }
        if let Some(n) = request.max_tokens {
            options.insert("num_predict".into(), serde_json::json!(n));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }
        body
    }
}

fn to_api_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
    tools
        .iter()
        .map(|t| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect()
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = Self::build_body(&request);
        debug!(model = %request.model, tools = request.tools.len(), "Sending Ollama chat request");

        let response = tokio::select! {
            r = self.transport.post_json(&url, &[], &body) => r?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };
        let response = response.error_for_status().await?;

        Ok(spawn_reader(
            "ollama",
            response.body,
            Framing::Ndjson,
            OllamaDecoder,
            cancel,
        ))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let tags: TagsResponse = self.transport.get(&url, &[]).await?.error_for_status().await?.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/api/version", self.base_url);
        Ok(self.transport.get(&url, &[]).await?.is_success())
    }
}

/// Decodes `/api/chat` NDJSON lines.
pub struct OllamaDecoder;

impl WireDecoder for OllamaDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamChunk>, DecodeError> {
        let line: ChatLine = serde_json::from_str(payload)?;

        if let Some(error) = line.error {
            return Err(DecodeError::Remote(ProviderError::ApiError {
                status_code: 200,
                message: error,
            }));
        }

        let (content, tool_calls) = match line.message {
            Some(m) => (
                Some(m.content).filter(|c| !c.is_empty()),
                m.tool_calls
                    .into_iter()
                    .map(|tc| {
                        ToolCall::new(
                            tc.id.filter(|id| !id.is_empty()).unwrap_or_else(synthesize_call_id),
                            tc.function.name,
                            normalize_arguments(tc.function.arguments),
                        )
                    })
                    .collect(),
            ),
            None => (None, Vec::new()),
        };

        let usage = line.done.then(|| {
            let prompt = line.prompt_eval_count.unwrap_or(0);
            let completion = line.eval_count.unwrap_or(0);
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt.saturating_add(completion),
                prompt_eval_ms: line.prompt_eval_duration.map(ns_to_ms),
                eval_ms: line.eval_duration.map(ns_to_ms),
            }
        });

        if content.is_none() && tool_calls.is_empty() && !line.done {
            return Ok(Vec::new());
        }
        Ok(vec![StreamChunk {
            content,
            tool_use: None,
            tool_calls,
            done: line.done,
            usage,
        }])
    }
}

// --- Ollama API types (internal) ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ApiToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    prompt_eval_duration: Option<u64>,
    #[serde(default)]
    eval_duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ApiToolCall>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

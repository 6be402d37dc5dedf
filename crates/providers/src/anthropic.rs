//! Anthropic Messages API provider.
//!
//! The Messages API differs from the OpenAI shape in a few ways:
//! - System prompt is a top-level `system` field, not a message
//! - Tool results are `tool_result` content blocks on a user turn
//! - Tool use arrives as a content block whose JSON input streams in
//!   `input_json_delta` fragments; each finished block becomes one
//!   discrete `tool_use` chunk
//! - Auth uses the `x-api-key` header

use async_trait::async_trait;
use meshtalk_core::error::ProviderError;
use meshtalk_core::message::{Message, Role};
use meshtalk_core::provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, Usage};
use meshtalk_core::tool::ToolCall;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::framing::{DecodeError, Framing, WireDecoder, spawn_reader};
use crate::transport::Transport;
use crate::wire::{arguments_from_str, split_system, synthesize_call_id};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    base_url: String,
    api_key: String,
    transport: Transport,
}

impl AnthropicProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            transport: Transport::http(),
        }
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-api-key", self.api_key.clone()),
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
        ]
    }

    fn build_body(request: &ProviderRequest) -> serde_json::Value {
        let (system, history) = split_system(request);

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": to_anthropic_messages(&history),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": request.stream,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }
        if !request.tools.is_empty() {
            let tools: Vec<_> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = serde_json::json!(tools);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        body
    }
}

/// Convert history to Anthropic turns. Consecutive tool results collapse
/// into a single user turn, as the API requires results to follow the
/// assistant turn that requested them.
fn to_anthropic_messages(history: &[&Message]) -> Vec<AnthropicMessage> {
    let mut out: Vec<AnthropicMessage> = Vec::with_capacity(history.len());
    for message in history {
        match message.role {
            Role::Tool => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                    content: message.content.clone(),
                    is_error: message.is_error,
                };
                if let Some(last) = out.last_mut()
                    && last.role == "user"
                    && last.content.iter().all(|b| matches!(b, ContentBlock::ToolResult { .. }))
                {
                    last.content.push(block);
                } else {
                    out.push(AnthropicMessage {
                        role: "user",
                        content: vec![block],
                    });
                }
            }
            Role::Assistant => {
                let mut content = Vec::new();
                if !message.content.is_empty() {
                    content.push(ContentBlock::Text {
                        text: message.content.clone(),
                    });
                }
                content.extend(message.tool_calls.iter().map(|tc| ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: match &tc.arguments {
                        serde_json::Value::Object(_) => tc.arguments.clone(),
                        _ => serde_json::json!({}),
                    },
                }));
                out.push(AnthropicMessage {
                    role: "assistant",
                    content,
                });
            }
            Role::User | Role::System => out.push(AnthropicMessage {
                role: "user",
                content: vec![ContentBlock::Text {
                    text: message.content.clone(),
                }],
            }),
        }
    }
    out
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = Self::build_body(&request);
        debug!(model = %request.model, tools = request.tools.len(), "Sending Anthropic request");

        let headers = self.headers();
        let response = tokio::select! {
            r = self.transport.post_json(&url, &headers, &body) => r?,
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };
        let response = response.error_for_status().await?;

        Ok(spawn_reader(
            "anthropic",
            response.body,
            Framing::Sse,
            AnthropicDecoder::default(),
            cancel,
        ))
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/models", self.base_url);
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
        Ok(!self.api_key.is_empty())
    }
}

/// A tool-use block whose input is still streaming.
#[derive(Debug)]
struct OpenToolBlock {
    id: String,
    name: String,
    input: String,
}

/// Decodes Messages API stream events.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    open: Option<OpenToolBlock>,
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicDecoder {
    fn close_block(&mut self) -> Option<StreamChunk> {
        let block = self.open.take()?;
        let id = if block.id.is_empty() { synthesize_call_id() } else { block.id };
        Some(StreamChunk {
            tool_use: Some(ToolCall::new(id, block.name, arguments_from_str(&block.input))),
            ..StreamChunk::default()
        })
    }

    fn usage(&self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens.saturating_add(self.output_tokens),
            ..Usage::default()
        }
    }
}

impl WireDecoder for AnthropicDecoder {
    fn decode(&mut self, payload: &str) -> Result<Vec<StreamChunk>, DecodeError> {
        let event: StreamEvent = serde_json::from_str(payload)?;
        let chunks = match event {
            StreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.input_tokens;
                Vec::new()
            }
            StreamEvent::ContentBlockStart { content_block } => {
                if let StartBlock::ToolUse { id, name, input } = content_block {
                    // Some servers send the whole input up front.
                    let input = match input {
                        serde_json::Value::Object(m) if !m.is_empty() => {
                            serde_json::Value::Object(m).to_string()
                        }
                        _ => String::new(),
                    };
                    self.open = Some(OpenToolBlock { id, name, input });
                }
                Vec::new()
            }
            StreamEvent::ContentBlockDelta { delta } => match delta {
                Delta::TextDelta { text } if !text.is_empty() => vec![StreamChunk::text(text)],
                Delta::InputJsonDelta { partial_json } => {
                    if let Some(open) = self.open.as_mut() {
                        open.input.push_str(&partial_json);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            },
            StreamEvent::ContentBlockStop => self.close_block().into_iter().collect(),
            StreamEvent::MessageDelta { usage } => {
                if let Some(u) = usage {
                    self.output_tokens = u.output_tokens;
                }
                Vec::new()
            }
            StreamEvent::MessageStop => vec![StreamChunk {
                done: true,
                usage: Some(self.usage()),
                ..StreamChunk::default()
            }],
            StreamEvent::Error { error } => {
                let status_code = if error.r#type == "overloaded_error" { 529 } else { 200 };
                return Err(DecodeError::Remote(ProviderError::ApiError {
                    status_code,
                    message: error.message,
                }));
            }
            StreamEvent::Ping | StreamEvent::Other => Vec::new(),
        };
        Ok(chunks)
    }

    fn finish(&mut self) -> Vec<StreamChunk> {
        let mut chunks: Vec<_> = self.close_block().into_iter().collect();
        chunks.push(StreamChunk {
            done: true,
            usage: Some(self.usage()),
            ..StreamChunk::default()
        });
        chunks
    }
}

// --- Anthropic API types (internal) ---

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockStart {
        content_block: StartBlock,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    ContentBlockStop,
    MessageDelta {
        #[serde(default)]
        usage: Option<OutputUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: InputUsage,
}

#[derive(Debug, Default, Deserialize)]
struct InputUsage {
    #[serde(default)]
    input_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    ToolUse {
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    r#type: String,
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

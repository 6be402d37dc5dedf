//! Provider trait: the abstraction over language-model back-ends.
//!
//! A Provider opens a streaming connection for a request and yields decoded
//! chunks. Three wire shapes exist in the wild for tool calls; providers
//! decode all of them into a `StreamChunk`, and `StreamChunk::tool_signal`
//! normalizes them into a single `ToolCallSignal` the agent loop branches on.
//!
//! Implementations: Ollama (NDJSON), OpenAI-compatible (SSE), Anthropic (SSE).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::ToolCall;

/// A provider-agnostic request for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "llama3.1", "gpt-4o")
    pub model: String,

    /// Model-visible conversation history, oldest first
    pub messages: Vec<Message>,

    /// Optional system prompt, placed ahead of the history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Tools the model may call (empty when tool use is off)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether to stream the response
    #[serde(default = "default_stream")]
    pub stream: bool,
}

fn default_stream() -> bool {
    true
}

/// A tool definition sent to the model so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    #[serde(rename = "input_schema")]
    pub parameters: serde_json::Value,
}

/// Token usage and timing counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,

    /// Time spent evaluating the prompt, when the back-end reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_ms: Option<u64>,

    /// Time spent generating, when the back-end reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_ms: Option<u64>,
}

impl Usage {
    /// Fold another round's counters into a running total. Counters
    /// saturate rather than wrap.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        if let Some(ms) = other.prompt_eval_ms {
            let total = self.prompt_eval_ms.get_or_insert(0);
            *total = total.saturating_add(ms);
        }
        if let Some(ms) = other.eval_ms {
            let total = self.eval_ms.get_or_insert(0);
            *total = total.saturating_add(ms);
        }
    }
}

/// A single decoded frame of a streaming response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// A discrete, side-channel tool-use event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use: Option<ToolCall>,

    /// Tool calls embedded in a normal message chunk
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Whether this is the terminal chunk
    #[serde(default)]
    pub done: bool,

    /// Usage counters (typically only on the terminal chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn done() -> Self {
        Self {
            done: true,
            ..Self::default()
        }
    }

    /// Normalize the two tool-call wire shapes into one signal.
    ///
    /// A discrete tool-use event takes precedence over an embedded array.
    pub fn tool_signal(&self) -> ToolCallSignal {
        if let Some(call) = &self.tool_use {
            return ToolCallSignal::DiscreteToolUse(call.clone());
        }
        if !self.tool_calls.is_empty() {
            return ToolCallSignal::EmbeddedToolCalls(self.tool_calls.clone());
        }
        ToolCallSignal::None
    }
}

/// The tool-call content of one chunk, whatever its wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallSignal {
    DiscreteToolUse(ToolCall),
    EmbeddedToolCalls(Vec<ToolCall>),
    None,
}

impl ToolCallSignal {
    /// All calls carried by the signal, in emitted order.
    pub fn into_calls(self) -> Vec<ToolCall> {
        match self {
            Self::DiscreteToolUse(call) => vec![call],
            Self::EmbeddedToolCalls(calls) => calls,
            Self::None => Vec::new(),
        }
    }
}

/// Receiving end of a provider stream.
pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;

/// The core Provider trait.
///
/// The agent loop calls `stream()` without knowing which back-end is in use.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "ollama", "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a stream of decoded chunks.
    ///
    /// The returned channel closes when the response ends. Transport failures
    /// after the connection is established arrive as `Err` items. Firing
    /// `cancel` stops the reader task.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<ChunkReceiver, ProviderError>;

    /// List available models for this provider.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(Vec::new())
    }

    /// Whether the provider is reachable.
    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(true)
    }
}

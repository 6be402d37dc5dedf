//! # meshtalk core
//!
//! Domain types, traits, and error definitions for the meshtalk terminal
//! client. This crate has no transport or UI dependencies; it defines the
//! model that every other crate implements against.
//!
//! - `message`: the append-only conversation history
//! - `tool`: tool calls, results, specs and the shared `ToolCatalog`
//! - `provider`: the streaming `Provider` trait and normalized chunks
//! - `event`: a broadcast bus for domain notifications
//! - `path`: tool path normalization shared by policy and handlers

pub mod error;
pub mod event;
pub mod message;
pub mod path;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus};
pub use message::{Conversation, ConversationId, Message, Role};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolCallSignal, ToolDefinition, Usage,
};
pub use tool::{
    CatalogEntry, PermissionLevel, ToolCall, ToolCatalog, ToolCategory, ToolContext, ToolHandler,
    ToolResult, ToolSpec, truncate_output,
};

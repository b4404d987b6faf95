//! Streaming chat client for the analyst agent.
//!
//! Resolves `provider:model` identifiers into tool-binding chat capabilities
//! over plain HTTP.

mod anthropic;
mod client;
mod error;
mod openai;
mod sse;
mod types;

pub use client::{
    ChatModel, ChatStream, Gateway, LlmClient, ModelResolver, Provider, ProviderCredentials,
    parse_identifier,
};
pub use error::{LlmError, Result};
pub use types::{ChatMessage, Role, StreamChunk, ToolCall, ToolDefinition, Usage};

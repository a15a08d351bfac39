//! Shared protocol types for the LLM gateway.
//!
//! This crate defines the provider-neutral conversation model (messages,
//! content parts, tool calls and tool specs) and the strongly-typed error
//! enums shared across the workspace.

pub mod error;
pub mod message;
pub mod tool;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of canonical conversation types.
pub use message::{CanonicalMessage, ContentPart, ImageDetail, ImagePart, MessageContent, Role};
/// Re-export of tool call, tool spec and tool choice types.
pub use tool::{ToolCall, ToolChoice, ToolSpec};

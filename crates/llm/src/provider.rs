//! Provider seam shared by every backend.

use async_trait::async_trait;
use proto::{CanonicalMessage, LlmError, ToolChoice, ToolSpec};

use crate::stream::ChunkStream;
use crate::tokens::TokenUsage;

/// One request in canonical form, before provider translation.
#[derive(Debug, Clone, Copy)]
pub struct ChatTurn<'a> {
    pub model: &'a str,
    /// Full history, system messages first.
    pub messages: &'a [CanonicalMessage],
    /// Empty for plain completions.
    pub tools: &'a [ToolSpec],
    pub tool_choice: &'a ToolChoice,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Adapted provider reply.
#[derive(Debug, Clone)]
pub struct ProviderReply {
    /// Assistant message; content is `None` when the reply had no text.
    pub message: CanonicalMessage,
    /// Usage as reported by the provider, when it reported any.
    pub usage: Option<TokenUsage>,
}

/// Wire-level backend for one provider family.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Sends a non-streaming request.
    async fn complete(&self, turn: ChatTurn<'_>) -> Result<ProviderReply, LlmError>;

    /// Sends a streaming request and returns its text deltas.
    async fn stream(&self, turn: ChatTurn<'_>) -> Result<ChunkStream, LlmError>;
}

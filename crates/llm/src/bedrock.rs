//! AWS Bedrock session placeholder.
//!
//! Sessions are created and cached like any other provider, but message
//! translation is not implemented: every call fails before network I/O.

use async_trait::async_trait;
use proto::LlmError;

use crate::provider::{ChatProvider, ChatTurn, ProviderReply};
use crate::stream::ChunkStream;

/// Bedrock runtime session for one region.
#[derive(Debug, Clone)]
pub struct BedrockClient {
    region: Option<String>,
}

impl BedrockClient {
    pub fn new(region: Option<&str>) -> Self {
        Self {
            region: region.map(str::to_string),
        }
    }

    fn unimplemented(&self, operation: &str, model: &str) -> LlmError {
        LlmError::Unimplemented(format!(
            "Bedrock {operation} for model '{model}' is not implemented (region: {})",
            self.region.as_deref().unwrap_or("unset")
        ))
    }
}

#[async_trait]
impl ChatProvider for BedrockClient {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    async fn complete(&self, turn: ChatTurn<'_>) -> Result<ProviderReply, LlmError> {
        let operation = if turn.tools.is_empty() {
            "message formatting"
        } else {
            "tool calling message formatting"
        };
        Err(self.unimplemented(operation, turn.model))
    }

    async fn stream(&self, turn: ChatTurn<'_>) -> Result<ChunkStream, LlmError> {
        Err(self.unimplemented("streaming", turn.model))
    }
}

//! Provider-agnostic LLM gateway: configuration resolution, shared client
//! sessions, token accounting, retries and streaming.

pub mod anthropic;
pub mod bedrock;
pub mod config;
pub mod gateway;
pub mod models;
pub mod openai;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod stream;
pub mod tokens;

#[cfg(test)]
mod test_support;

/// Anthropic Messages API backend.
pub use anthropic::AnthropicClient;
/// Bedrock placeholder backend.
pub use bedrock::BedrockClient;
/// Configuration loading and endpoint resolution.
pub use config::{
    Config, ConfigKind, EndpointDescriptor, EnvLookup, LlmSettings, ProviderKind, process_env,
    resolve_endpoint,
};
/// Gateway facade, request types and factory.
pub use gateway::{AskRequest, GatewayFactory, ImageAskRequest, ImageInput, LlmGateway, ToolAskRequest};
/// OpenAI-compatible backend (OpenAI, Azure, DeepSeek).
pub use openai::OpenAiBackend;
/// Provider seam.
pub use provider::{ChatProvider, ChatTurn, ProviderReply};
/// Shared session cache.
pub use registry::{ClientRegistry, ProviderSession};
/// Backoff schedule and retry loop.
pub use retry::RetryPolicy;
/// Streaming collection.
pub use stream::{ChunkStream, StreamCollector};
/// Token estimation and usage counters.
pub use tokens::{TokenAccountant, TokenCounter, TokenUsage};

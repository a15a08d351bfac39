use std::time::Duration;

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

/// Errors surfaced by gateway calls.
///
/// Each variant carries its own retry classification (see [`Retryable`]);
/// nothing downstream inspects variants to decide whether to retry.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider could not be resolved or constructed.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Pre-flight input-token budget check failed.
    #[error("{0}")]
    TokenLimitExceeded(String),

    /// Empty/malformed provider reply or invalid caller input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Remote API or transport failure.
    #[error("{0}")]
    Api(String),

    /// Provider throttled the request.
    #[error("Rate limit exceeded")]
    RateLimit,

    /// The per-call timeout elapsed before the provider answered.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Provider rejected the credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The requested provider path is not implemented.
    #[error("Not supported: {0}")]
    Unimplemented(String),

    /// Provider response schema/content could not be decoded.
    #[error("Invalid response from LLM: {0}")]
    InvalidResponse(String),

    /// Request could not be built or serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Retry classification attached to an error at its origin.
pub trait Retryable {
    /// Returns `true` when repeating the same call may succeed.
    fn is_retryable(&self) -> bool;
}

impl Retryable for LlmError {
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Api(_)
            | LlmError::RateLimit
            | LlmError::Timeout(_)
            | LlmError::InvalidResponse(_) => true,
            LlmError::Configuration(_)
            | LlmError::TokenLimitExceeded(_)
            | LlmError::Validation(_)
            | LlmError::Authentication(_)
            | LlmError::Unimplemented(_)
            | LlmError::Serialization(_) => false,
        }
    }
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Invalid role string value.
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Invalid tool choice string value.
    #[error("Invalid tool choice: {0}")]
    InvalidToolChoice(String),
}

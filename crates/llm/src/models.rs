//! Model capability tables.

/// Models that take `max_completion_tokens` and reject `temperature`.
pub const REASONING_MODELS: &[&str] = &["o1", "o3-mini"];

/// Models that accept image content.
pub const MULTIMODAL_MODELS: &[&str] = &[
    "gpt-4-vision-preview",
    "gpt-4o",
    "gpt-4o-mini",
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
];

pub fn is_reasoning_model(model: &str) -> bool {
    REASONING_MODELS.contains(&model)
}

pub fn is_multimodal_model(model: &str) -> bool {
    MULTIMODAL_MODELS.contains(&model)
}

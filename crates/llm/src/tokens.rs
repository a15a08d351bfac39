//! Token estimation and cumulative usage accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use proto::{CanonicalMessage, ContentPart, ImageDetail, ImagePart, MessageContent, ToolCall, ToolSpec};
use tiktoken_rs::CoreBPE;
use tiktoken_rs::tokenizer::{Tokenizer, get_tokenizer};
use tracing::info;

/// Fixed overhead per message.
pub const BASE_MESSAGE_TOKENS: u64 = 4;
/// Fixed overhead per request.
pub const FORMAT_TOKENS: u64 = 2;
/// Flat cost of a low-detail image, also added to every tiled image.
pub const LOW_DETAIL_IMAGE_TOKENS: u64 = 85;
pub const HIGH_DETAIL_TILE_TOKENS: u64 = 170;

const MAX_IMAGE_SIZE: u32 = 2048;
const HIGH_DETAIL_TARGET_SHORT_SIDE: u32 = 768;
const TILE_SIZE: u32 = 512;
/// Cost of an image whose size or detail level is unknown.
const UNKNOWN_IMAGE_TOKENS: u64 = 1024;

/// Token counts for one call, or a snapshot of cumulative totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            input_tokens,
            completion_tokens,
        }
    }
}

/// Estimates tokens with the BPE matching a model, defaulting to `cl100k_base`.
#[derive(Clone, Copy)]
pub struct TokenCounter {
    bpe: &'static CoreBPE,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

impl TokenCounter {
    pub fn for_model(model: &str) -> Self {
        let bpe = match get_tokenizer(model) {
            Some(Tokenizer::O200kBase) => tiktoken_rs::o200k_base_singleton(),
            Some(Tokenizer::P50kBase) => tiktoken_rs::p50k_base_singleton(),
            Some(Tokenizer::P50kEdit) => tiktoken_rs::p50k_edit_singleton(),
            Some(Tokenizer::R50kBase | Tokenizer::Gpt2) => tiktoken_rs::r50k_base_singleton(),
            _ => tiktoken_rs::cl100k_base_singleton(),
        };
        Self { bpe }
    }

    pub fn count_text(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len() as u64
    }

    /// Image cost by detail level. A missing detail is costed as medium.
    pub fn count_image(&self, image: &ImagePart) -> u64 {
        match (image.detail.unwrap_or(ImageDetail::Medium), image.dimensions) {
            (ImageDetail::Low, _) => LOW_DETAIL_IMAGE_TOKENS,
            (ImageDetail::High | ImageDetail::Medium, Some((width, height))) => {
                high_detail_image_tokens(width, height)
            }
            (ImageDetail::High, None) => high_detail_image_tokens(1024, 1024),
            (ImageDetail::Medium | ImageDetail::Auto, _) => UNKNOWN_IMAGE_TOKENS,
        }
    }

    pub fn count_content(&self, content: &MessageContent) -> u64 {
        match content {
            MessageContent::Text(text) => self.count_text(text),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => self.count_text(text),
                    ContentPart::ImageUrl { image_url } => self.count_image(image_url),
                })
                .sum(),
        }
    }

    pub fn count_tool_calls(&self, calls: &[ToolCall]) -> u64 {
        calls
            .iter()
            .map(|call| self.count_text(&call.name) + self.count_text(&call.arguments))
            .sum()
    }

    /// Estimates the prompt size of a full message list.
    pub fn count_message_tokens(&self, messages: &[CanonicalMessage]) -> u64 {
        let per_message: u64 = messages
            .iter()
            .map(|message| {
                BASE_MESSAGE_TOKENS
                    + self.count_text(&message.role.to_string())
                    + message.content.as_ref().map_or(0, |c| self.count_content(c))
                    + self.count_tool_calls(&message.tool_calls)
                    + message.name.as_deref().map_or(0, |n| self.count_text(n))
                    + message
                        .tool_call_id
                        .as_deref()
                        .map_or(0, |id| self.count_text(id))
            })
            .sum();
        FORMAT_TOKENS + per_message
    }

    /// Tokens of each tool spec serialized as JSON.
    pub fn count_tool_specs(&self, tools: &[ToolSpec]) -> u64 {
        tools
            .iter()
            .map(|tool| {
                serde_json::to_string(tool)
                    .map(|json| self.count_text(&json))
                    .unwrap_or(0)
            })
            .sum()
    }
}

/// Tiled cost of a high-detail image.
///
/// The image is fitted into 2048x2048, its shorter side scaled to 768 px, then
/// covered with 512 px tiles.
pub fn high_detail_image_tokens(width: u32, height: u32) -> u64 {
    if width == 0 || height == 0 {
        return LOW_DETAIL_IMAGE_TOKENS;
    }

    let (mut width, mut height) = (f64::from(width), f64::from(height));
    let max_size = f64::from(MAX_IMAGE_SIZE);
    if width > max_size || height > max_size {
        let scale = max_size / width.max(height);
        width = (width * scale).trunc();
        height = (height * scale).trunc();
    }

    let scale = f64::from(HIGH_DETAIL_TARGET_SHORT_SIDE) / width.min(height);
    let scaled_width = (width * scale).trunc();
    let scaled_height = (height * scale).trunc();

    let tile = f64::from(TILE_SIZE);
    let tiles_x = (scaled_width / tile).ceil() as u64;
    let tiles_y = (scaled_height / tile).ceil() as u64;
    tiles_x * tiles_y * HIGH_DETAIL_TILE_TOKENS + LOW_DETAIL_IMAGE_TOKENS
}

/// Per-gateway cumulative counters plus the optional input budget.
///
/// Counters only ever increase.
#[derive(Debug)]
pub struct TokenAccountant {
    counter: TokenCounter,
    max_input_tokens: Option<u64>,
    cumulative_input: AtomicU64,
    cumulative_completion: AtomicU64,
}

impl TokenAccountant {
    pub fn new(model: &str, max_input_tokens: Option<u64>) -> Self {
        Self {
            counter: TokenCounter::for_model(model),
            max_input_tokens,
            cumulative_input: AtomicU64::new(0),
            cumulative_completion: AtomicU64::new(0),
        }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn max_input_tokens(&self) -> Option<u64> {
        self.max_input_tokens
    }

    /// Returns `true` when `input` more tokens stay within the budget.
    pub fn check_budget(&self, input: u64) -> bool {
        match self.max_input_tokens {
            Some(max) => self.cumulative_input.load(Ordering::SeqCst) + input <= max,
            None => true,
        }
    }

    pub fn limit_error_message(&self, input: u64) -> String {
        let current = self.cumulative_input.load(Ordering::SeqCst);
        match self.max_input_tokens {
            Some(max) => format!(
                "Request may exceed input token limit (Current: {current}, Needed: {input}, Max: {max})"
            ),
            None => "Token limit exceeded".to_string(),
        }
    }

    pub fn record_usage(&self, input: u64, completion: u64) {
        let cumulative_input = self.cumulative_input.fetch_add(input, Ordering::SeqCst) + input;
        let cumulative_completion =
            self.cumulative_completion.fetch_add(completion, Ordering::SeqCst) + completion;
        info!(
            input,
            completion,
            cumulative_input,
            cumulative_completion,
            total = input + completion,
            cumulative_total = cumulative_input + cumulative_completion,
            "Token usage updated"
        );
    }

    /// Adds completion tokens only; input was accounted before the call.
    pub fn record_completion(&self, completion: u64) {
        self.record_usage(0, completion);
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.cumulative_input.load(Ordering::SeqCst),
            completion_tokens: self.cumulative_completion.load(Ordering::SeqCst),
        }
    }
}

//! Anthropic Messages API backend.

use async_trait::async_trait;
use futures_util::{StreamExt, future};
use proto::{
    CanonicalMessage, ContentPart, ImagePart, LlmError, MessageContent, Role, ToolCall,
    ToolChoice, ToolSpec,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::provider::{ChatProvider, ChatTurn, ProviderReply};
use crate::stream::{ChunkStream, decode_sse};
use crate::tokens::TokenUsage;

const ANTHROPIC_API_VERSION: &str = "2023-06-01";
/// Endpoint used when the descriptor has no base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ── Request types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct AnthropicMessage {
    role: &'static str,
    content: AnthropicContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum AnthropicContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    /// Block types this client does not interpret (e.g. `thinking`).
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

// ── Response types ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: StreamDelta },
    Error { error: StreamErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: String,
}

// ── Client ─────────────────────────────────────────────────────────────────────

/// Anthropic Messages API client.
pub struct AnthropicClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    /// Creates a client; `None` targets [`DEFAULT_BASE_URL`].
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, request: &MessagesRequest) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        debug!(
            model = %request.model,
            messages = %request.messages.len(),
            tools = %request.tools.len(),
            stream = request.stream,
            "Sending request to Anthropic"
        );

        let mut req_builder = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("content-type", "application/json");

        if is_oauth_token(&self.api_key) {
            req_builder = req_builder.bearer_auth(&self.api_key);
        } else {
            req_builder = req_builder.header("x-api-key", &self.api_key);
        }

        let response = req_builder
            .json(request)
            .send()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let status = response.status();
        debug!(status = %status.as_u16(), "Anthropic response received");
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(500).collect();
        Err(match status.as_u16() {
            401 | 403 => LlmError::Authentication(format!("HTTP {status}: {preview}")),
            429 => LlmError::RateLimit,
            400 | 404 | 413 | 422 => LlmError::Validation(format!("HTTP {status}: {preview}")),
            _ => LlmError::Api(format!("HTTP {status}: {preview}")),
        })
    }
}

/// OAuth access tokens are sent as bearer tokens instead of `x-api-key`.
fn is_oauth_token(key: &str) -> bool {
    key.starts_with("sk-ant-oat")
}

#[async_trait]
impl ChatProvider for AnthropicClient {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn complete(&self, turn: ChatTurn<'_>) -> Result<ProviderReply, LlmError> {
        let request = build_request(&turn, false);
        let response = self.send(&request).await?;
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::Api(e.to_string()))?;

        let parsed: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::InvalidResponse(format!(
                "Deserialization error: {e}; body: {}",
                body.chars().take(200).collect::<String>()
            ))
        })?;
        debug!(stop_reason = ?parsed.stop_reason, blocks = parsed.content.len(), "Anthropic reply parsed");
        Ok(adapt_response(parsed))
    }

    async fn stream(&self, turn: ChatTurn<'_>) -> Result<ChunkStream, LlmError> {
        let request = build_request(&turn, true);
        let response = self.send(&request).await?;
        Ok(decode_sse(response.bytes_stream())
            .filter_map(|item| future::ready(item.and_then(stream_text).transpose()))
            .boxed())
    }
}

/// Extracts text from one SSE payload; non-text events yield `None`.
fn stream_text(data: String) -> Result<Option<String>, LlmError> {
    let event: StreamEvent = serde_json::from_str(&data)
        .map_err(|e| LlmError::InvalidResponse(format!("Malformed stream event: {e}")))?;
    match event {
        StreamEvent::ContentBlockDelta {
            delta: StreamDelta::TextDelta { text },
        } => Ok(Some(text)),
        StreamEvent::Error { error } => Err(LlmError::Api(error.message)),
        StreamEvent::ContentBlockDelta { .. } | StreamEvent::Other => Ok(None),
    }
}

// ── Conversion helpers ─────────────────────────────────────────────────────────

/// Translates a canonical turn into a Messages API request.
///
/// Tools are attached only when specs were supplied and the conversation does
/// not end with a tool result.
pub(crate) fn build_request(turn: &ChatTurn<'_>, stream: bool) -> MessagesRequest {
    let (system, messages) = convert_messages(turn.messages);
    let attach_tools = !turn.tools.is_empty() && !ends_with_tool_result(&messages);
    let (tools, tool_choice) = if attach_tools {
        (
            turn.tools.iter().map(convert_tool).collect(),
            convert_tool_choice(turn.tool_choice),
        )
    } else {
        (Vec::new(), None)
    };

    MessagesRequest {
        model: turn.model.to_string(),
        max_tokens: turn.max_tokens,
        temperature: turn.temperature,
        system,
        messages,
        tools,
        tool_choice,
        stream,
    }
}

fn ends_with_tool_result(messages: &[AnthropicMessage]) -> bool {
    messages.last().is_some_and(|last| {
        matches!(
            &last.content,
            AnthropicContent::Blocks(blocks)
                if blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult { .. }))
        )
    })
}

/// Converts canonical messages into Anthropic format.
///
/// Only the first system message is kept, as the top-level `system` field. A
/// tool message is emitted only when it directly follows the assistant turn
/// that issued the call; consecutive results for the same turn share one user
/// message.
fn convert_messages(messages: &[CanonicalMessage]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system: Option<String> = None;
    let mut seen_system = false;
    let mut result: Vec<AnthropicMessage> = Vec::new();

    let mut i = 0;
    while i < messages.len() {
        let msg = &messages[i];
        i += 1;
        match msg.role {
            Role::System => {
                if !seen_system {
                    seen_system = true;
                    system = msg.text().filter(|text| !text.is_empty());
                }
            }
            Role::User => {
                if msg.has_content() {
                    result.push(AnthropicMessage {
                        role: "user",
                        content: convert_user_content(msg.content.as_ref()),
                    });
                } else {
                    warn!(index = i - 1, "Dropping empty user message");
                }
            }
            Role::Assistant => {
                let has_text = msg.has_content();
                if has_text {
                    result.push(AnthropicMessage {
                        role: "assistant",
                        content: AnthropicContent::Text(msg.text().unwrap_or_default()),
                    });
                }
                if msg.tool_calls.is_empty() {
                    if !has_text {
                        warn!(index = i - 1, "Dropping assistant message with no content or tool calls");
                    }
                    continue;
                }

                let blocks = msg
                    .tool_calls
                    .iter()
                    .map(|tc| ContentBlock::ToolUse {
                        id: tc.id.clone(),
                        name: tc.name.clone(),
                        input: tc.arguments_value(),
                    })
                    .collect();
                result.push(AnthropicMessage {
                    role: "assistant",
                    content: AnthropicContent::Blocks(blocks),
                });

                let mut results = Vec::new();
                while let Some(next) = messages.get(i) {
                    let answers_call = next.role == Role::Tool
                        && next.tool_call_id.as_deref().is_some_and(|id| {
                            msg.tool_calls.iter().any(|tc| tc.id == id)
                        });
                    if !answers_call {
                        break;
                    }
                    results.push(ContentBlock::ToolResult {
                        tool_use_id: next.tool_call_id.clone().unwrap_or_default(),
                        content: next.text().unwrap_or_default(),
                    });
                    i += 1;
                }
                if !results.is_empty() {
                    result.push(AnthropicMessage {
                        role: "user",
                        content: AnthropicContent::Blocks(results),
                    });
                }
            }
            Role::Tool => {
                warn!(
                    index = i - 1,
                    tool_call_id = ?msg.tool_call_id,
                    "Dropping tool result without a preceding tool call"
                );
            }
        }
    }

    (system, result)
}

fn convert_user_content(content: Option<&MessageContent>) -> AnthropicContent {
    match content {
        Some(MessageContent::Parts(parts)) => AnthropicContent::Blocks(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
                    ContentPart::ImageUrl { image_url } => ContentBlock::Image {
                        source: convert_image(image_url),
                    },
                })
                .collect(),
        ),
        Some(MessageContent::Text(text)) => AnthropicContent::Text(text.clone()),
        None => AnthropicContent::Text(String::new()),
    }
}

/// `data:` URLs become inline base64 sources; anything else is fetched by URL.
fn convert_image(image: &ImagePart) -> ImageSource {
    if let Some(rest) = image.url.strip_prefix("data:")
        && let Some((media_type, data)) = rest.split_once(";base64,")
    {
        return ImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        };
    }
    ImageSource::Url {
        url: image.url.clone(),
    }
}

fn convert_tool(t: &ToolSpec) -> AnthropicTool {
    AnthropicTool {
        name: t.name.clone(),
        description: t.description.clone(),
        input_schema: t.json_schema.clone(),
    }
}

/// `auto` is the API default and is not sent.
fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => None,
        ToolChoice::None => Some(serde_json::json!({"type": "none"})),
        ToolChoice::Required => Some(serde_json::json!({"type": "any"})),
        ToolChoice::Function(name) => Some(serde_json::json!({"type": "tool", "name": name})),
    }
}

/// The last text block becomes the message text; every `tool_use` block
/// becomes a tool call.
fn adapt_response(response: MessagesResponse) -> ProviderReply {
    let mut text: Option<String> = None;
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text: value } => text = Some(value),
            ContentBlock::ToolUse { id, name, input } => {
                let arguments = if input.is_null() {
                    "{}".to_string()
                } else {
                    serde_json::to_string(&input).unwrap_or_else(|_| "{}".to_string())
                };
                tool_calls.push(ToolCall::new(id, name, arguments));
            }
            ContentBlock::Image { .. } | ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    ProviderReply {
        message: CanonicalMessage::assistant_tool_calls(text, tool_calls),
        usage: response
            .usage
            .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proto::ImageDetail;
    use serde_json::json;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall::new(id, name, r#"{"command":"ls"}"#)
    }

    fn turn<'a>(
        messages: &'a [CanonicalMessage],
        tools: &'a [ToolSpec],
        choice: &'a ToolChoice,
    ) -> ChatTurn<'a> {
        ChatTurn {
            model: "claude-3-haiku-20240307",
            messages,
            tools,
            tool_choice: choice,
            max_tokens: 1024,
            temperature: 0.0,
        }
    }

    fn bash_tool() -> ToolSpec {
        ToolSpec::new("bash", "Run shell command", json!({"type": "object"}))
    }

    // ── message conversion ─────────────────────────────────────────────────────

    #[test]
    fn first_system_message_becomes_system_field() {
        let msgs = vec![
            CanonicalMessage::system("Be helpful"),
            CanonicalMessage::system("Ignored"),
            CanonicalMessage::user("hello"),
        ];
        let (system, converted) = convert_messages(&msgs);
        assert_eq!(system.as_deref(), Some("Be helpful"));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "user");
    }

    #[test]
    fn empty_first_system_message_sends_no_system_field() {
        let msgs = vec![
            CanonicalMessage::system(""),
            CanonicalMessage::system("Ignored"),
            CanonicalMessage::user("hello"),
        ];
        let (system, converted) = convert_messages(&msgs);
        assert_eq!(system, None);
        assert_eq!(converted.len(), 1);

        let choice = ToolChoice::Auto;
        let turn = ChatTurn {
            model: "claude-3-5-sonnet-20241022",
            messages: &msgs,
            tools: &[],
            tool_choice: &choice,
            max_tokens: 256,
            temperature: 0.0,
        };
        let body = serde_json::to_value(build_request(&turn, false)).expect("serialize");
        assert!(body.get("system").is_none(), "{body}");
    }

    #[test]
    fn system_parts_are_joined_with_spaces() {
        let msgs = vec![CanonicalMessage::system(MessageContent::Parts(vec![
            ContentPart::Text { text: "You are".into() },
            ContentPart::Text { text: "terse.".into() },
        ]))];
        let (system, _) = convert_messages(&msgs);
        assert_eq!(system.as_deref(), Some("You are terse."));
    }

    #[test]
    fn tool_call_followed_by_result_yields_tool_use_then_tool_result() {
        let msgs = vec![
            CanonicalMessage::assistant_tool_calls(None, vec![call("tc1", "bash")]),
            CanonicalMessage::tool_result("tc1", "bash", "file.txt"),
        ];
        let (_, converted) = convert_messages(&msgs);
        assert_eq!(converted.len(), 2);

        assert_eq!(converted[0].role, "assistant");
        let AnthropicContent::Blocks(ref blocks) = converted[0].content else {
            panic!("expected tool_use blocks");
        };
        let ContentBlock::ToolUse { id, input, .. } = &blocks[0] else {
            panic!("expected tool_use block");
        };
        assert_eq!(id, "tc1");
        assert_eq!(input["command"], "ls");

        assert_eq!(converted[1].role, "user");
        let AnthropicContent::Blocks(ref blocks) = converted[1].content else {
            panic!("expected tool_result blocks");
        };
        assert_eq!(blocks.len(), 1);
        assert!(matches!(
            &blocks[0],
            ContentBlock::ToolResult { tool_use_id, content } if tool_use_id == "tc1" && content == "file.txt"
        ));
    }

    #[test]
    fn assistant_with_text_and_calls_is_split() {
        let msgs = vec![
            CanonicalMessage::user("go"),
            CanonicalMessage::assistant_tool_calls(Some("Let me check.".into()), vec![call("tc1", "bash")]),
        ];
        let (_, converted) = convert_messages(&msgs);
        assert_eq!(converted.len(), 3);
        assert!(matches!(&converted[1].content, AnthropicContent::Text(t) if t == "Let me check."));
        assert!(matches!(&converted[2].content, AnthropicContent::Blocks(_)));
    }

    #[test]
    fn consecutive_results_for_same_turn_share_one_user_message() {
        let msgs = vec![
            CanonicalMessage::user("start"),
            CanonicalMessage::assistant_tool_calls(None, vec![call("tc1", "bash"), call("tc2", "screen")]),
            CanonicalMessage::tool_result("tc1", "bash", "result-1"),
            CanonicalMessage::tool_result("tc2", "screen", "result-2"),
        ];

        let (_, converted) = convert_messages(&msgs);
        assert_eq!(converted.len(), 3);
        let AnthropicContent::Blocks(ref blocks) = converted[2].content else {
            panic!("expected blocks in merged user message");
        };
        assert_eq!(blocks.len(), 2);
        assert!(
            matches!(&blocks[1], ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "tc2")
        );
    }

    #[test]
    fn orphan_tool_result_is_dropped() {
        let msgs = vec![
            CanonicalMessage::user("hi"),
            CanonicalMessage::assistant("I'll help"),
            CanonicalMessage::tool_result("tc1", "bash", "output"),
        ];
        let (_, converted) = convert_messages(&msgs);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[1].role, "assistant");
    }

    #[test]
    fn result_for_unknown_call_id_is_dropped() {
        let msgs = vec![
            CanonicalMessage::assistant_tool_calls(None, vec![call("tc1", "bash")]),
            CanonicalMessage::tool_result("other", "bash", "output"),
        ];
        let (_, converted) = convert_messages(&msgs);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].role, "assistant");
    }

    #[test]
    fn empty_user_and_empty_assistant_messages_are_dropped() {
        let msgs = vec![
            CanonicalMessage::user(""),
            CanonicalMessage::assistant_tool_calls(None, vec![]),
            CanonicalMessage::user("real question"),
        ];
        let (_, converted) = convert_messages(&msgs);
        assert_eq!(converted.len(), 1);
        assert!(matches!(&converted[0].content, AnthropicContent::Text(t) if t == "real question"));
    }

    #[test]
    fn invalid_tool_arguments_become_empty_object() {
        let msgs = vec![CanonicalMessage::assistant_tool_calls(
            None,
            vec![ToolCall::new("tc1", "bash", "not json")],
        )];
        let (_, converted) = convert_messages(&msgs);
        let AnthropicContent::Blocks(ref blocks) = converted[0].content else {
            panic!("expected blocks");
        };
        assert!(matches!(&blocks[0], ContentBlock::ToolUse { input, .. } if *input == json!({})));
    }

    #[test]
    fn user_images_become_image_blocks() {
        let msgs = vec![CanonicalMessage::user(MessageContent::Parts(vec![
            ContentPart::Text { text: "what is this".into() },
            ContentPart::ImageUrl {
                image_url: ImagePart::from_base64_jpeg("QUJD").with_detail(ImageDetail::High),
            },
            ContentPart::ImageUrl {
                image_url: ImagePart::new("https://x/a.png"),
            },
        ]))];
        let (_, converted) = convert_messages(&msgs);
        let value = serde_json::to_value(&converted[0]).expect("serialize");

        let content = &value["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["source"]["type"], "base64");
        assert_eq!(content[1]["source"]["media_type"], "image/jpeg");
        assert_eq!(content[1]["source"]["data"], "QUJD");
        assert_eq!(content[2]["source"]["type"], "url");
        assert_eq!(content[2]["source"]["url"], "https://x/a.png");
    }

    // ── request building ───────────────────────────────────────────────────────

    #[test]
    fn tools_are_omitted_after_tool_result() {
        let msgs = vec![
            CanonicalMessage::user("list files"),
            CanonicalMessage::assistant_tool_calls(None, vec![call("tc1", "bash")]),
            CanonicalMessage::tool_result("tc1", "bash", "a.txt"),
        ];
        let tools = vec![bash_tool()];
        let choice = ToolChoice::Required;
        let request = build_request(&turn(&msgs, &tools, &choice), false);
        assert!(request.tools.is_empty());
        assert!(request.tool_choice.is_none());

        let value = serde_json::to_value(&request).expect("serialize");
        assert!(value.get("tools").is_none());
        assert!(value.get("stream").is_none());
    }

    #[test]
    fn tools_and_choice_attached_for_fresh_turns() {
        let msgs = vec![CanonicalMessage::user("list files")];
        let tools = vec![bash_tool()];

        let auto = ToolChoice::Auto;
        let request = build_request(&turn(&msgs, &tools, &auto), false);
        assert_eq!(request.tools.len(), 1);
        assert!(request.tool_choice.is_none());

        let required = ToolChoice::Required;
        let request = build_request(&turn(&msgs, &tools, &required), true);
        let value = serde_json::to_value(&request).expect("serialize");
        assert_eq!(value["tool_choice"]["type"], "any");
        assert_eq!(value["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(value["stream"], true);

        let named = ToolChoice::Function("bash".into());
        let request = build_request(&turn(&msgs, &tools, &named), false);
        assert_eq!(
            request.tool_choice,
            Some(json!({"type": "tool", "name": "bash"}))
        );
    }

    // ── response parsing ───────────────────────────────────────────────────────

    #[test]
    fn last_text_block_wins_and_tool_uses_become_calls() {
        let json = r#"{
            "content": [
                {"type":"text","text":"first"},
                {"type":"tool_use","id":"tu1","name":"bash","input":{"command":"ls"}},
                {"type":"text","text":"second"}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 5}
        }"#;
        let resp: MessagesResponse = serde_json::from_str(json).expect("parse");
        let reply = adapt_response(resp);

        assert_eq!(reply.message.text().as_deref(), Some("second"));
        assert_eq!(reply.message.tool_calls.len(), 1);
        assert_eq!(reply.message.tool_calls[0].arguments, r#"{"command":"ls"}"#);
        assert_eq!(reply.usage, Some(TokenUsage::new(20, 5)));
    }

    #[test]
    fn tool_use_without_input_gets_empty_arguments() {
        let json = r#"{"content":[{"type":"tool_use","id":"tu1","name":"noop"}]}"#;
        let resp: MessagesResponse = serde_json::from_str(json).expect("parse");
        let reply = adapt_response(resp);
        assert!(reply.message.content.is_none());
        assert_eq!(reply.message.tool_calls[0].arguments, "{}");
        assert!(reply.usage.is_none());
    }

    #[test]
    fn unknown_blocks_are_ignored() {
        let json = r#"{"content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"ok"}],"stop_reason":"end_turn"}"#;
        let resp: MessagesResponse = serde_json::from_str(json).expect("parse");
        assert_eq!(adapt_response(resp).message.text().as_deref(), Some("ok"));
    }

    #[test]
    fn stream_text_extracts_text_deltas_only() {
        let delta = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#;
        assert_eq!(stream_text(delta.into()).expect("delta").as_deref(), Some("Hel"));

        let json_delta = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{"}}"#;
        assert_eq!(stream_text(json_delta.into()).expect("delta"), None);

        let stop = r#"{"type":"message_stop"}"#;
        assert_eq!(stream_text(stop.into()).expect("stop"), None);

        let error = r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        assert!(matches!(stream_text(error.into()), Err(LlmError::Api(m)) if m == "Overloaded"));
    }

    #[test]
    fn client_trims_base_url_and_detects_oauth_tokens() {
        let client = AnthropicClient::new("sk-test", Some("http://localhost:8080/"));
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(AnthropicClient::new("k", None).base_url(), DEFAULT_BASE_URL);

        assert!(is_oauth_token("sk-ant-oat01-abc123"));
        assert!(!is_oauth_token("sk-ant-api03-abc123"));
    }
}

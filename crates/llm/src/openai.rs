//! OpenAI chat-completions backend, shared by Azure and compatible hosts.

use std::time::Duration;

use async_openai::{
    Client,
    config::{AzureConfig, Config, OpenAIConfig},
    error::OpenAIError,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionNamedToolChoice,
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestMessageContentPartImageArgs,
        ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs,
        ChatCompletionRequestUserMessageContentPart, ChatCompletionTool,
        ChatCompletionToolChoiceOption, ChatCompletionToolType, CreateChatCompletionRequest,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, FunctionCall,
        FunctionName, FunctionObjectArgs, ImageDetail as WireImageDetail, ImageUrlArgs,
    },
};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use futures_util::{StreamExt, future};
use proto::{
    CanonicalMessage, ContentPart, ImageDetail, LlmError, MessageContent, Role, ToolCall,
    ToolChoice, ToolSpec,
};
use tracing::debug;

use crate::models::is_reasoning_model;
use crate::provider::{ChatProvider, ChatTurn, ProviderReply};
use crate::stream::ChunkStream;
use crate::tokens::TokenUsage;

/// Used when an Azure endpoint has no explicit `api_version`.
pub const DEFAULT_AZURE_API_VERSION: &str = "2024-06-01";

/// Disables async-openai's built-in backoff; `RetryPolicy` owns retries.
fn single_attempt<C: Config>(config: C) -> Client<C> {
    let no_backoff = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build();
    Client::with_config(config).with_backoff(no_backoff)
}

/// Chat-completions client over any async-openai configuration.
pub struct OpenAiBackend<C: Config> {
    client: Client<C>,
    name: &'static str,
}

impl OpenAiBackend<OpenAIConfig> {
    /// Creates a client for OpenAI or an OpenAI-compatible host.
    pub fn new(api_key: &str, base_url: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base_url) = base_url {
            config = config.with_api_base(base_url);
        }
        Self {
            client: single_attempt(config),
            name: "openai",
        }
    }
}

impl OpenAiBackend<AzureConfig> {
    /// Creates a client for one Azure OpenAI deployment.
    pub fn azure(
        api_key: &str,
        endpoint: Option<&str>,
        deployment: &str,
        api_version: Option<&str>,
    ) -> Self {
        let config = AzureConfig::new()
            .with_api_base(endpoint.unwrap_or_default())
            .with_api_key(api_key)
            .with_deployment_id(deployment)
            .with_api_version(api_version.unwrap_or(DEFAULT_AZURE_API_VERSION));
        Self {
            client: single_attempt(config),
            name: "azure",
        }
    }
}

#[async_trait]
impl<C> ChatProvider for OpenAiBackend<C>
where
    C: Config + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn complete(&self, turn: ChatTurn<'_>) -> Result<ProviderReply, LlmError> {
        let request = build_request(&turn, false)?;
        debug!(
            provider = self.name,
            model = %turn.model,
            messages = %turn.messages.len(),
            tools = %turn.tools.len(),
            "Sending request to OpenAI"
        );

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(classify_error)?;
        adapt_response(response)
    }

    async fn stream(&self, turn: ChatTurn<'_>) -> Result<ChunkStream, LlmError> {
        let request = build_request(&turn, true)?;
        debug!(
            provider = self.name,
            model = %turn.model,
            messages = %turn.messages.len(),
            "Opening OpenAI stream"
        );

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(classify_error)?;

        Ok(stream
            .filter_map(|item| {
                future::ready(match item {
                    Ok(chunk) => chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|choice| choice.delta.content)
                        .filter(|text| !text.is_empty())
                        .map(Ok),
                    Err(err) => Some(Err(classify_error(err))),
                })
            })
            .boxed())
    }
}

/// Builds the typed request. Reasoning models take `max_completion_tokens`
/// and no temperature; tools and tool choice are sent only with tools.
pub(crate) fn build_request(
    turn: &ChatTurn<'_>,
    stream: bool,
) -> Result<CreateChatCompletionRequest, LlmError> {
    let messages: Vec<ChatCompletionRequestMessage> = turn
        .messages
        .iter()
        .map(convert_message)
        .collect::<Result<_, _>>()?;

    let mut builder = CreateChatCompletionRequestArgs::default();
    builder.model(turn.model).messages(messages);

    if is_reasoning_model(turn.model) {
        builder.max_completion_tokens(turn.max_tokens);
    } else {
        builder
            .max_tokens(turn.max_tokens)
            .temperature(turn.temperature);
    }

    if !turn.tools.is_empty() {
        let tools: Vec<ChatCompletionTool> = turn
            .tools
            .iter()
            .map(convert_tool)
            .collect::<Result<_, _>>()?;
        builder
            .tools(tools)
            .tool_choice(convert_tool_choice(turn.tool_choice));
    }

    if stream {
        builder.stream(true);
    }

    builder
        .build()
        .map_err(|e| LlmError::Serialization(e.to_string()))
}

fn serialization(err: OpenAIError) -> LlmError {
    LlmError::Serialization(err.to_string())
}

/// Converts a canonical message into the OpenAI request format.
fn convert_message(m: &CanonicalMessage) -> Result<ChatCompletionRequestMessage, LlmError> {
    let text = m.text().unwrap_or_default();
    match m.role {
        Role::System => {
            let mut builder = ChatCompletionRequestSystemMessageArgs::default();
            builder.content(text);
            if let Some(name) = &m.name {
                builder.name(name.clone());
            }
            Ok(ChatCompletionRequestMessage::System(
                builder.build().map_err(serialization)?,
            ))
        }
        Role::User => {
            let mut builder = ChatCompletionRequestUserMessageArgs::default();
            match &m.content {
                Some(MessageContent::Parts(parts)) => {
                    let parts: Vec<ChatCompletionRequestUserMessageContentPart> =
                        parts.iter().map(convert_part).collect::<Result<_, _>>()?;
                    builder.content(parts);
                }
                _ => {
                    builder.content(text);
                }
            }
            if let Some(name) = &m.name {
                builder.name(name.clone());
            }
            Ok(ChatCompletionRequestMessage::User(
                builder.build().map_err(serialization)?,
            ))
        }
        Role::Assistant => {
            let mut builder = ChatCompletionRequestAssistantMessageArgs::default();
            if m.has_content() {
                builder.content(text);
            }
            if let Some(name) = &m.name {
                builder.name(name.clone());
            }
            if !m.tool_calls.is_empty() {
                let calls: Vec<ChatCompletionMessageToolCall> = m
                    .tool_calls
                    .iter()
                    .map(|tc| ChatCompletionMessageToolCall {
                        id: tc.id.clone(),
                        r#type: ChatCompletionToolType::Function,
                        function: FunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect();
                builder.tool_calls(calls);
            }
            Ok(ChatCompletionRequestMessage::Assistant(
                builder.build().map_err(serialization)?,
            ))
        }
        Role::Tool => {
            let call_id = m
                .tool_call_id
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            Ok(ChatCompletionRequestMessage::Tool(
                ChatCompletionRequestToolMessageArgs::default()
                    .tool_call_id(call_id)
                    .content(text)
                    .build()
                    .map_err(serialization)?,
            ))
        }
    }
}

fn convert_part(part: &ContentPart) -> Result<ChatCompletionRequestUserMessageContentPart, LlmError> {
    match part {
        ContentPart::Text { text } => Ok(ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartTextArgs::default()
                .text(text.clone())
                .build()
                .map_err(serialization)?,
        )),
        ContentPart::ImageUrl { image_url } => {
            let mut url = ImageUrlArgs::default();
            url.url(image_url.url.clone());
            if let Some(detail) = image_url.detail {
                url.detail(convert_detail(detail));
            }
            Ok(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                ChatCompletionRequestMessageContentPartImageArgs::default()
                    .image_url(url.build().map_err(serialization)?)
                    .build()
                    .map_err(serialization)?,
            ))
        }
    }
}

/// The chat API has no `medium` level; it is sent as `auto`.
fn convert_detail(detail: ImageDetail) -> WireImageDetail {
    match detail {
        ImageDetail::Low => WireImageDetail::Low,
        ImageDetail::High => WireImageDetail::High,
        ImageDetail::Medium | ImageDetail::Auto => WireImageDetail::Auto,
    }
}

/// Converts a tool spec into an OpenAI function-tool declaration.
fn convert_tool(t: &ToolSpec) -> Result<ChatCompletionTool, LlmError> {
    Ok(ChatCompletionTool {
        r#type: ChatCompletionToolType::Function,
        function: FunctionObjectArgs::default()
            .name(t.name.clone())
            .description(t.description.clone())
            .parameters(t.json_schema.clone())
            .build()
            .map_err(serialization)?,
    })
}

fn convert_tool_choice(choice: &ToolChoice) -> ChatCompletionToolChoiceOption {
    match choice {
        ToolChoice::None => ChatCompletionToolChoiceOption::None,
        ToolChoice::Auto => ChatCompletionToolChoiceOption::Auto,
        ToolChoice::Required => ChatCompletionToolChoiceOption::Required,
        ToolChoice::Function(name) => {
            ChatCompletionToolChoiceOption::Named(ChatCompletionNamedToolChoice {
                r#type: ChatCompletionToolType::Function,
                function: FunctionName { name: name.clone() },
            })
        }
    }
}

/// Adapts the first choice into a canonical assistant message.
pub(crate) fn adapt_response(
    response: CreateChatCompletionResponse,
) -> Result<ProviderReply, LlmError> {
    let usage = response.usage.as_ref().map(|u| {
        TokenUsage::new(u64::from(u.prompt_tokens), u64::from(u.completion_tokens))
    });
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse("No choices in response".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
        .collect();

    Ok(ProviderReply {
        message: CanonicalMessage::assistant_tool_calls(choice.message.content, tool_calls),
        usage,
    })
}

fn is_authentication_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["api key", "api_key", "authentication", "unauthorized", "access denied", "subscription key"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Maps async-openai failures onto the gateway taxonomy.
pub(crate) fn classify_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            debug!(error = %api.message, "OpenAI API error");
            let lower = api.message.to_lowercase();
            if is_authentication_failure(&api.message) {
                LlmError::Authentication(api.message)
            } else if lower.contains("rate limit") {
                LlmError::RateLimit
            } else {
                let hint = if lower.contains("does not exist") || lower.contains("model_not_found")
                {
                    " Check the configured model name."
                } else if lower.contains("billing") || lower.contains("quota") {
                    " Check your provider billing and quota."
                } else {
                    ""
                };
                LlmError::Api(format!("{}{hint}", api.message))
            }
        }
        OpenAIError::Reqwest(e) => match e.status().map(|s| s.as_u16()) {
            Some(401 | 403) => LlmError::Authentication(e.to_string()),
            Some(429) => LlmError::RateLimit,
            _ => LlmError::Api(e.to_string()),
        },
        OpenAIError::JSONDeserialize(e) => LlmError::InvalidResponse(e.to_string()),
        OpenAIError::InvalidArgument(msg) => LlmError::Serialization(msg),
        other => LlmError::Api(other.to_string()),
    }
}

//! Gateway facade and the factory that owns shared state.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proto::{CanonicalMessage, ContentPart, ImagePart, LlmError, MessageContent, Role, ToolChoice, ToolSpec};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

use crate::config::{Config, ConfigKind, EndpointDescriptor, EnvLookup, LlmSettings, process_env, resolve_endpoint};
use crate::models::{MULTIMODAL_MODELS, is_multimodal_model};
use crate::provider::{ChatTurn, ProviderReply};
use crate::registry::{ClientRegistry, ProviderSession};
use crate::retry::RetryPolicy;
use crate::stream::StreamCollector;
use crate::tokens::{TokenAccountant, TokenUsage};

/// Default per-call timeout for [`LlmGateway::ask_tool`].
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

/// Plain text completion request.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub messages: Vec<CanonicalMessage>,
    /// Prepended to `messages`.
    pub system_msgs: Vec<CanonicalMessage>,
    /// Defaults to `true`.
    pub stream: bool,
    /// Overrides the endpoint temperature.
    pub temperature: Option<f32>,
    /// Receives streamed chunks as they arrive.
    ///
    /// Each retried attempt streams from the start again, so after a failure
    /// mid-stream the sink sees the partial text of the failed attempt
    /// followed by every chunk of the next one. The returned text holds only
    /// the successful attempt.
    pub sink: Option<UnboundedSender<String>>,
}

impl AskRequest {
    pub fn new(messages: Vec<CanonicalMessage>) -> Self {
        Self {
            messages,
            system_msgs: Vec::new(),
            stream: true,
            temperature: None,
            sink: None,
        }
    }

    pub fn with_system(mut self, system_msgs: Vec<CanonicalMessage>) -> Self {
        self.system_msgs = system_msgs;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_sink(mut self, sink: UnboundedSender<String>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Image attached by [`LlmGateway::ask_with_images`].
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    Url(String),
    Part(ImagePart),
}

impl ImageInput {
    fn into_part(self) -> ImagePart {
        match self {
            ImageInput::Url(url) => ImagePart::new(url),
            ImageInput::Part(part) => part,
        }
    }
}

impl From<&str> for ImageInput {
    fn from(url: &str) -> Self {
        ImageInput::Url(url.to_string())
    }
}

impl From<String> for ImageInput {
    fn from(url: String) -> Self {
        ImageInput::Url(url)
    }
}

impl From<ImagePart> for ImageInput {
    fn from(part: ImagePart) -> Self {
        ImageInput::Part(part)
    }
}

/// Multimodal completion request; images are appended to the last user
/// message.
#[derive(Debug, Clone)]
pub struct ImageAskRequest {
    pub messages: Vec<CanonicalMessage>,
    pub images: Vec<ImageInput>,
    pub system_msgs: Vec<CanonicalMessage>,
    /// Defaults to `false`.
    pub stream: bool,
    pub temperature: Option<f32>,
    /// Same semantics as [`AskRequest::sink`], including replay on retry.
    pub sink: Option<UnboundedSender<String>>,
}

impl ImageAskRequest {
    pub fn new(messages: Vec<CanonicalMessage>, images: Vec<ImageInput>) -> Self {
        Self {
            messages,
            images,
            system_msgs: Vec::new(),
            stream: false,
            temperature: None,
            sink: None,
        }
    }

    pub fn with_system(mut self, system_msgs: Vec<CanonicalMessage>) -> Self {
        self.system_msgs = system_msgs;
        self
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_sink(mut self, sink: UnboundedSender<String>) -> Self {
        self.sink = Some(sink);
        self
    }
}

/// Tool-calling request. Never streamed.
#[derive(Debug, Clone)]
pub struct ToolAskRequest {
    pub messages: Vec<CanonicalMessage>,
    pub system_msgs: Vec<CanonicalMessage>,
    /// Applies to each provider call.
    pub timeout: Duration,
    pub tools: Vec<ToolSpec>,
    pub tool_choice: ToolChoice,
    pub temperature: Option<f32>,
}

impl ToolAskRequest {
    pub fn new(messages: Vec<CanonicalMessage>, tools: Vec<ToolSpec>) -> Self {
        Self {
            messages,
            system_msgs: Vec::new(),
            timeout: DEFAULT_TOOL_TIMEOUT,
            tools,
            tool_choice: ToolChoice::Auto,
            temperature: None,
        }
    }

    pub fn with_system(mut self, system_msgs: Vec<CanonicalMessage>) -> Self {
        self.system_msgs = system_msgs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = tool_choice;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// One configured endpoint: descriptor, shared session, usage counters and
/// retry policy. Obtained from [`GatewayFactory::gateway`].
pub struct LlmGateway {
    name: String,
    kind: ConfigKind,
    descriptor: EndpointDescriptor,
    session: Arc<ProviderSession>,
    tokens: TokenAccountant,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmGateway")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("descriptor", &self.descriptor)
            .field("usage", &self.tokens.usage())
            .finish()
    }
}

impl LlmGateway {
    fn new(
        name: &str,
        kind: ConfigKind,
        descriptor: EndpointDescriptor,
        session: Arc<ProviderSession>,
        retry: RetryPolicy,
    ) -> Self {
        let tokens = TokenAccountant::new(&descriptor.model, descriptor.max_input_tokens);
        Self {
            name: name.to_string(),
            kind,
            descriptor,
            session,
            tokens,
            retry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config_kind(&self) -> ConfigKind {
        self.kind
    }

    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn session(&self) -> &Arc<ProviderSession> {
        &self.session
    }

    pub fn tokens(&self) -> &TokenAccountant {
        &self.tokens
    }

    /// Cumulative usage since the gateway was created.
    pub fn usage(&self) -> TokenUsage {
        self.tokens.usage()
    }

    pub fn supports_images(&self) -> bool {
        is_multimodal_model(&self.descriptor.model)
    }

    /// Sends a text completion and returns the reply text.
    ///
    /// # Errors
    /// [`LlmError::TokenLimitExceeded`] before any network call when the
    /// input budget would be exceeded, [`LlmError::Validation`] for an empty
    /// reply, or the last provider error once retries are exhausted.
    pub async fn ask(&self, request: AskRequest) -> Result<String, LlmError> {
        let request = &request;
        let result = self.retry.run(move || self.ask_once(request)).await;
        self.log_failure("ask", &result);
        result
    }

    /// Sends a completion with images appended to the last user message.
    ///
    /// # Errors
    /// [`LlmError::Validation`] when the model is not multimodal or the last
    /// message is not user-authored; otherwise as [`LlmGateway::ask`].
    pub async fn ask_with_images(&self, request: ImageAskRequest) -> Result<String, LlmError> {
        let request = &request;
        let result = self.retry.run(move || self.ask_with_images_once(request)).await;
        self.log_failure("ask_with_images", &result);
        result
    }

    /// Sends a tool-calling turn and returns the assistant message, or
    /// `None` when the reply carried neither text nor tool calls.
    ///
    /// # Errors
    /// [`LlmError::Timeout`] when a call exceeds `request.timeout`;
    /// otherwise as [`LlmGateway::ask`].
    pub async fn ask_tool(
        &self,
        request: ToolAskRequest,
    ) -> Result<Option<CanonicalMessage>, LlmError> {
        let request = &request;
        let result = self.retry.run(move || self.ask_tool_once(request)).await;
        self.log_failure("ask_tool", &result);
        result
    }

    async fn ask_once(&self, request: &AskRequest) -> Result<String, LlmError> {
        let messages = self.prepare(&request.system_msgs, &request.messages);
        self.complete_text(
            &messages,
            request.temperature,
            request.stream,
            request.sink.as_ref(),
        )
        .await
    }

    async fn ask_with_images_once(&self, request: &ImageAskRequest) -> Result<String, LlmError> {
        if !self.supports_images() {
            return Err(LlmError::Validation(format!(
                "Model {} does not support images. Use a model from {MULTIMODAL_MODELS:?}",
                self.descriptor.model
            )));
        }

        let mut messages = self.prepare(&request.system_msgs, &request.messages);
        let Some(last) = messages
            .last_mut()
            .filter(|m| m.role == Role::User && !request.messages.is_empty())
        else {
            return Err(LlmError::Validation(
                "The last message must be from the user to attach images".to_string(),
            ));
        };
        attach_images(last, &request.images);

        self.complete_text(
            &messages,
            request.temperature,
            request.stream,
            request.sink.as_ref(),
        )
        .await
    }

    async fn ask_tool_once(
        &self,
        request: &ToolAskRequest,
    ) -> Result<Option<CanonicalMessage>, LlmError> {
        let messages = self.prepare(&request.system_msgs, &request.messages);
        let counter = self.tokens.counter();
        let input =
            counter.count_message_tokens(&messages) + counter.count_tool_specs(&request.tools);
        self.ensure_budget(input)?;

        let turn = self.turn(
            &messages,
            &request.tools,
            &request.tool_choice,
            request.temperature,
        );
        let reply = tokio::time::timeout(request.timeout, self.session.provider().complete(turn))
            .await
            .map_err(|_| LlmError::Timeout(request.timeout))??;
        self.record_reply_usage(&reply, input);

        if !reply.message.has_content() && reply.message.tool_calls.is_empty() {
            debug!(model = %self.descriptor.model, "Tool turn returned neither text nor tool calls");
            return Ok(None);
        }
        Ok(Some(reply.message))
    }

    /// Shared text path of `ask` and `ask_with_images`.
    async fn complete_text(
        &self,
        messages: &[CanonicalMessage],
        temperature: Option<f32>,
        stream: bool,
        sink: Option<&UnboundedSender<String>>,
    ) -> Result<String, LlmError> {
        let input = self.tokens.counter().count_message_tokens(messages);
        self.ensure_budget(input)?;

        let tool_choice = ToolChoice::Auto;
        let turn = self.turn(messages, &[], &tool_choice, temperature);
        let provider = self.session.provider();

        if stream {
            self.tokens.record_usage(input, 0);
            let chunks = provider.stream(turn).await?;
            return StreamCollector::new(&self.tokens)
                .with_sink(sink)
                .collect(chunks)
                .await;
        }

        let reply = provider.complete(turn).await?;
        let text = reply
            .message
            .text()
            .filter(|text| !text.is_empty())
            .ok_or_else(|| LlmError::Validation("Empty or invalid response from LLM".to_string()))?;
        self.record_reply_usage(&reply, input);
        Ok(text)
    }

    /// Prepends system messages and folds attached screenshots.
    fn prepare(
        &self,
        system_msgs: &[CanonicalMessage],
        messages: &[CanonicalMessage],
    ) -> Vec<CanonicalMessage> {
        let supports_images = self.supports_images();
        system_msgs
            .iter()
            .chain(messages)
            .cloned()
            .map(|m| m.fold_base64_image(supports_images))
            .collect()
    }

    fn turn<'a>(
        &'a self,
        messages: &'a [CanonicalMessage],
        tools: &'a [ToolSpec],
        tool_choice: &'a ToolChoice,
        temperature: Option<f32>,
    ) -> ChatTurn<'a> {
        ChatTurn {
            model: &self.descriptor.model,
            messages,
            tools,
            tool_choice,
            max_tokens: self.descriptor.max_output_tokens,
            temperature: temperature.unwrap_or(self.descriptor.temperature),
        }
    }

    fn ensure_budget(&self, input: u64) -> Result<(), LlmError> {
        if self.tokens.check_budget(input) {
            Ok(())
        } else {
            Err(LlmError::TokenLimitExceeded(
                self.tokens.limit_error_message(input),
            ))
        }
    }

    /// Records provider-reported usage, or the local estimate when the
    /// provider reported none.
    fn record_reply_usage(&self, reply: &ProviderReply, estimated_input: u64) {
        match reply.usage {
            Some(usage) => self
                .tokens
                .record_usage(usage.input_tokens, usage.completion_tokens),
            None => {
                let counter = self.tokens.counter();
                let completion = reply.message.content.as_ref().map_or(0, |c| counter.count_content(c))
                    + counter.count_tool_calls(&reply.message.tool_calls);
                self.tokens.record_usage(estimated_input, completion);
            }
        }
    }

    fn log_failure<T>(&self, operation: &'static str, result: &Result<T, LlmError>) {
        match result {
            Ok(_) => {}
            Err(LlmError::TokenLimitExceeded(message)) => {
                debug!(operation, model = %self.descriptor.model, %message, "Input token budget exhausted");
            }
            Err(err) => {
                error!(operation, model = %self.descriptor.model, error = %err, "LLM call failed");
            }
        }
    }
}

fn attach_images(message: &mut CanonicalMessage, images: &[ImageInput]) {
    let mut parts = message
        .content
        .take()
        .map(MessageContent::into_parts)
        .unwrap_or_default();
    parts.extend(images.iter().cloned().map(|image| ContentPart::ImageUrl {
        image_url: image.into_part(),
    }));
    message.content = Some(MessageContent::Parts(parts));
}

/// Composition root: owns the configuration, the client registry and one
/// gateway per `(kind, name)`.
pub struct GatewayFactory {
    config: Config,
    env: EnvLookup,
    registry: Arc<ClientRegistry>,
    retry: RetryPolicy,
    instances: Mutex<HashMap<(ConfigKind, String), Arc<LlmGateway>>>,
}

impl GatewayFactory {
    /// Creates a factory reading overrides from the process environment.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            env: process_env(),
            registry: Arc::new(ClientRegistry::new()),
            retry: RetryPolicy::default(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the environment lookup used during resolution.
    pub fn with_env(mut self, env: EnvLookup) -> Self {
        self.env = env;
        self
    }

    /// Shares an existing registry with other factories.
    pub fn with_registry(mut self, registry: Arc<ClientRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Resolves a descriptor without creating a gateway.
    pub fn resolve(&self, kind: ConfigKind, name: &str) -> EndpointDescriptor {
        self.config.resolve(kind, name, &*self.env)
    }

    /// Returns the shared gateway for `(kind, name)`, creating it once.
    pub fn gateway(&self, kind: ConfigKind, name: &str) -> Arc<LlmGateway> {
        self.gateway_inner(kind, name, None)
    }

    /// Like [`GatewayFactory::gateway`], but a first-time creation uses
    /// `settings` instead of the configured block.
    pub fn gateway_with_settings(
        &self,
        kind: ConfigKind,
        name: &str,
        settings: LlmSettings,
    ) -> Arc<LlmGateway> {
        self.gateway_inner(kind, name, Some(settings))
    }

    fn gateway_inner(
        &self,
        kind: ConfigKind,
        name: &str,
        settings: Option<LlmSettings>,
    ) -> Arc<LlmGateway> {
        let mut instances = self.instances.lock();
        match instances.entry((kind, name.to_string())) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let settings = settings.unwrap_or_else(|| self.config.settings(kind, name));
                let descriptor = resolve_endpoint(&settings, kind, &*self.env);
                let session = self.registry.get_or_create(&descriptor);
                info!(
                    name,
                    config_kind = %kind,
                    provider = %descriptor.provider_kind,
                    model = %descriptor.model,
                    "LLM gateway created"
                );
                let gateway = Arc::new(LlmGateway::new(
                    name,
                    kind,
                    descriptor,
                    session,
                    self.retry.clone(),
                ));
                Arc::clone(entry.insert(gateway))
            }
        }
    }
}

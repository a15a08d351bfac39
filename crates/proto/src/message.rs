use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message authored by an end user.
    User,
    /// Message authored by the assistant.
    Assistant,
    /// System-level instruction message.
    System,
    /// Tool execution result message.
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = crate::error::ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(crate::error::ProtoError::InvalidRole(other.to_string())),
        }
    }
}

/// Requested image fidelity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    Medium,
    High,
    Auto,
}

/// An image reference inside a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePart {
    /// Remote URL or `data:` URL.
    pub url: String,
    /// Fidelity hint; `None` is costed as medium.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
    /// Pixel dimensions `(width, height)` when the caller knows them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<(u32, u32)>,
}

impl ImagePart {
    /// Creates an image reference with no detail hint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            detail: None,
            dimensions: None,
        }
    }

    /// Wraps raw base64 JPEG bytes into a `data:` URL image.
    pub fn from_base64_jpeg(data: &str) -> Self {
        Self::new(format!("data:image/jpeg;base64,{data}"))
    }

    pub fn with_detail(mut self, detail: ImageDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.dimensions = Some((width, height));
        self
    }
}

/// One element of a multi-part message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImagePart },
}

/// Message body: plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Returns `true` for an empty string or an empty part list.
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Concatenates the text parts, separated by single spaces.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Converts into a part list, wrapping plain text as a single text part.
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(text) if text.is_empty() => Vec::new(),
            MessageContent::Text(text) => vec![ContentPart::Text { text }],
            MessageContent::Parts(parts) => parts,
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

/// Provider-neutral chat message, serialized in the OpenAI chat shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    /// Assistant tool calls, in emission order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Call id answered by a `tool` message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Screenshot attached by the caller; folded into the content for
    /// multimodal models and dropped otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_image: Option<String>,
}

impl CanonicalMessage {
    fn with_role(role: Role, content: Option<MessageContent>) -> Self {
        Self {
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            base64_image: None,
        }
    }

    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::System, Some(content.into()))
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::User, Some(content.into()))
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::Assistant, Some(content.into()))
    }

    /// Creates an assistant message carrying tool calls and optional text.
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::with_role(Role::Assistant, content.map(MessageContent::Text))
        }
    }

    /// Creates a tool result message for the given tool call.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
            ..Self::with_role(Role::Tool, Some(MessageContent::Text(content.into())))
        }
    }

    pub fn with_base64_image(mut self, data: impl Into<String>) -> Self {
        self.base64_image = Some(data.into());
        self
    }

    /// Returns `true` when the message has a non-empty body.
    pub fn has_content(&self) -> bool {
        self.content.as_ref().is_some_and(|content| !content.is_empty())
    }

    /// Text of the body, or `None` when there is no body.
    pub fn text(&self) -> Option<String> {
        self.content.as_ref().map(MessageContent::text)
    }

    /// Moves `base64_image` into the content as a trailing image part.
    ///
    /// When `supports_images` is false the screenshot is discarded.
    pub fn fold_base64_image(mut self, supports_images: bool) -> Self {
        let Some(data) = self.base64_image.take() else {
            return self;
        };
        if !supports_images {
            return self;
        }

        let mut parts = self
            .content
            .take()
            .map(MessageContent::into_parts)
            .unwrap_or_default();
        parts.push(ContentPart::ImageUrl {
            image_url: ImagePart::from_base64_jpeg(&data),
        });
        self.content = Some(MessageContent::Parts(parts));
        self
    }
}

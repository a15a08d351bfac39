use serde::{Deserialize, Serialize};

/// A function call requested by the assistant.
///
/// Serializes in the OpenAI `{id, type: "function", function: {name,
/// arguments}}` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WireToolCall", into = "WireToolCall")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON-encoded arguments.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Parses the arguments, falling back to an empty object when they are
    /// not a JSON object.
    pub fn arguments_value(&self) -> serde_json::Value {
        match serde_json::from_str::<serde_json::Value>(&self.arguments) {
            Ok(value @ serde_json::Value::Object(_)) => value,
            _ => serde_json::Value::Object(Default::default()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl From<WireToolCall> for ToolCall {
    fn from(wire: WireToolCall) -> Self {
        Self {
            id: wire.id,
            name: wire.function.name,
            arguments: wire.function.arguments,
        }
    }
}

impl From<ToolCall> for WireToolCall {
    fn from(call: ToolCall) -> Self {
        Self {
            id: call.id,
            kind: function_type(),
            function: WireFunction {
                name: call.name,
                arguments: call.arguments,
            },
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments object.
    #[serde(rename = "parameters")]
    pub json_schema: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        json_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            json_schema,
        }
    }
}

/// How the model is allowed to pick tools.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ToolChoice {
    None,
    #[default]
    Auto,
    Required,
    /// Force a call to the named function.
    Function(String),
}

impl std::fmt::Display for ToolChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolChoice::None => write!(f, "none"),
            ToolChoice::Auto => write!(f, "auto"),
            ToolChoice::Required => write!(f, "required"),
            ToolChoice::Function(name) => write!(f, "{name}"),
        }
    }
}

impl std::str::FromStr for ToolChoice {
    type Err = crate::error::ProtoError;

    /// Parses `none`, `auto` and `required`; any other non-empty value names a
    /// function.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" => Ok(ToolChoice::None),
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Required),
            "" => Err(crate::error::ProtoError::InvalidToolChoice(s.to_string())),
            name => Ok(ToolChoice::Function(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn arguments_value_parses_object() {
        let call = ToolCall::new("c1", "search", r#"{"q":"tokio"}"#);
        assert_eq!(call.arguments_value()["q"], "tokio");
    }

    #[test]
    fn arguments_value_falls_back_to_empty_object() {
        for raw in ["not json", "[1,2]", "", "null"] {
            let call = ToolCall::new("c1", "search", raw);
            assert_eq!(call.arguments_value(), serde_json::json!({}), "input: {raw}");
        }
    }

    #[test]
    fn tool_call_deserializes_from_wire_shape() {
        let raw = serde_json::json!({
            "id": "call_1",
            "type": "function",
            "function": {"name": "bash", "arguments": "{\"cmd\":\"ls\"}"}
        });
        let call: ToolCall = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(call, ToolCall::new("call_1", "bash", r#"{"cmd":"ls"}"#));
    }

    #[test]
    fn tool_spec_serializes_schema_as_parameters() {
        let spec = ToolSpec::new("bash", "Run a command", serde_json::json!({"type": "object"}));
        let value = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(value["parameters"]["type"], "object");
    }

    #[test]
    fn tool_choice_parses_keywords_and_names() {
        assert_eq!(ToolChoice::from_str("none").expect("parse"), ToolChoice::None);
        assert_eq!(ToolChoice::from_str("auto").expect("parse"), ToolChoice::Auto);
        assert_eq!(
            ToolChoice::from_str("required").expect("parse"),
            ToolChoice::Required
        );
        assert_eq!(
            ToolChoice::from_str("terminate").expect("parse"),
            ToolChoice::Function("terminate".into())
        );
        assert!(ToolChoice::from_str("  ").is_err());
        assert_eq!(ToolChoice::default(), ToolChoice::Auto);
    }
}

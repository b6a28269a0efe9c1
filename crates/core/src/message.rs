//! Model message types.
//!
//! These mirror the multi-part message shape model providers exchange: a
//! role plus either a plain string or a list of typed content parts
//! (text, image, file, reasoning, tool call, tool result).

use serde::{Deserialize, Serialize};

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
    /// Tool execution result
    Tool,
    /// Any role a provider invents that we do not forward (e.g. item references)
    #[serde(other)]
    Unsupported,
}

/// Content of a message: a plain string or typed parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One typed part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        /// Base64 payload or URL.
        image: String,
    },
    #[serde(rename_all = "camelCase")]
    File {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
    Reasoning {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        output: serde_json::Value,
    },
    /// Part types we do not understand; dropped before reaching a provider.
    #[serde(other)]
    Unsupported,
}

/// A single message exchanged with the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ModelMessage {
    /// Create a new user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(vec![ContentPart::Text { text: text.into() }]),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create a new system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        output: serde_json::Value,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
                output,
            }]),
        }
    }

    /// Concatenated text of all text parts (or the plain string content).
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_is_text_part() {
        let msg = ModelMessage::user("Hello");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "Hello");
    }

    #[test]
    fn parts_serialize_with_kebab_type() {
        let msg = ModelMessage {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![
                ContentPart::Reasoning {
                    text: "thinking".into(),
                },
                ContentPart::ToolCall {
                    tool_call_id: "call_1".into(),
                    tool_name: "read".into(),
                    input: serde_json::json!({"path": "/data/a"}),
                },
            ]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"reasoning""#));
        assert!(json.contains(r#""type":"tool-call""#));
        assert!(json.contains(r#""toolCallId":"call_1""#));
    }

    #[test]
    fn unknown_roles_and_parts_deserialize_as_unsupported() {
        let json = r#"{"role":"item_reference","content":[{"type":"source","url":"x"}]}"#;
        let msg: ModelMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Unsupported);
        assert_eq!(
            msg.content,
            MessageContent::Parts(vec![ContentPart::Unsupported])
        );
    }

    #[test]
    fn plain_string_content_roundtrips() {
        let json = r#"{"role":"assistant","content":"done"}"#;
        let msg: ModelMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.content, MessageContent::Text("done".into()));
    }
}

//! Payload shaping for transport.
//!
//! Tool results and accumulated messages can be large enough to break line
//! based SSE consumers. Oversized strings keep their head and tail with a
//! marker in between; reasoning parts are dropped from final messages since
//! they travel separately in `agent_end.reasoning`.

use serde_json::Value;
use skein_config::TransportConfig;
use skein_core::message::{ContentPart, MessageContent, ModelMessage, Role};

pub const DEFAULT_CONTEXT_WINDOW: usize = 128_000;
const TOOL_RESULT_CONTEXT_SHARE: f64 = 0.3;
const CHARS_PER_TOKEN: f64 = 3.5;
const HEAD_CHARS: usize = 1500;
const TAIL_CHARS: usize = 1500;

/// Character cap for one tool result given the model's context window.
///
/// A zero window falls back to the default. Never less than head + tail + 200.
pub fn compute_max_tool_result_chars(context_window: usize) -> usize {
    TruncationPolicy::from_parts(
        context_window,
        TOOL_RESULT_CONTEXT_SHARE,
        CHARS_PER_TOKEN,
        HEAD_CHARS,
        TAIL_CHARS,
    )
    .max_chars
}

/// How strings are cut down for transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationPolicy {
    pub max_chars: usize,
    pub head_chars: usize,
    pub tail_chars: usize,
}

impl Default for TruncationPolicy {
    fn default() -> Self {
        Self::for_context_window(DEFAULT_CONTEXT_WINDOW)
    }
}

impl From<&TransportConfig> for TruncationPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self::from_parts(
            config.context_window,
            config.tool_result_share,
            config.chars_per_token,
            config.head_chars,
            config.tail_chars,
        )
    }
}

impl TruncationPolicy {
    pub fn for_context_window(context_window: usize) -> Self {
        Self::from_parts(
            context_window,
            TOOL_RESULT_CONTEXT_SHARE,
            CHARS_PER_TOKEN,
            HEAD_CHARS,
            TAIL_CHARS,
        )
    }

    fn from_parts(
        context_window: usize,
        share: f64,
        chars_per_token: f64,
        head_chars: usize,
        tail_chars: usize,
    ) -> Self {
        let window = if context_window > 0 {
            context_window
        } else {
            DEFAULT_CONTEXT_WINDOW
        };
        let budget = (window as f64 * share * chars_per_token).floor() as usize;
        Self {
            max_chars: budget.max(head_chars + tail_chars + 200),
            head_chars,
            tail_chars,
        }
    }

    /// Cut `s` down to the policy. Lengths are counted in characters.
    ///
    /// With room for both ends the middle is replaced by a marker; otherwise
    /// the string is cut at `max_chars` with a trailing note.
    pub fn truncate_str(&self, s: &str) -> String {
        let len = s.chars().count();
        if len <= self.max_chars {
            return s.to_string();
        }
        if self.max_chars >= self.head_chars + self.tail_chars + 100 {
            let head: String = s.chars().take(self.head_chars).collect();
            let tail: String = s.chars().skip(len - self.tail_chars).collect();
            format!("{head}\n\n[... content trimmed, original {len} chars ...]\n\n{tail}")
        } else {
            let cut: String = s.chars().take(self.max_chars).collect();
            format!("{cut}\n...[truncated: {len} total chars]")
        }
    }

    /// Truncate a tool result. Non-string values are measured by their JSON
    /// form and become a truncated string only when too long.
    pub fn truncate_value(&self, value: &Value) -> Value {
        match value {
            Value::Null => Value::Null,
            Value::String(s) => Value::String(self.truncate_str(s)),
            other => {
                let serialized = other.to_string();
                if serialized.chars().count() <= self.max_chars {
                    other.clone()
                } else {
                    Value::String(self.truncate_str(&serialized))
                }
            }
        }
    }
}

/// Truncate the content of tool-role messages; other roles pass through.
pub fn truncate_messages_for_transport(
    messages: Vec<ModelMessage>,
    policy: &TruncationPolicy,
) -> Vec<ModelMessage> {
    messages
        .into_iter()
        .map(|mut msg| {
            if msg.role != Role::Tool {
                return msg;
            }
            match &mut msg.content {
                MessageContent::Text(text) => *text = policy.truncate_str(text),
                MessageContent::Parts(parts) => {
                    for part in parts.iter_mut() {
                        match part {
                            ContentPart::ToolResult { output, .. } => {
                                *output = policy.truncate_value(output);
                            }
                            ContentPart::Text { text } => *text = policy.truncate_str(text),
                            _ => {}
                        }
                    }
                }
            }
            msg
        })
        .collect()
}

/// Remove reasoning parts from assistant messages. A message left with no
/// parts gets a single empty text part.
pub fn strip_reasoning_from_messages(messages: Vec<ModelMessage>) -> Vec<ModelMessage> {
    messages
        .into_iter()
        .map(|mut msg| {
            if msg.role != Role::Assistant {
                return msg;
            }
            if let MessageContent::Parts(parts) = &mut msg.content {
                let before = parts.len();
                parts.retain(|p| !matches!(p, ContentPart::Reasoning { .. }));
                if parts.is_empty() && before > 0 {
                    parts.push(ContentPart::Text {
                        text: String::new(),
                    });
                }
            }
            msg
        })
        .collect()
}

/// Copy of a tool chunk's metadata without `output` or `result`.
pub fn sanitize_tool_chunk_metadata(metadata: &Value) -> Value {
    match metadata {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "output" && k.as_str() != "result")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        _ => Value::Object(serde_json::Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn max_chars_from_context_window() {
        assert_eq!(compute_max_tool_result_chars(128_000), 134_400);
        assert_eq!(compute_max_tool_result_chars(0), 134_400);
        // 1000 * 0.3 * 3.5 = 1050, below the floor of 1500 + 1500 + 200.
        assert_eq!(compute_max_tool_result_chars(1000), 3200);
    }

    #[test]
    fn short_strings_untouched() {
        let policy = TruncationPolicy::default();
        assert_eq!(policy.truncate_str("short"), "short");
    }

    #[test]
    fn head_tail_truncation() {
        let policy = TruncationPolicy {
            max_chars: 3200,
            head_chars: 1500,
            tail_chars: 1500,
        };
        let input = format!("{}{}{}", "a".repeat(1500), "#".repeat(2000), "z".repeat(1500));
        let out = policy.truncate_str(&input);
        assert_eq!(
            out,
            format!(
                "{}\n\n[... content trimmed, original 5000 chars ...]\n\n{}",
                "a".repeat(1500),
                "z".repeat(1500)
            )
        );
        assert!(!out.contains('#'));
    }

    #[test]
    fn plain_cut_when_no_room_for_both_ends() {
        let policy = TruncationPolicy {
            max_chars: 10,
            head_chars: 1500,
            tail_chars: 1500,
        };
        assert_eq!(
            policy.truncate_str(&"x".repeat(25)),
            format!("{}\n...[truncated: 25 total chars]", "x".repeat(10))
        );
    }

    #[test]
    fn multibyte_text_counts_chars() {
        let policy = TruncationPolicy {
            max_chars: 4,
            head_chars: 1,
            tail_chars: 1,
        };
        assert_eq!(
            policy.truncate_str("日本語のテキスト"),
            "日本語の\n...[truncated: 8 total chars]"
        );
    }

    #[test]
    fn structured_values_truncate_only_when_large() {
        let policy = TruncationPolicy {
            max_chars: 20,
            head_chars: 1500,
            tail_chars: 1500,
        };
        let small = json!({ "ok": true });
        assert_eq!(policy.truncate_value(&small), small);
        let big = json!({ "data": "y".repeat(100) });
        assert!(policy.truncate_value(&big).is_string());
        assert_eq!(policy.truncate_value(&Value::Null), Value::Null);
    }

    #[test]
    fn only_tool_messages_are_truncated() {
        let policy = TruncationPolicy {
            max_chars: 5,
            head_chars: 1500,
            tail_chars: 1500,
        };
        let long = "q".repeat(50);
        let messages = vec![
            ModelMessage::assistant(long.clone()),
            ModelMessage::tool_result("c1", "read", Value::String(long.clone())),
        ];
        let out = truncate_messages_for_transport(messages, &policy);
        assert_eq!(out[0].text(), long);
        match &out[1].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::ToolResult { output, .. } => {
                    assert!(output.as_str().unwrap().contains("[truncated: 50 total chars]"));
                }
                other => panic!("unexpected part {other:?}"),
            },
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn reasoning_parts_are_stripped() {
        let messages = vec![
            ModelMessage {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![
                    ContentPart::Reasoning {
                        text: "thinking".into(),
                    },
                    ContentPart::Text {
                        text: "answer".into(),
                    },
                ]),
            },
            ModelMessage {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![ContentPart::Reasoning {
                    text: "only thoughts".into(),
                }]),
            },
        ];
        let out = strip_reasoning_from_messages(messages);
        assert_eq!(
            out[0].content,
            MessageContent::Parts(vec![ContentPart::Text {
                text: "answer".into()
            }])
        );
        assert_eq!(
            out[1].content,
            MessageContent::Parts(vec![ContentPart::Text {
                text: String::new()
            }])
        );
    }

    #[test]
    fn metadata_drops_output_and_result() {
        let meta = json!({ "type": "tool-result", "toolName": "read", "output": "big", "result": 1 });
        assert_eq!(
            sanitize_tool_chunk_metadata(&meta),
            json!({ "type": "tool-result", "toolName": "read" })
        );
        assert_eq!(sanitize_tool_chunk_metadata(&Value::Null), json!({}));
    }
}

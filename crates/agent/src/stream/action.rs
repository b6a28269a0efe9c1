//! Client-facing actions produced from a provider stream.
//!
//! Every streamed request yields exactly one `agent_start`, then any number
//! of reasoning/text/tool/attachment/image actions, then exactly one
//! `agent_end`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use skein_core::attachment::Attachment;
use skein_core::message::ModelMessage;
use skein_core::provider::Usage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Echo of the request input, before anything else.
    AgentStart { input: Value },

    ReasoningStart { metadata: Value },

    ReasoningDelta { delta: String },

    ReasoningEnd { metadata: Value },

    TextStart,

    /// Visible text only; attachment blocks never appear here.
    TextDelta { delta: String },

    TextEnd { metadata: Value },

    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_name: String,
        tool_call_id: String,
        input: Value,
        metadata: Value,
    },

    /// `result` is truncated for transport; `metadata` never carries the raw output.
    #[serde(rename_all = "camelCase")]
    ToolCallEnd {
        tool_name: String,
        tool_call_id: String,
        input: Value,
        result: Value,
        metadata: Value,
    },

    AttachmentDelta { attachments: Vec<Attachment> },

    ImageDelta { image: String, metadata: Value },

    /// Final aggregate. `error` is set when the stream aborted.
    AgentEnd {
        messages: Vec<ModelMessage>,
        reasoning: Vec<String>,
        usage: Usage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Action {
    /// SSE event name for this action.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AgentStart { .. } => "agent_start",
            Self::ReasoningStart { .. } => "reasoning_start",
            Self::ReasoningDelta { .. } => "reasoning_delta",
            Self::ReasoningEnd { .. } => "reasoning_end",
            Self::TextStart => "text_start",
            Self::TextDelta { .. } => "text_delta",
            Self::TextEnd { .. } => "text_end",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallEnd { .. } => "tool_call_end",
            Self::AttachmentDelta { .. } => "attachment_delta",
            Self::ImageDelta { .. } => "image_delta",
            Self::AgentEnd { .. } => "agent_end",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AgentEnd { .. })
    }

    /// Render as one SSE frame: `event: <type>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(format!("event: {}\ndata: {}\n\n", self.event_type(), data))
    }
}

//! Provider trait: the abstraction over model backends.
//!
//! A provider runs the model's multi-step tool loop: it calls the model,
//! executes requested tools from the [`ToolRegistry`] in the request, feeds
//! the results back, and repeats until the model answers with text. It exposes
//! the result either as a complete response or as a stream of [`StreamChunk`]s.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::ModelMessage;
use crate::tool::ToolRegistry;

/// A request to the model provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// The model to use
    pub model: String,

    /// System prompt
    pub system: Option<String>,

    /// The conversation messages
    pub messages: Vec<ModelMessage>,

    /// Tools the model may call; the provider executes them through this registry
    pub tools: Arc<ToolRegistry>,

    /// Cooperative cancellation; providers must unwind promptly once cancelled
    pub cancel: Option<CancellationToken>,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ModelMessage>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages,
            tools: Arc::new(ToolRegistry::new()),
            cancel: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Token usage as reported by a provider, under whichever field names it uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

impl RawUsage {
    /// Normalize to prompt/completion/total regardless of native field names.
    /// `prompt_tokens` wins over `input_tokens`; the total falls back to the sum.
    pub fn normalize(&self) -> Usage {
        let prompt = self.prompt_tokens.or(self.input_tokens).unwrap_or(0);
        let completion = self.completion_tokens.or(self.output_tokens).unwrap_or(0);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: self.total_tokens.unwrap_or(prompt + completion),
        }
    }
}

/// Normalized token usage handed to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn from_raw(raw: Option<&RawUsage>) -> Self {
        raw.map(RawUsage::normalize).unwrap_or_default()
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Messages generated during the call (assistant turns and tool results)
    pub messages: Vec<ModelMessage>,

    /// Final assistant text
    pub text: String,

    /// Reasoning texts, one per reasoning block
    #[serde(default)]
    pub reasoning: Vec<String>,

    /// Token usage statistics
    #[serde(default)]
    pub usage: Option<RawUsage>,
}

/// A file generated by the model (typically an image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFile {
    pub base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// One chunk of the provider's raw stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    ReasoningStart {
        id: String,
    },
    ReasoningDelta {
        id: String,
        text: String,
    },
    ReasoningEnd {
        id: String,
    },
    TextStart {
        id: String,
    },
    TextDelta {
        id: String,
        text: String,
    },
    TextEnd {
        id: String,
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
        input: serde_json::Value,
        #[serde(default)]
        output: serde_json::Value,
    },
    File {
        file: GeneratedFile,
    },
    Error {
        error: StreamError,
    },
    /// Final aggregate, sent once after the last step.
    Finish {
        #[serde(default)]
        usage: Option<RawUsage>,
        #[serde(default)]
        reasoning: Vec<String>,
        #[serde(default)]
        messages: Vec<ModelMessage>,
    },
}

impl StreamChunk {
    /// The wire name of this chunk type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::File { .. } => "file",
            Self::Error { .. } => "error",
            Self::Finish { .. } => "finish",
        }
    }
}

const DEFAULT_STREAM_ERROR: &str = "Model stream failed";

/// The error payload of an `error` chunk.
///
/// Providers report stream failures in several shapes: a typed error, a bare
/// string, `{message}`, or `{error}` holding a string or a nested error
/// object. They collapse into this one type at the provider boundary and are
/// resolved to a single human-readable string by [`StreamError::resolve_message`].
#[derive(Debug, Clone)]
pub enum StreamError {
    Provider(ProviderError),
    Text(String),
    Payload(serde_json::Value),
}

impl StreamError {
    /// Resolve to one message: typed error message, plain string,
    /// `{message}`, `{error}` (string, then nested `{message}`), else a
    /// generic default.
    pub fn resolve_message(&self) -> String {
        let resolved = match self {
            Self::Provider(err) => non_blank(&err.to_string()),
            Self::Text(text) => non_blank(text),
            Self::Payload(value) => resolve_value(value),
        };
        resolved.unwrap_or_else(|| DEFAULT_STREAM_ERROR.to_string())
    }
}

fn non_blank(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn resolve_value(value: &serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match value {
        Value::String(s) => non_blank(s),
        Value::Object(map) => {
            if let Some(message) = map.get("message").and_then(Value::as_str).and_then(non_blank) {
                return Some(message);
            }
            match map.get("error") {
                Some(Value::String(s)) => non_blank(s),
                Some(Value::Object(nested)) => nested
                    .get("message")
                    .and_then(Value::as_str)
                    .and_then(non_blank),
                _ => None,
            }
        }
        _ => None,
    }
}

impl From<ProviderError> for StreamError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

impl Serialize for StreamError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Provider(err) => serializer.serialize_str(&err.to_string()),
            Self::Text(text) => serializer.serialize_str(text),
            Self::Payload(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for StreamError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => Self::Text(s),
            other => Self::Payload(other),
        })
    }
}

/// The core provider trait.
///
/// Every model backend implements this. The agent calls `invoke()` or
/// `stream()` without knowing which backend is in use.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// A human-readable name for this provider.
    fn name(&self) -> &str;

    /// Run the full tool loop and return the aggregated response.
    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;

    /// Run the full tool loop, streaming chunks as they are produced.
    ///
    /// Default implementation calls `invoke()` and replays the response as a
    /// single text block followed by a `finish` chunk.
    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<mpsc::Receiver<StreamChunk>, ProviderError> {
        let response = self.invoke(request).await?;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let chunks = [
                StreamChunk::TextStart { id: "0".into() },
                StreamChunk::TextDelta {
                    id: "0".into(),
                    text: response.text,
                },
                StreamChunk::TextEnd { id: "0".into() },
                StreamChunk::Finish {
                    usage: response.usage,
                    reasoning: response.reasoning,
                    messages: response.messages,
                },
            ];
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

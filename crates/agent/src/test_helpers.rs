//! Shared mock providers for agent tests.

use std::sync::Mutex;

use serde_json::Value;
use skein_core::error::ProviderError;
use skein_core::message::ModelMessage;
use skein_core::provider::{
    ModelProvider, ProviderRequest, ProviderResponse, RawUsage, StreamChunk,
};
use tokio::sync::mpsc;

/// A mock provider that returns responses (or errors) in sequence.
pub struct SequentialMockProvider {
    responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
    call_count: Mutex<usize>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: Mutex::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Create a provider that returns a single text response.
    pub fn single_text(text: &str) -> Self {
        Self::new(vec![Ok(make_text_response(text))])
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModelProvider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let mut count = self.call_count.lock().unwrap();
        let responses = self.responses.lock().unwrap();

        if *count >= responses.len() {
            panic!(
                "SequentialMockProvider: no more responses (call #{}, have {})",
                *count,
                responses.len()
            );
        }

        let response = responses[*count].clone();
        *count += 1;
        response
    }
}

/// A mock provider whose `stream` replays a fixed chunk script.
pub struct ScriptedStreamProvider {
    chunks: Vec<StreamChunk>,
}

impl ScriptedStreamProvider {
    pub fn new(chunks: Vec<StreamChunk>) -> Self {
        Self { chunks }
    }

    /// A stream that says `text` and finishes with the matching assistant message.
    pub fn text(text: &str) -> Self {
        Self::new(vec![
            StreamChunk::TextStart { id: "t".into() },
            StreamChunk::TextDelta {
                id: "t".into(),
                text: text.into(),
            },
            StreamChunk::TextEnd { id: "t".into() },
            StreamChunk::Finish {
                usage: Some(make_usage(3, 2)),
                reasoning: vec![],
                messages: vec![ModelMessage::assistant(text)],
            },
        ])
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedStreamProvider {
    fn name(&self) -> &str {
        "scripted_stream"
    }

    async fn invoke(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        Err(ProviderError::NotConfigured("scripted stream only".into()))
    }

    async fn stream(
        &self,
        _request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamChunk>, ProviderError> {
        let (tx, rx) = mpsc::channel(16);
        let chunks = self.chunks.clone();
        tokio::spawn(async move {
            for chunk in chunks {
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// A mock provider that calls one tool `times` times through the request's
/// tool registry, like a model stuck in a loop, and reports each outcome.
pub struct LoopingToolProvider {
    pub tool_name: String,
    pub input: Value,
    pub times: usize,
}

#[async_trait::async_trait]
impl ModelProvider for LoopingToolProvider {
    fn name(&self) -> &str {
        "looping_tool"
    }

    async fn invoke(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut outcomes = Vec::new();
        for _ in 0..self.times {
            let outcome = match request.tools.execute(&self.tool_name, self.input.clone()).await {
                Ok(value) => format!("ok:{value}"),
                Err(e) => format!("err:{e}"),
            };
            outcomes.push(outcome);
        }
        Ok(make_text_response(&outcomes.join("\n")))
    }
}

/// Create a simple text response.
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        messages: vec![ModelMessage::assistant(text)],
        text: text.to_string(),
        reasoning: vec![],
        usage: Some(make_usage(10, 5)),
    }
}

/// Usage reported with the newer input/output field names.
pub fn make_usage(input: u32, output: u32) -> RawUsage {
    RawUsage {
        input_tokens: Some(input),
        output_tokens: Some(output),
        ..RawUsage::default()
    }
}

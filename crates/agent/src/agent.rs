//! The agent facade.
//!
//! One [`Agent`] serves many requests. Each request gets its own loop
//! detection session: the agent's tools are wrapped under a fresh session id
//! and the session is cleared when the request is done, however it ends.
//!
//! - [`Agent::ask`]: one non-streaming round, retried on transient failures
//! - [`Agent::stream`]: the same round as an [`Action`] stream, never retried
//! - [`Agent::ask_as_subagent`] / [`Agent::stream_as_subagent`]: rounds run
//!   on behalf of a background run

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skein_config::AppConfig;
use skein_core::attachment::Attachment;
use skein_core::error::{Error, ProviderError};
use skein_core::message::{ContentPart, MessageContent, ModelMessage, Role};
use skein_core::provider::{ModelProvider, ProviderRequest, StreamChunk, Usage};
use skein_core::tool::ToolRegistry;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::loop_detection::{LoopDetectionSettings, LoopDetector};
use crate::prompt_cache::{SystemFileCache, SystemMode};
use crate::retry::{is_retryable_llm_error, RetryPolicy};
use crate::runs::tools::{RunSink, SubagentContext, SubagentJob, SubagentRunner};
use crate::stream::{
    dedupe_attachments, extract_attachments_from_text, strip_attachments_from_messages,
    strip_reasoning_from_messages, truncate_messages_for_transport, Action, StreamTranslator,
    TruncationPolicy,
};

/// One user turn plus the conversation so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInput {
    #[serde(default)]
    pub messages: Vec<ModelMessage>,
    pub query: String,
}

impl AgentInput {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            query: query.into(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<ModelMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// Aggregated result of a non-streaming round.
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutput {
    pub messages: Vec<ModelMessage>,
    pub reasoning: Vec<String>,
    pub usage: Usage,
    pub text: String,
    pub attachments: Vec<Attachment>,
}

/// A task for a sub-agent.
pub struct SubagentInput {
    pub name: String,
    pub task: String,
    /// The sub-agent's own earlier conversation.
    pub messages: Vec<ModelMessage>,
    pub cancel: Option<CancellationToken>,
}

/// Result of a sub-agent round. `messages` starts with the task prompt.
#[derive(Debug, Clone, Serialize)]
pub struct SubagentOutput {
    pub messages: Vec<ModelMessage>,
    pub reasoning: Vec<String>,
    pub usage: Usage,
    pub text: String,
}

pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    model: String,
    bot_id: String,
    tools: ToolRegistry,
    loop_detector: Arc<LoopDetector>,
    retry: RetryPolicy,
    truncation: TruncationPolicy,
    prompts: Option<Arc<SystemFileCache>>,
    subagents: Option<Arc<SubagentContext>>,
}

impl Agent {
    pub fn new(provider: Arc<dyn ModelProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            bot_id: String::new(),
            tools: ToolRegistry::new(),
            loop_detector: Arc::new(LoopDetector::default()),
            retry: RetryPolicy::default(),
            truncation: TruncationPolicy::default(),
            prompts: None,
            subagents: None,
        }
    }

    /// Model name, retry, truncation and loop thresholds from configuration.
    pub fn from_config(provider: Arc<dyn ModelProvider>, config: &AppConfig) -> Self {
        Self::new(provider, config.model.name.clone())
            .with_retry(RetryPolicy::from(&config.retry))
            .with_truncation(TruncationPolicy::from(&config.transport))
            .with_loop_detector(Arc::new(LoopDetector::new(LoopDetectionSettings::from(
                &config.loop_detection,
            ))))
    }

    pub fn with_bot_id(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = bot_id.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_loop_detector(mut self, detector: Arc<LoopDetector>) -> Self {
        self.loop_detector = detector;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_truncation(mut self, truncation: TruncationPolicy) -> Self {
        self.truncation = truncation;
        self
    }

    /// Persona files used as the system prompt.
    pub fn with_prompt_cache(mut self, prompts: Arc<SystemFileCache>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Expose the sub-agent run tools to the model.
    pub fn with_subagents(mut self, subagents: Arc<SubagentContext>) -> Self {
        self.subagents = Some(subagents);
        self
    }

    pub fn loop_detector(&self) -> &Arc<LoopDetector> {
        &self.loop_detector
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn session_id(&self, kind: &str) -> String {
        format!("{kind}:{}:{}", self.bot_id, Uuid::new_v4().simple())
    }

    /// The agent's tools plus sub-agent tools, loop-guarded under `session_id`.
    fn session_tools(&self, session_id: &str) -> Arc<ToolRegistry> {
        let mut tools = self.tools.clone();
        if let Some(subagents) = &self.subagents {
            for tool in subagents.tools().iter() {
                tools.register(Arc::clone(tool));
            }
        }
        Arc::new(self.loop_detector.wrap(&tools, session_id))
    }

    async fn system_prompt(&self, mode: SystemMode) -> Option<String> {
        let prompts = self.prompts.as_ref()?;
        let files = prompts.for_mode(mode, &self.bot_id, "", "").await;
        let sections: Vec<&str> = [&files.identity, &files.soul, &files.tools]
            .into_iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        (!sections.is_empty()).then(|| sections.join("\n\n"))
    }

    async fn request(
        &self,
        session_id: &str,
        mode: SystemMode,
        messages: Vec<ModelMessage>,
    ) -> ProviderRequest {
        let mut request = ProviderRequest::new(self.model.clone(), messages)
            .with_tools(self.session_tools(session_id));
        if let Some(system) = self.system_prompt(mode).await {
            request = request.with_system(system);
        }
        request
    }

    /// One non-streaming round. Transient provider failures are retried.
    pub async fn ask(&self, input: AgentInput) -> Result<AgentOutput, Error> {
        let session_id = self.session_id("ask");
        let mut messages = sanitize_messages(input.messages);
        messages.push(ModelMessage::user(input.query));
        let request = self.request(&session_id, SystemMode::Full, messages).await;

        let session = SessionGuard::new(&self.loop_detector, &session_id);
        let result = self
            .retry
            .run(|| self.provider.invoke(request.clone()), is_retryable_llm_error)
            .await;
        drop(session);
        let response = result?;

        let text = extract_attachments_from_text(&response.text);
        let (stripped, message_attachments) = strip_attachments_from_messages(response.messages);
        let messages = strip_reasoning_from_messages(truncate_messages_for_transport(
            stripped,
            &self.truncation,
        ));
        let mut attachments = text.attachments;
        attachments.extend(message_attachments);

        debug!(session_id = %session_id, "Ask round complete");
        Ok(AgentOutput {
            messages,
            reasoning: response.reasoning,
            usage: Usage::from_raw(response.usage.as_ref()),
            text: text.visible_text,
            attachments: dedupe_attachments(attachments),
        })
    }

    /// One streamed round. The loop detection session is cleared when the
    /// translator closes.
    pub async fn stream(&self, input: AgentInput) -> mpsc::Receiver<Action> {
        let session_id = self.session_id("stream");
        let echo = serde_json::to_value(&input).unwrap_or_default();
        let mut messages = sanitize_messages(input.messages);
        messages.push(ModelMessage::user(input.query));
        let request = self.request(&session_id, SystemMode::Full, messages).await;
        self.translate(request, session_id, echo).await
    }

    async fn translate(
        &self,
        request: ProviderRequest,
        session_id: String,
        echo: serde_json::Value,
    ) -> mpsc::Receiver<Action> {
        let detector = Arc::clone(&self.loop_detector);
        let translator = StreamTranslator::new(self.truncation)
            .with_input(echo)
            .on_close(async move {
                detector.clear_session(&session_id);
            });

        match self.provider.stream(request).await {
            Ok(chunks) => translator.translate(ReceiverStream::new(chunks)),
            Err(e) => translator.translate(futures::stream::iter([StreamChunk::Error {
                error: e.into(),
            }])),
        }
    }

    /// Run a sub-agent task to completion without streaming.
    pub async fn ask_as_subagent(&self, input: SubagentInput) -> Result<SubagentOutput, Error> {
        let session_id = self.session_id(&format!("subagent:{}", input.name));
        let prompt = ModelMessage::user(input.task);
        let mut messages = sanitize_messages(input.messages);
        messages.push(prompt.clone());
        let mut request = self.request(&session_id, SystemMode::Minimal, messages).await;
        if let Some(cancel) = input.cancel {
            request = request.with_cancel(cancel);
        }

        let session = SessionGuard::new(&self.loop_detector, &session_id);
        let result = self
            .retry
            .run(|| self.provider.invoke(request.clone()), is_retryable_llm_error)
            .await;
        drop(session);
        let response = result?;

        let mut messages = vec![prompt];
        messages.extend(response.messages);
        Ok(SubagentOutput {
            messages: strip_reasoning_from_messages(truncate_messages_for_transport(
                messages,
                &self.truncation,
            )),
            reasoning: response.reasoning,
            usage: Usage::from_raw(response.usage.as_ref()),
            text: response.text,
        })
    }

    /// Run a sub-agent task over the streaming path, forwarding visible text
    /// and attachments to `sink` as they arrive.
    pub async fn stream_as_subagent(
        &self,
        input: SubagentInput,
        sink: &RunSink,
    ) -> Result<SubagentOutput, Error> {
        let session_id = self.session_id(&format!("subagent:{}", input.name));
        let prompt = ModelMessage::user(input.task.clone());
        let mut messages = sanitize_messages(input.messages);
        messages.push(prompt.clone());
        let mut request = self.request(&session_id, SystemMode::Minimal, messages).await;
        if let Some(cancel) = input.cancel {
            request = request.with_cancel(cancel);
        }

        let mut actions = self
            .translate(request, session_id, serde_json::json!({ "task": input.task }))
            .await;
        let mut text = String::new();
        while let Some(action) = actions.recv().await {
            match action {
                Action::TextDelta { delta } => {
                    sink.delta(delta.clone());
                    text.push_str(&delta);
                }
                Action::AttachmentDelta { attachments } => {
                    for attachment in attachments {
                        sink.attachment(attachment);
                    }
                }
                Action::AgentEnd {
                    messages,
                    reasoning,
                    usage,
                    error,
                } => {
                    if let Some(error) = error {
                        return Err(ProviderError::StreamInterrupted(error).into());
                    }
                    let mut all = vec![prompt];
                    all.extend(messages);
                    return Ok(SubagentOutput {
                        messages: all,
                        reasoning,
                        usage,
                        text,
                    });
                }
                _ => {}
            }
        }
        Err(ProviderError::StreamInterrupted("stream ended without agent_end".into()).into())
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("bot_id", &self.bot_id)
            .field("tools", &self.tools)
            .field("subagents", &self.subagents.is_some())
            .finish()
    }
}

/// Drop roles and part types a provider would reject. A message whose parts
/// are all dropped keeps a single empty text part.
pub fn sanitize_messages(messages: Vec<ModelMessage>) -> Vec<ModelMessage> {
    messages
        .into_iter()
        .filter(|m| m.role != Role::Unsupported)
        .map(|mut msg| {
            if let MessageContent::Parts(parts) = &mut msg.content {
                let before = parts.len();
                parts.retain(|p| !matches!(p, ContentPart::Unsupported));
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

/// Runs background sub-agent jobs on a child [`Agent`], remembering each
/// sub-agent's conversation between runs.
pub struct ChildAgentRunner {
    agent: Arc<Agent>,
    max_context: usize,
    contexts: Mutex<HashMap<String, Vec<ModelMessage>>>,
}

impl ChildAgentRunner {
    pub fn new(agent: Arc<Agent>, max_context: usize) -> Self {
        Self {
            agent,
            max_context,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// The remembered conversation of sub-agent `name`.
    pub fn context(&self, name: &str) -> Vec<ModelMessage> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn save_context(&self, name: &str, messages: Vec<ModelMessage>) {
        let skip = messages.len().saturating_sub(self.max_context);
        let kept: Vec<_> = messages.into_iter().skip(skip).collect();
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), kept);
    }
}

#[async_trait]
impl SubagentRunner for ChildAgentRunner {
    async fn run(&self, job: SubagentJob) -> Result<String, Error> {
        let history = self.context(&job.name);
        let output = self
            .agent
            .stream_as_subagent(
                SubagentInput {
                    name: job.name.clone(),
                    task: job.task,
                    messages: history.clone(),
                    cancel: Some(job.cancel),
                },
                &job.sink,
            )
            .await?;

        let summary = summarize(output.messages.last());
        let mut updated = history;
        updated.extend(output.messages);
        self.save_context(&job.name, updated);
        info!(run_id = %job.run_id, name = %job.name, "Sub-agent finished");
        Ok(summary)
    }
}

/// Text of the last message, or its parts as JSON, or a placeholder.
fn summarize(last: Option<&ModelMessage>) -> String {
    match last.map(|m| &m.content) {
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => {
            serde_json::to_string(parts).unwrap_or_else(|_| "(no output)".to_string())
        }
        None => "(no output)".to_string(),
    }
}

/// Clears a loop detection session on drop, so a cancelled round does not
/// leave its window behind.
struct SessionGuard<'a> {
    detector: &'a LoopDetector,
    session_id: &'a str,
}

impl<'a> SessionGuard<'a> {
    fn new(detector: &'a LoopDetector, session_id: &'a str) -> Self {
        Self {
            detector,
            session_id,
        }
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.detector.clear_session(self.session_id);
    }
}

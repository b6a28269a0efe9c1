//! Provider chunk stream → client action stream.
//!
//! The translator runs in its own task and forwards actions over an mpsc
//! channel, the same way the agent's streaming loop hands events to the
//! gateway. Whatever happens to the source (normal end, `error` chunk, panic)
//! the consumer sees one `agent_start` first and one `agent_end` last, and
//! the close callback runs exactly once, also when the consumer goes away.
//!
//! Panics are only caught with `panic = "unwind"`. The workspace release
//! profile sets `panic = "abort"`, so there a panicking source ends the
//! process instead of producing an error `agent_end`.

use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value};
use skein_core::attachment::Attachment;
use skein_core::message::ModelMessage;
use skein_core::provider::{RawUsage, StreamChunk, Usage};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::action::Action;
use super::attachments::{strip_attachments_from_messages, AttachmentsStreamExtractor, Extracted};
use super::transport::{
    sanitize_tool_chunk_metadata, strip_reasoning_from_messages, truncate_messages_for_transport,
    TruncationPolicy,
};

/// Tools whose successful result is a file the user should receive.
const FILE_WRITE_TOOLS: &[&str] = &["write", "save_file", "create_file", "write_file"];
const SHARED_DIR: &str = "/shared/";

const PANIC_MESSAGE: &str = "Model stream panicked";

pub struct StreamTranslator {
    policy: TruncationPolicy,
    input: Value,
    on_close: Option<BoxFuture<'static, ()>>,
}

impl StreamTranslator {
    pub fn new(policy: TruncationPolicy) -> Self {
        Self {
            policy,
            input: Value::Null,
            on_close: None,
        }
    }

    /// Request input echoed in `agent_start`.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Release per-request resources once the source is done.
    pub fn on_close<F>(mut self, close: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.on_close = Some(close.boxed());
        self
    }

    /// Start translating `chunks`. Actions arrive on the returned receiver.
    pub fn translate<S>(self, chunks: S) -> mpsc::Receiver<Action>
    where
        S: Stream<Item = StreamChunk> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Action>(128);
        let Self {
            policy,
            input,
            on_close,
        } = self;

        tokio::spawn(async move {
            let mut close = CloseGuard(on_close);
            let mut state = Translation::new(policy);

            if tx.send(Action::AgentStart { input }).await.is_err() {
                close.run().await;
                return;
            }

            let outcome = AssertUnwindSafe(state.pump(chunks, &tx))
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(Stop::Failed(message))) => {
                    warn!(error = %message, "Model stream failed");
                    Some(message)
                }
                Ok(Err(Stop::ConsumerGone)) => {
                    debug!("Action consumer dropped; closing stream");
                    close.run().await;
                    return;
                }
                Err(_) => {
                    error!("Model stream panicked");
                    Some(PANIC_MESSAGE.to_string())
                }
            };

            close.run().await;
            for action in state.flush_text() {
                if tx.send(action).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(state.finish(failure)).await;
        });

        rx
    }
}

impl std::fmt::Debug for StreamTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTranslator")
            .field("policy", &self.policy)
            .field("has_close", &self.on_close.is_some())
            .finish()
    }
}

/// One-shot close callback. If never run explicitly it is spawned on drop.
struct CloseGuard(Option<BoxFuture<'static, ()>>);

impl CloseGuard {
    async fn run(&mut self) {
        if let Some(close) = self.0.take() {
            close.await;
        }
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(close) = self.0.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(close);
            }
        }
    }
}

enum Stop {
    Failed(String),
    ConsumerGone,
}

/// Per-request translation state.
struct Translation {
    policy: TruncationPolicy,
    extractor: AttachmentsStreamExtractor,
    messages: Vec<ModelMessage>,
    reasoning: Vec<String>,
    usage: Option<RawUsage>,
}

impl Translation {
    fn new(policy: TruncationPolicy) -> Self {
        Self {
            policy,
            extractor: AttachmentsStreamExtractor::new(),
            messages: Vec::new(),
            reasoning: Vec::new(),
            usage: None,
        }
    }

    async fn pump<S>(&mut self, chunks: S, tx: &mpsc::Sender<Action>) -> Result<(), Stop>
    where
        S: Stream<Item = StreamChunk>,
    {
        futures::pin_mut!(chunks);
        loop {
            let chunk = tokio::select! {
                chunk = chunks.next() => chunk,
                // An idle source must not keep a dropped consumer's resources open.
                _ = tx.closed() => return Err(Stop::ConsumerGone),
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            for action in self.on_chunk(chunk).map_err(Stop::Failed)? {
                tx.send(action).await.map_err(|_| Stop::ConsumerGone)?;
            }
        }
    }

    fn on_chunk(&mut self, chunk: StreamChunk) -> Result<Vec<Action>, String> {
        let metadata = || serde_json::to_value(&chunk).unwrap_or(Value::Null);

        let actions = match &chunk {
            StreamChunk::ReasoningStart { .. } => vec![Action::ReasoningStart {
                metadata: metadata(),
            }],
            StreamChunk::ReasoningDelta { text, .. } => vec![Action::ReasoningDelta {
                delta: text.clone(),
            }],
            StreamChunk::ReasoningEnd { .. } => vec![Action::ReasoningEnd {
                metadata: metadata(),
            }],
            StreamChunk::TextStart { .. } => vec![Action::TextStart],
            StreamChunk::TextDelta { text, .. } => text_actions(self.extractor.push(text)),
            StreamChunk::TextEnd { .. } => {
                let mut actions = self.flush_text();
                actions.push(Action::TextEnd {
                    metadata: metadata(),
                });
                actions
            }
            StreamChunk::ToolCall {
                tool_call_id,
                tool_name,
                input,
            } => vec![Action::ToolCallStart {
                tool_name: tool_name.clone(),
                tool_call_id: tool_call_id.clone(),
                input: input.clone(),
                metadata: metadata(),
            }],
            StreamChunk::ToolResult {
                tool_call_id,
                tool_name,
                input,
                output,
            } => {
                let mut actions = vec![Action::ToolCallEnd {
                    tool_name: tool_name.clone(),
                    tool_call_id: tool_call_id.clone(),
                    input: input.clone(),
                    result: self.policy.truncate_value(output),
                    metadata: sanitize_tool_chunk_metadata(&metadata()),
                }];
                if let Some(path) = delivered_write(tool_name, input, output) {
                    actions.push(Action::AttachmentDelta {
                        attachments: vec![Attachment::File {
                            path: path.to_string(),
                        }],
                    });
                }
                actions
            }
            StreamChunk::File { file } => vec![Action::ImageDelta {
                image: file.base64.clone(),
                metadata: json!({ "type": "file", "mediaType": file.media_type }),
            }],
            StreamChunk::Error { error } => return Err(error.resolve_message()),
            StreamChunk::Finish { .. } => Vec::new(),
        };

        if let StreamChunk::Finish {
            usage,
            reasoning,
            messages,
        } = chunk
        {
            self.usage = usage;
            self.reasoning = reasoning;
            self.messages = messages;
        }
        Ok(actions)
    }

    fn flush_text(&mut self) -> Vec<Action> {
        text_actions(self.extractor.flush_remainder())
    }

    fn finish(self, error: Option<String>) -> Action {
        let (messages, _) = strip_attachments_from_messages(self.messages);
        let messages =
            strip_reasoning_from_messages(truncate_messages_for_transport(messages, &self.policy));
        Action::AgentEnd {
            messages,
            reasoning: self.reasoning,
            usage: Usage::from_raw(self.usage.as_ref()),
            error,
        }
    }
}

fn text_actions(extracted: Extracted) -> Vec<Action> {
    let mut actions = Vec::new();
    if !extracted.visible_text.is_empty() {
        actions.push(Action::TextDelta {
            delta: extracted.visible_text,
        });
    }
    if !extracted.attachments.is_empty() {
        actions.push(Action::AttachmentDelta {
            attachments: extracted.attachments,
        });
    }
    actions
}

/// Path of a file written under `/shared/` by a successful write tool call.
fn delivered_write<'a>(tool_name: &str, input: &'a Value, output: &Value) -> Option<&'a str> {
    if !FILE_WRITE_TOOLS.contains(&tool_name) || !is_write_success(output) {
        return None;
    }
    let path = input["path"].as_str().filter(|p| !p.is_empty())?;
    is_deliverable_path(path).then_some(path)
}

/// Under the shared directory with an extension on the last segment.
fn is_deliverable_path(path: &str) -> bool {
    if !path.starts_with(SHARED_DIR) {
        return false;
    }
    match (path.rfind('.'), path.rfind('/')) {
        (Some(dot), Some(slash)) => dot > slash,
        _ => false,
    }
}

fn is_write_success(output: &Value) -> bool {
    match output {
        Value::Null => false,
        Value::String(s) => !s.to_lowercase().contains("error"),
        Value::Object(map) => {
            if map.get("isError").and_then(Value::as_bool) == Some(true) {
                return false;
            }
            match map.get("content").and_then(Value::as_array) {
                Some(parts) => !parts.iter().any(|part| {
                    part["type"] == "text"
                        && part["text"]
                            .as_str()
                            .is_some_and(|t| t.to_lowercase().contains("error"))
                }),
                None => true,
            }
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::message::{ContentPart, MessageContent, Role};
    use skein_core::provider::{GeneratedFile, StreamError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn text_delta(text: &str) -> StreamChunk {
        StreamChunk::TextDelta {
            id: "t1".into(),
            text: text.into(),
        }
    }

    fn finish() -> StreamChunk {
        StreamChunk::Finish {
            usage: Some(RawUsage {
                input_tokens: Some(10),
                output_tokens: Some(5),
                ..RawUsage::default()
            }),
            reasoning: vec!["thought".into()],
            messages: vec![ModelMessage {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![
                    ContentPart::Reasoning {
                        text: "thought".into(),
                    },
                    ContentPart::Text {
                        text: "Hi <attachments>\n- /shared/a.txt\n</attachments>".into(),
                    },
                ]),
            }],
        }
    }

    /// Close callback that counts calls and signals the first one.
    fn counting_close() -> (Arc<AtomicUsize>, oneshot::Receiver<()>, impl std::future::Future<Output = ()> + Send) {
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let counter = Arc::clone(&count);
        let close = async move {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        };
        (count, rx, close)
    }

    async fn collect(mut rx: mpsc::Receiver<Action>) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(action) = rx.recv().await {
            actions.push(action);
        }
        actions
    }

    fn kinds(actions: &[Action]) -> Vec<&'static str> {
        actions.iter().map(Action::event_type).collect()
    }

    #[tokio::test]
    async fn translates_a_full_stream() {
        let (count, _rx, close) = counting_close();
        let chunks = vec![
            StreamChunk::ReasoningStart { id: "r1".into() },
            StreamChunk::ReasoningDelta {
                id: "r1".into(),
                text: "thought".into(),
            },
            StreamChunk::ReasoningEnd { id: "r1".into() },
            StreamChunk::TextStart { id: "t1".into() },
            text_delta("Hi "),
            text_delta("<attachments>\n- /shared/a.txt\n</attachments>"),
            StreamChunk::TextEnd { id: "t1".into() },
            finish(),
        ];

        let actions = collect(
            StreamTranslator::new(TruncationPolicy::default())
                .with_input(json!({ "query": "hello" }))
                .on_close(close)
                .translate(futures::stream::iter(chunks)),
        )
        .await;

        assert_eq!(
            kinds(&actions),
            vec![
                "agent_start",
                "reasoning_start",
                "reasoning_delta",
                "reasoning_end",
                "text_start",
                "text_delta",
                "attachment_delta",
                "text_end",
                "agent_end",
            ]
        );
        assert_eq!(actions[0], Action::AgentStart { input: json!({ "query": "hello" }) });
        assert_eq!(
            actions[6],
            Action::AttachmentDelta {
                attachments: vec![Attachment::File {
                    path: "/shared/a.txt".into()
                }]
            }
        );

        match actions.last().unwrap() {
            Action::AgentEnd {
                messages,
                reasoning,
                usage,
                error,
            } => {
                assert!(error.is_none());
                assert_eq!(reasoning, &vec!["thought".to_string()]);
                assert_eq!(usage.prompt_tokens, 10);
                assert_eq!(usage.completion_tokens, 5);
                assert_eq!(usage.total_tokens, 15);
                assert_eq!(
                    messages[0].content,
                    MessageContent::Parts(vec![ContentPart::Text { text: "Hi".into() }])
                );
            }
            other => panic!("Expected AgentEnd, got {other:?}"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_chunk_ends_stream_with_message() {
        let (count, _rx, close) = counting_close();
        let chunks = vec![
            StreamChunk::TextStart { id: "t1".into() },
            text_delta("partial"),
            StreamChunk::Error {
                error: StreamError::Payload(json!({ "error": { "message": "quota exceeded" } })),
            },
            text_delta("never seen"),
        ];

        let actions = collect(
            StreamTranslator::new(TruncationPolicy::default())
                .on_close(close)
                .translate(futures::stream::iter(chunks)),
        )
        .await;

        assert_eq!(
            kinds(&actions),
            vec!["agent_start", "text_start", "text_delta", "agent_end"]
        );
        match actions.last().unwrap() {
            Action::AgentEnd { error, .. } => {
                assert_eq!(error.as_deref(), Some("quota exceeded"));
            }
            other => panic!("Expected AgentEnd, got {other:?}"),
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unresolvable_error_uses_fallback_text() {
        let chunks = vec![StreamChunk::Error {
            error: StreamError::Payload(json!({ "code": 17 })),
        }];
        let actions = collect(
            StreamTranslator::new(TruncationPolicy::default())
                .translate(futures::stream::iter(chunks)),
        )
        .await;
        assert!(matches!(
            actions.last(),
            Some(Action::AgentEnd { error: Some(e), .. }) if e == "Model stream failed"
        ));
    }

    #[tokio::test]
    async fn panicking_source_still_ends_and_closes() {
        let (count, _rx, close) = counting_close();
        let chunks = futures::stream::iter(vec![1, 2]).map(|n| {
            if n == 2 {
                panic!("provider bug");
            }
            StreamChunk::TextStart { id: "t1".into() }
        });

        let actions = collect(
            StreamTranslator::new(TruncationPolicy::default())
                .on_close(close)
                .translate(chunks),
        )
        .await;

        assert_eq!(kinds(&actions), vec!["agent_start", "text_start", "agent_end"]);
        assert!(matches!(
            actions.last(),
            Some(Action::AgentEnd { error: Some(e), .. }) if e == PANIC_MESSAGE
        ));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consumer_drop_runs_close_once() {
        let (count, closed, close) = counting_close();
        let (chunk_tx, chunk_rx) = mpsc::channel::<StreamChunk>(4);
        let mut rx = StreamTranslator::new(TruncationPolicy::default())
            .on_close(close)
            .translate(tokio_stream::wrappers::ReceiverStream::new(chunk_rx));

        assert_eq!(rx.recv().await.unwrap().event_type(), "agent_start");
        drop(rx);

        // A chunk racing the drop must not close a second time.
        let _ = chunk_tx.send(text_delta("hello")).await;
        closed.await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consumer_drop_closes_idle_source() {
        let (count, closed, close) = counting_close();
        let (chunk_tx, chunk_rx) = mpsc::channel::<StreamChunk>(4);
        let mut rx = StreamTranslator::new(TruncationPolicy::default())
            .on_close(close)
            .translate(tokio_stream::wrappers::ReceiverStream::new(chunk_rx));

        assert_eq!(rx.recv().await.unwrap().event_type(), "agent_start");
        drop(rx);

        // The provider never sends another chunk.
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("close callback ran")
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tokio::time::timeout(Duration::from_secs(5), chunk_tx.closed())
            .await
            .expect("upstream stream dropped");
    }

    #[tokio::test]
    async fn tool_results_are_truncated_and_sanitized() {
        let policy = TruncationPolicy {
            max_chars: 10,
            head_chars: 1500,
            tail_chars: 1500,
        };
        let chunks = vec![
            StreamChunk::ToolCall {
                tool_call_id: "c1".into(),
                tool_name: "read".into(),
                input: json!({ "path": "/x" }),
            },
            StreamChunk::ToolResult {
                tool_call_id: "c1".into(),
                tool_name: "read".into(),
                input: json!({ "path": "/x" }),
                output: Value::String("z".repeat(40)),
            },
        ];
        let actions = collect(StreamTranslator::new(policy).translate(futures::stream::iter(chunks))).await;

        match &actions[2] {
            Action::ToolCallEnd {
                result, metadata, ..
            } => {
                assert_eq!(
                    result.as_str().unwrap(),
                    format!("{}\n...[truncated: 40 total chars]", "z".repeat(10))
                );
                assert!(metadata.get("output").is_none());
                assert_eq!(metadata["toolName"], "read");
            }
            other => panic!("Expected ToolCallEnd, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_shared_write_emits_attachment() {
        let write = |path: &str, output: Value| StreamChunk::ToolResult {
            tool_call_id: "c".into(),
            tool_name: "write_file".into(),
            input: json!({ "path": path, "content": "x" }),
            output,
        };
        let chunks = vec![
            write("/shared/report.md", json!("Wrote 1 byte")),
            write("/shared/noext", json!("Wrote 1 byte")),
            write("/tmp/scratch.md", json!("Wrote 1 byte")),
            write("/shared/bad.md", json!("Error: disk full")),
            write("/shared/flagged.md", json!({ "isError": true })),
        ];
        let actions = collect(
            StreamTranslator::new(TruncationPolicy::default())
                .translate(futures::stream::iter(chunks)),
        )
        .await;

        let attachments: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::AttachmentDelta { attachments } => Some(attachments.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            attachments,
            vec![vec![Attachment::File {
                path: "/shared/report.md".into()
            }]]
        );
    }

    #[tokio::test]
    async fn file_chunk_becomes_image_delta() {
        let chunks = vec![StreamChunk::File {
            file: GeneratedFile {
                base64: "aGk=".into(),
                media_type: Some("image/png".into()),
            },
        }];
        let actions = collect(
            StreamTranslator::new(TruncationPolicy::default())
                .translate(futures::stream::iter(chunks)),
        )
        .await;
        assert_eq!(
            actions[1],
            Action::ImageDelta {
                image: "aGk=".into(),
                metadata: json!({ "type": "file", "mediaType": "image/png" }),
            }
        );
    }

    #[tokio::test]
    async fn unclosed_block_at_end_becomes_attachment() {
        let chunks = vec![
            StreamChunk::TextStart { id: "t1".into() },
            text_delta("see <attachments>\n- /shared/x.png"),
        ];
        let actions = collect(
            StreamTranslator::new(TruncationPolicy::default())
                .translate(futures::stream::iter(chunks)),
        )
        .await;
        assert_eq!(
            kinds(&actions),
            vec!["agent_start", "text_start", "text_delta", "attachment_delta", "agent_end"]
        );
    }

    #[test]
    fn deliverable_paths() {
        assert!(is_deliverable_path("/shared/a.txt"));
        assert!(is_deliverable_path("/shared/dir/b.tar.gz"));
        assert!(!is_deliverable_path("/shared/dir.d/noext"));
        assert!(!is_deliverable_path("/home/a.txt"));
    }
}

//! Tool-call loop detection.
//!
//! Every tool handed to the model is wrapped in a [`LoopGuardedTool`] that
//! records `(tool, params hash, result hash)` into a per-session sliding
//! window. Before a call runs, three detectors inspect the window:
//!
//! 1. **globalCircuitBreaker**: the same tool + params already appears
//!    `global_breaker` times in the window.
//! 2. **repeatedNoProgress**: the last `repeat_no_progress` records are this
//!    exact call with one unchanging result.
//! 3. **pingPong**: the last `ping_pong_pairs * 2` records alternate strictly
//!    between two different tools with unchanging results.
//!
//! A tripped detector blocks the call (the tool never runs), appends a
//! `BLOCKED` record, and returns [`ToolError::LoopDetected`] so the model
//! sees a tool failure it can react to.
//!
//! Only 2-cycles are caught; an `A, B, C, A, B, C, ...` loop passes all three
//! detectors.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use skein_config::LoopDetectionConfig;
use skein_core::error::ToolError;
use skein_core::tool::{Tool, ToolRegistry};
use tracing::warn;

/// Result hash recorded for calls the detector refused to run.
pub const BLOCKED: &str = "BLOCKED";

/// Thresholds for the three detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopDetectionSettings {
    pub window_size: usize,
    pub repeat_no_progress: usize,
    pub ping_pong_pairs: usize,
    pub global_breaker: usize,
}

impl Default for LoopDetectionSettings {
    fn default() -> Self {
        Self {
            window_size: 40,
            repeat_no_progress: 8,
            ping_pong_pairs: 5,
            global_breaker: 25,
        }
    }
}

impl From<&LoopDetectionConfig> for LoopDetectionSettings {
    fn from(config: &LoopDetectionConfig) -> Self {
        Self {
            window_size: config.window_size,
            repeat_no_progress: config.repeat_no_progress,
            ping_pong_pairs: config.ping_pong_pairs,
            global_breaker: config.global_breaker,
        }
    }
}

/// One entry of a session's sliding window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub params_hash: String,
    pub result_hash: String,
    pub timestamp: DateTime<Utc>,
}

impl ToolCallRecord {
    fn same_signature(&self, other: &Self) -> bool {
        self.tool_name == other.tool_name
            && self.params_hash == other.params_hash
            && self.result_hash == other.result_hash
    }
}

/// Which detector tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    GlobalCircuitBreaker,
    RepeatedNoProgress,
    PingPong,
}

impl LoopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GlobalCircuitBreaker => "globalCircuitBreaker",
            Self::RepeatedNoProgress => "repeatedNoProgress",
            Self::PingPong => "pingPong",
        }
    }
}

/// A tripped detector and the message shown to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopTrip {
    pub kind: LoopKind,
    pub message: String,
}

impl From<LoopTrip> for ToolError {
    fn from(trip: LoopTrip) -> Self {
        ToolError::LoopDetected {
            detector: trip.kind.as_str().to_string(),
            message: trip.message,
        }
    }
}

type Window = Arc<Mutex<VecDeque<ToolCallRecord>>>;

/// Per-session loop detection state.
///
/// Sessions are created lazily on the first guarded call and live until
/// [`LoopDetector::clear_session`]. Each session window has its own lock so
/// parallel tool calls within one session append safely.
#[derive(Debug, Default)]
pub struct LoopDetector {
    settings: LoopDetectionSettings,
    sessions: Mutex<HashMap<String, Window>>,
}

impl LoopDetector {
    pub fn new(settings: LoopDetectionSettings) -> Self {
        Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> LoopDetectionSettings {
        self.settings
    }

    /// Wrap every tool in `tools` with loop detection keyed by `session_id`.
    /// An empty session id returns the tools unwrapped.
    pub fn wrap(self: &Arc<Self>, tools: &ToolRegistry, session_id: &str) -> ToolRegistry {
        if session_id.is_empty() {
            return tools.clone();
        }
        let mut wrapped = ToolRegistry::new();
        for tool in tools.iter() {
            wrapped.register(Arc::new(LoopGuardedTool {
                inner: Arc::clone(tool),
                detector: Arc::clone(self),
                session_id: session_id.to_string(),
            }));
        }
        wrapped
    }

    /// Drop a session's window once its conversation round is over.
    pub fn clear_session(&self, session_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
    }

    /// Number of sessions currently tracked.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Snapshot of a session's window, oldest first.
    pub fn history(&self, session_id: &str) -> Vec<ToolCallRecord> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        match sessions.get(session_id) {
            Some(window) => window
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    fn window(&self, session_id: &str) -> Window {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            sessions
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new()))),
        )
    }

    fn append(&self, window: &Window, record: ToolCallRecord) {
        let mut history = window.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(record);
        while history.len() > self.settings.window_size {
            history.pop_front();
        }
    }

    /// Check a pending call against the window, recording a `BLOCKED` entry
    /// when a detector trips.
    fn check(&self, session_id: &str, tool_name: &str, params_hash: &str) -> Option<LoopTrip> {
        let window = self.window(session_id);
        let mut history = window.lock().unwrap_or_else(|e| e.into_inner());
        let trip = detect_loop(&self.settings, &history, tool_name, params_hash)?;
        history.push_back(ToolCallRecord {
            tool_name: tool_name.to_string(),
            params_hash: params_hash.to_string(),
            result_hash: BLOCKED.to_string(),
            timestamp: Utc::now(),
        });
        while history.len() > self.settings.window_size {
            history.pop_front();
        }
        Some(trip)
    }
}

/// Run the three detectors, first match wins. `history` excludes the pending call.
pub fn detect_loop(
    settings: &LoopDetectionSettings,
    history: &VecDeque<ToolCallRecord>,
    tool_name: &str,
    params_hash: &str,
) -> Option<LoopTrip> {
    if history.len() < 2 {
        return None;
    }

    let same_call = |r: &ToolCallRecord| r.tool_name == tool_name && r.params_hash == params_hash;

    let global_count = history.iter().filter(|r| same_call(r)).count();
    if global_count >= settings.global_breaker {
        return Some(LoopTrip {
            kind: LoopKind::GlobalCircuitBreaker,
            message: format!(
                "[LoopDetected] Tool \"{tool_name}\" called {global_count} times with identical parameters. Aborting to prevent runaway execution."
            ),
        });
    }

    let repeat = settings.repeat_no_progress;
    if repeat > 0 && history.len() >= repeat {
        let tail: Vec<_> = history.iter().skip(history.len() - repeat).collect();
        let first_result = &tail[0].result_hash;
        if tail
            .iter()
            .all(|r| same_call(r) && &r.result_hash == first_result)
        {
            return Some(LoopTrip {
                kind: LoopKind::RepeatedNoProgress,
                message: format!(
                    "[LoopDetected] Tool \"{tool_name}\" repeated {repeat} times with identical parameters and results, no progress detected. Stop and report what happened so far."
                ),
            });
        }
    }

    let span = settings.ping_pong_pairs * 2;
    if span >= 2 && history.len() >= span {
        let tail: Vec<_> = history.iter().skip(history.len() - span).collect();
        let (even, odd) = (tail[0], tail[1]);
        let alternating = even.tool_name != odd.tool_name
            && tail.iter().enumerate().all(|(i, r)| {
                let expected = if i % 2 == 0 { even } else { odd };
                r.same_signature(expected)
            });
        if alternating {
            return Some(LoopTrip {
                kind: LoopKind::PingPong,
                message: format!(
                    "[LoopDetected] Tools \"{}\" and \"{}\" are alternating with no progress ({} cycles). Stop and report the current state.",
                    even.tool_name, odd.tool_name, settings.ping_pong_pairs
                ),
            });
        }
    }

    None
}

/// 32-bit FNV-1a over the value's text, as lowercase hex.
///
/// Strings hash their contents; everything else hashes its JSON encoding.
/// Input is consumed as UTF-16 code units, so hashes match those produced by
/// JavaScript tooling over the same text.
pub fn fnv1a_hash(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => fnv1a_str(s),
        other => fnv1a_str(&other.to_string()),
    }
}

pub fn fnv1a_str(s: &str) -> String {
    let mut h: u32 = 0x811c_9dc5;
    for unit in s.encode_utf16() {
        h ^= u32::from(unit);
        h = h.wrapping_mul(0x0100_0193);
    }
    format!("{h:x}")
}

/// A tool wrapped with loop detection for one session.
pub struct LoopGuardedTool {
    inner: Arc<dyn Tool>,
    detector: Arc<LoopDetector>,
    session_id: String,
}

#[async_trait]
impl Tool for LoopGuardedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.inner.parameters_schema()
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let tool_name = self.inner.name().to_string();
        let params_hash = fnv1a_hash(&input);

        if let Some(trip) = self.detector.check(&self.session_id, &tool_name, &params_hash) {
            warn!(
                session_id = %self.session_id,
                tool = %tool_name,
                detector = trip.kind.as_str(),
                "Tool call blocked by loop detection"
            );
            return Err(trip.into());
        }

        // Errors propagate without a record, so failing calls never count as no-progress.
        let output = self.inner.execute(input).await?;

        let window = self.detector.window(&self.session_id);
        self.detector.append(
            &window,
            ToolCallRecord {
                tool_name,
                params_hash,
                result_hash: fnv1a_hash(&output),
                timestamp: Utc::now(),
            },
        );

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type OutputFn = Box<dyn Fn(usize) -> serde_json::Value + Send + Sync>;

    /// Counts executions; output is a function of the call index.
    struct ScriptedTool {
        name: &'static str,
        calls: AtomicUsize,
        output: OutputFn,
    }

    impl ScriptedTool {
        fn new(name: &'static str, output: OutputFn) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                output,
            })
        }

        fn constant(name: &'static str) -> Arc<Self> {
            Self::new(name, Box::new(move |_| json!(format!("{name} says the same"))))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Tool for ScriptedTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "scripted"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.output)(n))
        }
    }

    struct BrokenTool;

    #[async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "broken"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Err(ToolError::ExecutionFailed {
                tool_name: "broken".into(),
                reason: "disk full".into(),
            })
        }
    }

    fn guarded(tools: &[Arc<dyn Tool>], session: &str) -> (Arc<LoopDetector>, ToolRegistry) {
        let detector = Arc::new(LoopDetector::default());
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(Arc::clone(tool));
        }
        let wrapped = detector.wrap(&registry, session);
        (detector, wrapped)
    }

    fn detector_of(err: &ToolError) -> &str {
        match err {
            ToolError::LoopDetected { detector, .. } => detector,
            other => panic!("Expected LoopDetected, got {other:?}"),
        }
    }

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(fnv1a_str(""), "811c9dc5");
        assert_eq!(fnv1a_str("a"), "e40c292c");
        assert_eq!(fnv1a_hash(&json!("a")), "e40c292c");
        assert_eq!(fnv1a_hash(&json!({"a": 1})), fnv1a_str(r#"{"a":1}"#));
    }

    #[tokio::test]
    async fn global_breaker_trips_once_window_holds_25_identical_calls() {
        // Results differ every call so only the breaker can fire.
        let tool = ScriptedTool::new("poll", Box::new(|n| json!({ "tick": n })));
        let (_detector, tools) = guarded(&[tool.clone()], "s1");
        let params = json!({"job": "build-42"});

        for _ in 0..25 {
            tools.execute("poll", params.clone()).await.unwrap();
        }
        assert_eq!(tool.calls(), 25);

        let err = tools.execute("poll", params).await.unwrap_err();
        assert_eq!(detector_of(&err), "globalCircuitBreaker");
        assert!(err.to_string().contains("called 25 times"));
        assert_eq!(tool.calls(), 25, "blocked call must not execute");
    }

    #[tokio::test]
    async fn global_breaker_does_not_trip_at_24() {
        let tool = ScriptedTool::new("poll", Box::new(|n| json!(n)));
        let (_detector, tools) = guarded(&[tool.clone()], "s1");

        for _ in 0..24 {
            tools.execute("poll", json!({})).await.unwrap();
        }
        // The 25th call still runs: only 24 matching records precede it.
        tools.execute("poll", json!({})).await.unwrap();
        assert_eq!(tool.calls(), 25);
    }

    #[tokio::test]
    async fn repeated_no_progress_after_8_identical_results() {
        let tool = ScriptedTool::constant("status");
        let (detector, tools) = guarded(&[tool.clone()], "s1");

        for _ in 0..8 {
            tools.execute("status", json!({"id": 1})).await.unwrap();
        }
        let err = tools.execute("status", json!({"id": 1})).await.unwrap_err();
        assert_eq!(detector_of(&err), "repeatedNoProgress");
        assert_eq!(tool.calls(), 8);

        let history = detector.history("s1");
        assert_eq!(history.len(), 9);
        assert_eq!(history.last().unwrap().result_hash, BLOCKED);
    }

    #[tokio::test]
    async fn changed_eighth_result_prevents_no_progress_trip() {
        let tool = ScriptedTool::new(
            "status",
            Box::new(|n| if n == 7 { json!("done") } else { json!("pending") }),
        );
        let (_detector, tools) = guarded(&[tool.clone()], "s1");

        for _ in 0..9 {
            tools.execute("status", json!({"id": 1})).await.unwrap();
        }
        assert_eq!(tool.calls(), 9);
    }

    #[tokio::test]
    async fn no_progress_requires_matching_params() {
        let tool = ScriptedTool::constant("status");
        let (_detector, tools) = guarded(&[tool.clone()], "s1");

        for _ in 0..8 {
            tools.execute("status", json!({"id": 1})).await.unwrap();
        }
        // A different query is not the stuck call.
        tools.execute("status", json!({"id": 2})).await.unwrap();
        assert_eq!(tool.calls(), 9);
    }

    #[tokio::test]
    async fn ping_pong_after_five_alternating_pairs() {
        let a = ScriptedTool::constant("read");
        let b = ScriptedTool::constant("write");
        let (_detector, tools) = guarded(&[a.clone(), b.clone()], "s1");

        for _ in 0..5 {
            tools.execute("read", json!({"path": "/a"})).await.unwrap();
            tools.execute("write", json!({"path": "/a"})).await.unwrap();
        }
        let err = tools.execute("read", json!({"path": "/a"})).await.unwrap_err();
        assert_eq!(detector_of(&err), "pingPong");
        assert!(err.to_string().contains("\"read\" and \"write\""));
        assert_eq!(a.calls() + b.calls(), 10);
    }

    #[tokio::test]
    async fn ping_pong_with_one_changed_result_does_not_trip() {
        let a = ScriptedTool::new(
            "read",
            Box::new(|n| if n == 3 { json!("new content") } else { json!("old") }),
        );
        let b = ScriptedTool::constant("write");
        let (_detector, tools) = guarded(&[a.clone(), b.clone()], "s1");

        for _ in 0..5 {
            tools.execute("read", json!({"path": "/a"})).await.unwrap();
            tools.execute("write", json!({"path": "/a"})).await.unwrap();
        }
        tools.execute("read", json!({"path": "/a"})).await.unwrap();
        assert_eq!(a.calls(), 6);
    }

    #[tokio::test]
    async fn three_cycle_loop_is_not_detected() {
        // Known limitation: only 2-cycles are caught.
        let a = ScriptedTool::constant("list");
        let b = ScriptedTool::constant("read");
        let c = ScriptedTool::constant("grep");
        let (_detector, tools) = guarded(&[a.clone(), b.clone(), c.clone()], "s1");

        for _ in 0..12 {
            for name in ["list", "read", "grep"] {
                tools.execute(name, json!({})).await.unwrap();
            }
        }
        assert_eq!(a.calls() + b.calls() + c.calls(), 36);
    }

    #[tokio::test]
    async fn failed_calls_are_not_recorded() {
        let broken: Arc<dyn Tool> = Arc::new(BrokenTool);
        let (detector, tools) = guarded(&[broken], "s1");

        for _ in 0..12 {
            let err = tools.execute("broken", json!({})).await.unwrap_err();
            assert!(matches!(err, ToolError::ExecutionFailed { .. }));
        }
        assert!(detector.history("s1").is_empty());
    }

    #[tokio::test]
    async fn sessions_are_isolated_and_clearable() {
        let tool = ScriptedTool::constant("status");
        let detector = Arc::new(LoopDetector::default());
        let mut base = ToolRegistry::new();
        base.register(tool.clone());
        let s1 = detector.wrap(&base, "s1");
        let s2 = detector.wrap(&base, "s2");

        for _ in 0..8 {
            s1.execute("status", json!({})).await.unwrap();
        }
        // s2 has its own empty window.
        s2.execute("status", json!({})).await.unwrap();
        assert!(s1.execute("status", json!({})).await.is_err());

        detector.clear_session("s1");
        assert!(detector.history("s1").is_empty());
        s1.execute("status", json!({})).await.unwrap();
        assert_eq!(detector.session_count(), 2);
    }

    #[tokio::test]
    async fn window_is_capped() {
        let tool = ScriptedTool::new("poll", Box::new(|n| json!(n)));
        let detector = Arc::new(LoopDetector::new(LoopDetectionSettings {
            window_size: 10,
            repeat_no_progress: 8,
            ping_pong_pairs: 5,
            global_breaker: 10,
        }));
        let mut base = ToolRegistry::new();
        base.register(tool.clone());
        let tools = detector.wrap(&base, "s1");

        for i in 0..15 {
            tools.execute("poll", json!({ "i": i })).await.unwrap();
        }
        assert_eq!(detector.history("s1").len(), 10);
    }

    #[test]
    fn empty_session_returns_unwrapped_tools() {
        let detector = Arc::new(LoopDetector::default());
        let mut base = ToolRegistry::new();
        base.register(ScriptedTool::constant("status"));
        let tools = detector.wrap(&base, "");
        assert_eq!(tools.len(), 1);
        assert_eq!(detector.session_count(), 0);
    }
}

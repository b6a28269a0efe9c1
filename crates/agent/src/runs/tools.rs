//! Tools that let a model run sub-agents in the background.
//!
//! `spawn_subagent` registers a run and returns immediately; the work happens
//! in a spawned task driven by a [`SubagentRunner`]. The other tools poll,
//! kill, redirect, and list those runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use skein_config::AppConfig;
use skein_core::attachment::Attachment;
use skein_core::error::{RunError, ToolError};
use skein_core::event::RunStatus;
use skein_core::tool::{Tool, ToolRegistry};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{Run, RunRegistry, RunSpec};
use super::store::{
    persist, store_from_config, NewRunRecord, NoopRunStore, RunStore, RunUpdate, StoredRun,
};

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(180);

/// Where a running sub-agent reports progress.
#[derive(Clone)]
pub struct RunSink {
    registry: Arc<RunRegistry>,
    run_id: String,
}

impl RunSink {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Forward partial output. Throttled by the registry.
    pub fn delta(&self, text: impl Into<String>) -> bool {
        self.registry.emit_delta(&self.run_id, text)
    }

    pub fn attachment(&self, attachment: Attachment) -> bool {
        self.registry.emit_attachment(&self.run_id, attachment)
    }
}

/// One unit of background work handed to a [`SubagentRunner`].
pub struct SubagentJob {
    pub run_id: String,
    pub name: String,
    pub task: String,
    /// Cancelled on kill, steer, parent abort, or timeout.
    pub cancel: CancellationToken,
    pub sink: RunSink,
}

/// Executes a sub-agent task to completion and returns its summary.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run(&self, job: SubagentJob) -> Result<String, skein_core::Error>;
}

/// Everything the sub-agent tools share.
#[derive(Clone)]
pub struct SubagentContext {
    pub registry: Arc<RunRegistry>,
    pub store: Arc<dyn RunStore>,
    pub runner: Arc<dyn SubagentRunner>,
    pub bot_id: String,
    /// Run the calling agent belongs to, if it is itself a sub-agent.
    pub parent_run_id: Option<String>,
    /// Depth of the calling agent. Spawned runs sit one level deeper.
    pub spawn_depth: u32,
    pub run_timeout: Duration,
}

impl SubagentContext {
    pub fn new(registry: Arc<RunRegistry>, runner: Arc<dyn SubagentRunner>) -> Self {
        Self {
            registry,
            store: Arc::new(NoopRunStore),
            runner,
            bot_id: String::new(),
            parent_run_id: None,
            spawn_depth: 0,
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    /// Timeout from `runs`, store from `run_store`.
    pub fn from_config(
        registry: Arc<RunRegistry>,
        runner: Arc<dyn SubagentRunner>,
        config: &AppConfig,
    ) -> Self {
        Self::new(registry, runner)
            .with_store(store_from_config(&config.run_store))
            .with_timeout(Duration::from_secs(config.runs.run_timeout_secs))
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_bot_id(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = bot_id.into();
        self
    }

    pub fn with_parent(mut self, parent_run_id: Option<String>, spawn_depth: u32) -> Self {
        self.parent_run_id = parent_run_id;
        self.spawn_depth = spawn_depth;
        self
    }

    pub fn with_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Register a run and start it in the background. Returns the run id.
    pub fn launch(&self, name: &str, task: &str) -> Result<String, RunError> {
        let spec = RunSpec::new(name, task)
            .with_parent(self.parent_run_id.clone())
            .with_depth(self.spawn_depth + 1);
        let run_id = spec.run_id.clone();
        let cancel = spec.cancel.clone();
        let record = NewRunRecord {
            run_id: spec.run_id.clone(),
            bot_id: self.bot_id.clone(),
            name: spec.name.clone(),
            task: spec.task.clone(),
            spawn_depth: spec.spawn_depth,
            parent_run_id: spec.parent_run_id.clone(),
        };
        self.registry.register(spec)?;

        let ctx = self.clone();
        tokio::spawn(async move { ctx.drive(record, cancel).await });
        Ok(run_id)
    }

    async fn drive(self, record: NewRunRecord, cancel: CancellationToken) {
        let deadline = Instant::now() + self.run_timeout;
        let run_id = record.run_id.clone();
        persist("create", &run_id, self.store.create_run(&record)).await;

        let job = SubagentJob {
            run_id: run_id.clone(),
            name: record.name,
            task: record.task,
            cancel: cancel.clone(),
            sink: RunSink {
                registry: Arc::clone(&self.registry),
                run_id: run_id.clone(),
            },
        };

        let outcome = tokio::select! {
            result = self.runner.run(job) => Some(result),
            _ = tokio::time::sleep_until(deadline) => {
                warn!(run_id = %run_id, timeout_secs = self.run_timeout.as_secs(), "Sub-agent run timed out");
                self.registry.abort(&run_id);
                None
            }
            _ = cancel.cancelled() => None,
        };

        let update = match outcome {
            Some(_) if cancel.is_cancelled() => RunUpdate::aborted(),
            Some(Ok(summary)) => {
                self.registry.complete(&run_id, summary.clone());
                RunUpdate::completed(summary)
            }
            Some(Err(e)) => {
                let message = e.to_string();
                self.registry.fail(&run_id, message.clone());
                RunUpdate::failed(message)
            }
            None => {
                debug!(run_id = %run_id, "Sub-agent run cancelled");
                RunUpdate::aborted()
            }
        };
        persist("update", &run_id, self.store.update_run(&run_id, &update)).await;
    }

    /// All five sub-agent tools, ready to be merged into an agent's tool set.
    pub fn tools(self: &Arc<Self>) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SpawnSubagentTool::new(Arc::clone(self))));
        registry.register(Arc::new(CheckSubagentRunTool::new(Arc::clone(self))));
        registry.register(Arc::new(KillSubagentRunTool::new(Arc::clone(self))));
        registry.register(Arc::new(SteerSubagentTool::new(Arc::clone(self))));
        registry.register(Arc::new(ListSubagentRunsTool::new(Arc::clone(self))));
        registry
    }
}

impl std::fmt::Debug for SubagentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubagentContext")
            .field("store", &self.store.name())
            .field("bot_id", &self.bot_id)
            .field("parent_run_id", &self.parent_run_id)
            .field("spawn_depth", &self.spawn_depth)
            .field("run_timeout", &self.run_timeout)
            .finish()
    }
}

fn required_str<'a>(input: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    input[key]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("Missing '{key}' argument")))
}

fn optional_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input[key].as_str().filter(|s| !s.trim().is_empty())
}

fn with_warning(mut body: Value, warning: Option<String>) -> Value {
    if let (Some(warning), Some(map)) = (warning, body.as_object_mut()) {
        map.insert("warning".into(), Value::String(warning));
    }
    body
}

fn run_status_json(run: &Run) -> Value {
    let mut body = json!({
        "runId": run.run_id,
        "name": run.name,
        "task": run.task,
        "status": run.status,
        "result": run.result,
        "error": run.error,
    });
    if let (Some(ended), Some(map)) = (run.ended_at, body.as_object_mut()) {
        map.insert(
            "elapsed_ms".into(),
            json!((ended - run.started_at).num_milliseconds()),
        );
    }
    body
}

fn stored_status_json(run: &StoredRun) -> Value {
    let mut body = json!({
        "runId": run.run_id,
        "name": run.name,
        "task": run.task,
        "status": run.status,
        "result": run.result_summary,
        "error": run.error_message,
    });
    if let (Some(ended), Some(map)) = (run.ended_at, body.as_object_mut()) {
        map.insert(
            "elapsed_ms".into(),
            json!((ended - run.started_at).num_milliseconds()),
        );
    }
    body
}

// --- spawn_subagent ---

pub struct SpawnSubagentTool {
    ctx: Arc<SubagentContext>,
}

impl SpawnSubagentTool {
    pub fn new(ctx: Arc<SubagentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Launch a sub-agent task in the background. Returns a runId you can use with \
         check_subagent_run, kill_subagent_run, and steer_subagent."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Name of the sub-agent to spawn" },
                "task": { "type": "string", "description": "The task to execute" }
            },
            "required": ["name", "task"]
        })
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let name = required_str(&input, "name")?;
        let task = required_str(&input, "task")?;

        let run_id = self.ctx.launch(name, task)?;
        info!(run_id = %run_id, name, "Sub-agent spawned");

        let warning = self.ctx.registry.check_failure_pattern(name);
        Ok(with_warning(
            json!({
                "runId": run_id,
                "name": name,
                "status": RunStatus::Running,
                "message": format!(
                    "Sub-agent \"{name}\" spawned. Use check_subagent_run with runId \"{run_id}\" to poll for results."
                ),
            }),
            warning,
        ))
    }
}

// --- check_subagent_run ---

pub struct CheckSubagentRunTool {
    ctx: Arc<SubagentContext>,
}

impl CheckSubagentRunTool {
    pub fn new(ctx: Arc<SubagentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for CheckSubagentRunTool {
    fn name(&self) -> &str {
        "check_subagent_run"
    }

    fn description(&self) -> &str {
        "Check the status and result of a spawned sub-agent run."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "run_id": { "type": "string", "description": "The runId returned by spawn_subagent" }
            },
            "required": ["run_id"]
        })
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let run_id = required_str(&input, "run_id")?;

        if let Some(run) = self.ctx.registry.get(run_id) {
            return Ok(run_status_json(&run));
        }

        // Swept or from before a restart: ask the store.
        match self.ctx.store.get_run(run_id).await {
            Ok(Some(stored)) => Ok(stored_status_json(&stored)),
            Ok(None) => Ok(json!({ "error": RunError::NotFound(run_id.to_string()).to_string() })),
            Err(e) => {
                warn!(run_id, error = %e, "Run store lookup failed");
                Ok(json!({ "error": RunError::NotFound(run_id.to_string()).to_string() }))
            }
        }
    }
}

// --- kill_subagent_run ---

pub struct KillSubagentRunTool {
    ctx: Arc<SubagentContext>,
}

impl KillSubagentRunTool {
    pub fn new(ctx: Arc<SubagentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for KillSubagentRunTool {
    fn name(&self) -> &str {
        "kill_subagent_run"
    }

    fn description(&self) -> &str {
        "Abort a running sub-agent and everything it spawned. Accepts either a runId or a \
         sub-agent name (kills the first active run with that name)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "run_id": { "type": "string", "description": "The runId to kill" },
                "name": { "type": "string", "description": "Sub-agent name to kill (first active run)" }
            }
        })
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let target = match (optional_str(&input, "run_id"), optional_str(&input, "name")) {
            (Some(run_id), _) => run_id.to_string(),
            (None, Some(name)) => match self.ctx.registry.find_by_name(name) {
                Some(run) => run.run_id,
                None => {
                    return Ok(json!({ "error": format!("No active run found for sub-agent: {name}") }));
                }
            },
            (None, None) => return Ok(json!({ "error": "Provide either run_id or name" })),
        };

        let killed = self.ctx.registry.abort(&target);
        Ok(json!({
            "success": killed > 0,
            "killed_count": killed,
            "message": if killed > 0 {
                format!("Aborted {killed} run(s)")
            } else {
                "Run was not active".to_string()
            },
        }))
    }
}

// --- steer_subagent ---

pub struct SteerSubagentTool {
    ctx: Arc<SubagentContext>,
}

impl SteerSubagentTool {
    pub fn new(ctx: Arc<SubagentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for SteerSubagentTool {
    fn name(&self) -> &str {
        "steer_subagent"
    }

    fn description(&self) -> &str {
        "Redirect a running sub-agent: aborts the current run and spawns a new one with a \
         new instruction. Returns the new runId."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Name of the sub-agent to steer" },
                "new_task": { "type": "string", "description": "New instruction for the sub-agent" },
                "run_id": {
                    "type": "string",
                    "description": "Specific runId to steer (defaults to the first active run by name)"
                }
            },
            "required": ["name", "new_task"]
        })
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let name = required_str(&input, "name")?;
        let new_task = required_str(&input, "new_task")?;

        let existing = match optional_str(&input, "run_id") {
            Some(run_id) => self.ctx.registry.get(run_id),
            None => self.ctx.registry.find_by_name(name),
        };
        if let Some(run) = existing.as_ref().filter(|r| r.status == RunStatus::Running) {
            self.ctx.registry.abort(&run.run_id);
        }

        let new_run_id = self.ctx.launch(name, new_task)?;
        info!(
            previous = existing.as_ref().map(|r| r.run_id.as_str()),
            run_id = %new_run_id,
            name,
            "Sub-agent steered"
        );

        let warning = self.ctx.registry.check_failure_pattern(name);
        Ok(with_warning(
            json!({
                "previous_run_id": existing.map(|r| r.run_id),
                "new_run_id": new_run_id,
                "name": name,
                "status": RunStatus::Running,
                "message": format!(
                    "Sub-agent \"{name}\" steered with new task. Poll check_subagent_run(\"{new_run_id}\")."
                ),
            }),
            warning,
        ))
    }
}

// --- list_subagent_runs ---

pub struct ListSubagentRunsTool {
    ctx: Arc<SubagentContext>,
}

impl ListSubagentRunsTool {
    pub fn new(ctx: Arc<SubagentContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Tool for ListSubagentRunsTool {
    fn name(&self) -> &str {
        "list_subagent_runs"
    }

    fn description(&self) -> &str {
        "List all active and recent sub-agent runs with their status."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "active_only": {
                    "type": "boolean",
                    "description": "Only show running tasks (default: false)"
                }
            }
        })
    }

    async fn execute(&self, input: Value) -> Result<Value, ToolError> {
        let active_only = input["active_only"].as_bool().unwrap_or(false);

        self.ctx.registry.sweep_expired();
        let runs = if active_only {
            self.ctx.registry.list_active(None)
        } else {
            self.ctx.registry.list(None)
        };

        Ok(json!({
            "count": runs.len(),
            "runs": runs,
            "summary": self.ctx.registry.summary(),
        }))
    }
}

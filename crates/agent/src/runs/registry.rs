//! In-memory registry of background sub-agent runs.
//!
//! One mutex guards all mutable state (runs, failure histories, delta
//! throttle timestamps) so that check-then-insert in [`RunRegistry::register`]
//! is atomic and abort cascades never interleave with sweeps. Progress is
//! published on an [`EventBus`] after the lock is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use skein_config::RunsConfig;
use skein_core::attachment::Attachment;
use skein_core::error::RunError;
use skein_core::event::{EventBus, RunEvent, RunStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Failures remembered per agent name.
const FAILURE_HISTORY_CAP: usize = 10;
/// Consecutive failures compared by the pattern check.
const FAILURE_PATTERN_WINDOW: usize = 3;
const FAILURE_SIMILARITY_THRESHOLD: f64 = 0.6;
/// Max characters of result/error/task shown per run in a summary.
const SUMMARY_TEXT_CHARS: usize = 120;

/// Words, with each CJK ideograph as its own token.
static TOKENIZER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Han}|[\w--\p{Han}]+").expect("tokenizer regex is valid"));

/// Generate a unique run id: `run_<unix millis>_<6 hex chars>`.
pub fn generate_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", Utc::now().timestamp_millis(), &suffix[..6])
}

/// Limits and timings for a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistrySettings {
    pub max_children: usize,
    pub max_spawn_depth: u32,
    pub retention: Duration,
    pub delta_throttle: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            max_children: 5,
            max_spawn_depth: 1,
            retention: Duration::from_secs(10 * 60),
            delta_throttle: Duration::from_millis(100),
        }
    }
}

impl From<&RunsConfig> for RegistrySettings {
    fn from(config: &RunsConfig) -> Self {
        Self {
            max_children: config.max_children,
            max_spawn_depth: config.max_spawn_depth,
            retention: Duration::from_secs(config.retention_secs),
            delta_throttle: Duration::from_millis(config.delta_throttle_ms),
        }
    }
}

/// A request to register a run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub run_id: String,
    pub name: String,
    pub task: String,
    pub spawn_depth: u32,
    pub parent_run_id: Option<String>,
    pub cancel: CancellationToken,
}

impl RunSpec {
    /// A top-level run at depth 0 with a fresh id and cancellation token.
    pub fn new(name: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            run_id: generate_run_id(),
            name: name.into(),
            task: task.into(),
            spawn_depth: 0,
            parent_run_id: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_parent(mut self, parent_run_id: Option<String>) -> Self {
        self.parent_run_id = parent_run_id;
        self
    }

    pub fn with_depth(mut self, spawn_depth: u32) -> Self {
        self.spawn_depth = spawn_depth;
        self
    }
}

/// Inspectable view of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub run_id: String,
    pub name: String,
    pub task: String,
    pub status: RunStatus,
    pub spawn_depth: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Wall-clock run time so far, or until it ended.
    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

/// Counts by status plus one descriptor line per run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub aborted: usize,
    pub error: usize,
    pub runs: Vec<String>,
}

struct RunEntry {
    run: Run,
    cancel: CancellationToken,
    seq: u64,
    ended: Option<Instant>,
}

#[derive(Default)]
struct RegistryState {
    runs: HashMap<String, RunEntry>,
    failures: HashMap<String, VecDeque<String>>,
    last_delta: HashMap<String, Instant>,
    next_seq: u64,
}

impl RegistryState {
    fn count_active_by_parent(&self, parent_run_id: Option<&str>) -> usize {
        self.runs
            .values()
            .filter(|e| {
                e.run.status == RunStatus::Running && e.run.parent_run_id.as_deref() == parent_run_id
            })
            .count()
    }

    fn ordered(&self) -> Vec<&RunEntry> {
        let mut entries: Vec<_> = self.runs.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Abort `run_id` and its running descendants depth-first.
    fn abort_cascade(&mut self, run_id: &str, now: Instant, aborted: &mut Vec<Run>) -> usize {
        let mut count = 0;
        let Some(entry) = self.runs.get_mut(run_id) else {
            return 0;
        };

        if entry.run.status == RunStatus::Running {
            entry.cancel.cancel();
            entry.run.status = RunStatus::Aborted;
            entry.run.ended_at = Some(Utc::now());
            entry.ended = Some(now);
            aborted.push(entry.run.clone());
            count += 1;
        }

        let mut children: Vec<(u64, String)> = self
            .runs
            .values()
            .filter(|e| {
                e.run.status == RunStatus::Running
                    && e.run.parent_run_id.as_deref() == Some(run_id)
            })
            .map(|e| (e.seq, e.run.run_id.clone()))
            .collect();
        children.sort();

        for (_, child_id) in children {
            count += self.abort_cascade(&child_id, now, aborted);
        }
        count
    }
}

/// Tracks background runs: registration limits, status transitions,
/// cascade abort, garbage collection and failure-pattern warnings.
pub struct RunRegistry {
    settings: RegistrySettings,
    state: Mutex<RegistryState>,
    events: Arc<EventBus>,
}

impl RunRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self::with_event_bus(settings, Arc::new(EventBus::default()))
    }

    pub fn with_event_bus(settings: RegistrySettings, events: Arc<EventBus>) -> Self {
        Self {
            settings,
            state: Mutex::new(RegistryState::default()),
            events,
        }
    }

    pub fn settings(&self) -> RegistrySettings {
        self.settings
    }

    /// The bus run progress is published on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a run. Both limits are checked before anything is stored.
    pub fn register(&self, spec: RunSpec) -> Result<(), RunError> {
        let mut state = self.lock();

        let active = state.count_active_by_parent(spec.parent_run_id.as_deref());
        if active >= self.settings.max_children {
            return Err(RunError::ConcurrencyLimit {
                max: self.settings.max_children,
            });
        }
        if spec.spawn_depth > self.settings.max_spawn_depth {
            return Err(RunError::DepthLimit {
                max: self.settings.max_spawn_depth,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        info!(run_id = %spec.run_id, name = %spec.name, depth = spec.spawn_depth, "Run registered");
        state.runs.insert(
            spec.run_id.clone(),
            RunEntry {
                run: Run {
                    run_id: spec.run_id,
                    name: spec.name,
                    task: spec.task,
                    status: RunStatus::Running,
                    spawn_depth: spec.spawn_depth,
                    parent_run_id: spec.parent_run_id,
                    result: None,
                    error: None,
                    started_at: Utc::now(),
                    ended_at: None,
                },
                cancel: spec.cancel,
                seq,
                ended: None,
            },
        );
        Ok(())
    }

    pub fn get(&self, run_id: &str) -> Option<Run> {
        self.lock().runs.get(run_id).map(|e| e.run.clone())
    }

    /// The cancellation token of a run, if it is known.
    pub fn cancel_token(&self, run_id: &str) -> Option<CancellationToken> {
        self.lock().runs.get(run_id).map(|e| e.cancel.clone())
    }

    /// First running run with this name, in registration order.
    pub fn find_by_name(&self, name: &str) -> Option<Run> {
        self.lock()
            .ordered()
            .into_iter()
            .find(|e| e.run.name == name && e.run.status == RunStatus::Running)
            .map(|e| e.run.clone())
    }

    /// All runs in registration order, optionally only children of `parent_run_id`.
    pub fn list(&self, parent_run_id: Option<&str>) -> Vec<Run> {
        self.lock()
            .ordered()
            .into_iter()
            .filter(|e| parent_run_id.is_none() || e.run.parent_run_id.as_deref() == parent_run_id)
            .map(|e| e.run.clone())
            .collect()
    }

    pub fn list_active(&self, parent_run_id: Option<&str>) -> Vec<Run> {
        self.list(parent_run_id)
            .into_iter()
            .filter(|r| r.status == RunStatus::Running)
            .collect()
    }

    /// Running runs whose parent is `parent_run_id` (`None` means top-level).
    pub fn count_active_by_parent(&self, parent_run_id: Option<&str>) -> usize {
        self.lock().count_active_by_parent(parent_run_id)
    }

    /// Mark a run completed. Returns false if unknown or already terminal.
    pub fn complete(&self, run_id: &str, result: impl Into<String>) -> bool {
        let result = result.into();
        self.finish(run_id, RunStatus::Completed, |run| run.result = Some(result))
    }

    /// Mark a run failed and remember the error for pattern detection.
    /// Returns false if unknown or already terminal.
    pub fn fail(&self, run_id: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.finish(run_id, RunStatus::Error, |run| run.error = Some(error))
    }

    fn finish(&self, run_id: &str, status: RunStatus, apply: impl FnOnce(&mut Run)) -> bool {
        let event = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(entry) = state.runs.get_mut(run_id) else {
                return false;
            };
            if entry.run.status.is_terminal() {
                return false;
            }
            entry.run.status = status;
            apply(&mut entry.run);
            let now = Utc::now();
            entry.run.ended_at = Some(now);
            entry.ended = Some(Instant::now());

            // History is updated before the status event goes out.
            if status == RunStatus::Error {
                let history = state.failures.entry(entry.run.name.clone()).or_default();
                history.push_back(entry.run.error.clone().unwrap_or_default());
                while history.len() > FAILURE_HISTORY_CAP {
                    history.pop_front();
                }
            }

            let event = RunEvent::Status {
                run_id: run_id.to_string(),
                name: entry.run.name.clone(),
                status,
                timestamp: now,
            };
            state.last_delta.remove(run_id);
            event
        };
        info!(run_id, status = %status, "Run finished");
        self.events.publish(event);
        true
    }

    /// Abort a run and every running descendant. Returns how many runs were
    /// aborted; already-terminal runs are neither touched nor counted.
    pub fn abort(&self, run_id: &str) -> usize {
        let mut aborted = Vec::new();
        let count = {
            let mut state = self.lock();
            let count = state.abort_cascade(run_id, Instant::now(), &mut aborted);
            for run in &aborted {
                state.last_delta.remove(&run.run_id);
            }
            count
        };
        for run in aborted {
            info!(run_id = %run.run_id, name = %run.name, "Run aborted");
            self.events.publish(RunEvent::Status {
                run_id: run.run_id,
                name: run.name,
                status: RunStatus::Aborted,
                timestamp: run.ended_at.unwrap_or_else(Utc::now),
            });
        }
        count
    }

    /// Drop terminal runs that ended more than `max_age` ago and trim failure
    /// histories. Running runs are never removed. Returns the number of runs
    /// removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.lock();

        let expired: Vec<String> = state
            .runs
            .iter()
            .filter(|(_, e)| matches!(e.ended, Some(ended) if now.duration_since(ended) > max_age))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            state.runs.remove(id);
            state.last_delta.remove(id);
        }

        state.failures.retain(|_, history| {
            while history.len() > FAILURE_HISTORY_CAP {
                history.pop_front();
            }
            !history.is_empty()
        });

        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept finished runs");
        }
        expired.len()
    }

    /// Sweep with the configured retention window.
    pub fn sweep_expired(&self) -> usize {
        self.sweep(self.settings.retention)
    }

    /// Warn when the last three failures of `name` look alike.
    ///
    /// Consecutive error texts are compared as token sets (words, and single
    /// CJK ideographs); both adjacent pairs must exceed 0.6 Jaccard
    /// similarity.
    pub fn check_failure_pattern(&self, name: &str) -> Option<String> {
        let recent: Vec<String> = {
            let state = self.lock();
            let history = state.failures.get(name)?;
            if history.len() < FAILURE_PATTERN_WINDOW {
                return None;
            }
            history
                .iter()
                .skip(history.len() - FAILURE_PATTERN_WINDOW)
                .cloned()
                .collect()
        };

        let similar = recent
            .windows(2)
            .all(|pair| similarity(&pair[0], &pair[1]) > FAILURE_SIMILARITY_THRESHOLD);
        if !similar {
            return None;
        }

        let latest = truncate_chars(&recent[recent.len() - 1], SUMMARY_TEXT_CHARS);
        Some(format!(
            "Sub-agent \"{name}\" failed {FAILURE_PATTERN_WINDOW} times in a row with similar errors (latest: \"{latest}\"). Change the task or approach instead of retrying the same thing."
        ))
    }

    /// Publish a progress delta for a running run, dropping it if the
    /// previous one for the same run went out less than the throttle
    /// interval ago. Returns whether the delta was published.
    pub fn emit_delta(&self, run_id: &str, text: impl Into<String>) -> bool {
        let event = {
            let mut state = self.lock();
            let name = match state.runs.get(run_id) {
                Some(e) if e.run.status == RunStatus::Running => e.run.name.clone(),
                _ => return false,
            };
            let now = Instant::now();
            if let Some(last) = state.last_delta.get(run_id) {
                if now.duration_since(*last) < self.settings.delta_throttle {
                    return false;
                }
            }
            state.last_delta.insert(run_id.to_string(), now);
            RunEvent::Delta {
                run_id: run_id.to_string(),
                name,
                text: text.into(),
            }
        };
        self.events.publish(event);
        true
    }

    /// Publish an attachment produced by a running run.
    pub fn emit_attachment(&self, run_id: &str, attachment: Attachment) -> bool {
        let name = match self.get(run_id) {
            Some(run) if run.status == RunStatus::Running => run.name,
            _ => return false,
        };
        self.events.publish(RunEvent::Attachment {
            run_id: run_id.to_string(),
            name,
            attachment,
        });
        true
    }

    /// Counts by status plus one length-capped line per run.
    pub fn summary(&self) -> RunSummary {
        let runs = self.list(None);
        let mut summary = RunSummary {
            total: runs.len(),
            ..RunSummary::default()
        };
        for run in &runs {
            match run.status {
                RunStatus::Running => summary.running += 1,
                RunStatus::Completed => summary.completed += 1,
                RunStatus::Aborted => summary.aborted += 1,
                RunStatus::Error => summary.error += 1,
            }
            let text = run
                .result
                .as_deref()
                .or(run.error.as_deref())
                .unwrap_or(&run.task);
            summary.runs.push(format!(
                "[{}] {} ({}): {} ({}s)",
                run.status,
                run.name,
                run.run_id,
                truncate_chars(&single_line(text), SUMMARY_TEXT_CHARS),
                run.elapsed().num_seconds().max(0)
            ));
        }
        summary
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new(RegistrySettings::default())
    }
}

impl std::fmt::Debug for RunRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RunRegistry")
            .field("settings", &self.settings)
            .field("runs", &state.runs.len())
            .field("failure_histories", &state.failures.len())
            .finish()
    }
}

/// Jaccard similarity of the two texts' token sets.
fn similarity(a: &str, b: &str) -> f64 {
    let ta = tokens(a);
    let tb = tokens(b);
    let union = ta.union(&tb).count();
    if union == 0 {
        return 1.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

fn tokens(text: &str) -> HashSet<String> {
    TOKENIZER
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

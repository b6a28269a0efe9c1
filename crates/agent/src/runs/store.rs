//! Best-effort run history store.
//!
//! The in-memory registry is the source of truth while the process lives;
//! the store only lets runs be looked up after a restart. Every call is
//! allowed to fail: callers go through [`persist`], which logs and moves on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skein_config::RunStoreConfig;
use skein_core::error::PersistenceError;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Row created when a run is spawned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunRecord {
    pub run_id: String,
    pub bot_id: String,
    pub name: String,
    pub task: String,
    pub spawn_depth: u32,
    pub parent_run_id: Option<String>,
}

/// Terminal status as recorded in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredStatus {
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Patch applied when a run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunUpdate {
    pub status: StoredStatus,
    pub result_summary: Option<String>,
    pub error_message: Option<String>,
}

impl RunUpdate {
    pub fn completed(summary: impl Into<String>) -> Self {
        Self {
            status: StoredStatus::Completed,
            result_summary: Some(summary.into()),
            error_message: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: StoredStatus::Failed,
            result_summary: None,
            error_message: Some(error.into()),
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: StoredStatus::Aborted,
            result_summary: None,
            error_message: None,
        }
    }
}

/// A run as the store returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRun {
    pub run_id: String,
    pub name: String,
    pub task: String,
    pub status: StoredStatus,
    #[serde(default)]
    pub result_summary: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    fn name(&self) -> &str;

    async fn create_run(&self, record: &NewRunRecord) -> Result<(), PersistenceError>;

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<(), PersistenceError>;

    /// Look up a run the in-memory registry no longer knows.
    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>, PersistenceError>;
}

/// Await a store call and swallow its failure with a warning.
pub async fn persist<F>(operation: &str, run_id: &str, call: F)
where
    F: std::future::Future<Output = Result<(), PersistenceError>>,
{
    if let Err(e) = call.await {
        warn!(run_id, operation, error = %e, "Run store call failed; continuing");
    }
}

/// Store that keeps nothing. The default when no store URL is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRunStore;

#[async_trait]
impl RunStore for NoopRunStore {
    fn name(&self) -> &str {
        "noop"
    }

    async fn create_run(&self, _record: &NewRunRecord) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn update_run(&self, _run_id: &str, _update: &RunUpdate) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn get_run(&self, _run_id: &str) -> Result<Option<StoredRun>, PersistenceError> {
        Ok(None)
    }
}

/// The HTTP store when a base URL is configured, otherwise the no-op store.
pub fn store_from_config(config: &RunStoreConfig) -> Arc<dyn RunStore> {
    match config.base_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Arc::new(HttpRunStore::new(url)),
        _ => Arc::new(NoopRunStore),
    }
}

/// Store backed by the run history HTTP API:
/// `POST /subagent-runs`, `PATCH /subagent-runs/{id}`, `GET /subagent-runs/{id}`.
pub struct HttpRunStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRunStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    fn run_url(&self, run_id: &str) -> String {
        format!("{}/subagent-runs/{}", self.base_url, run_id)
    }
}

fn check_status(response: &reqwest::Response) -> Result<(), PersistenceError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(PersistenceError::Status {
            status_code: status.as_u16(),
        })
    }
}

#[async_trait]
impl RunStore for HttpRunStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_run(&self, record: &NewRunRecord) -> Result<(), PersistenceError> {
        let response = self
            .client
            .post(format!("{}/subagent-runs", self.base_url))
            .json(record)
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        check_status(&response)
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<(), PersistenceError> {
        let response = self
            .client
            .patch(self.run_url(run_id))
            .json(update)
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        check_status(&response)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<StoredRun>, PersistenceError> {
        let response = self
            .client
            .get(self.run_url(run_id))
            .send()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(&response)?;
        let run = response
            .json::<StoredRun>()
            .await
            .map_err(|e| PersistenceError::Request(e.to_string()))?;
        Ok(Some(run))
    }
}

impl std::fmt::Debug for HttpRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRunStore")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_serializes_like_the_api_expects() {
        let json = serde_json::to_value(RunUpdate::failed("boom")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "status": "failed",
                "result_summary": null,
                "error_message": "boom"
            })
        );
    }

    #[test]
    fn stored_run_parses_with_missing_optionals() {
        let run: StoredRun = serde_json::from_str(
            r#"{"run_id":"run_1_abcdef","name":"w","task":"t","status":"completed","started_at":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(run.status, StoredStatus::Completed);
        assert!(run.ended_at.is_none());
    }

    #[test]
    fn http_store_normalizes_base_url() {
        let store = HttpRunStore::new("http://localhost:8080/");
        assert_eq!(
            store.run_url("run_1"),
            "http://localhost:8080/subagent-runs/run_1"
        );
    }

    #[test]
    fn config_selects_store() {
        let http = store_from_config(&RunStoreConfig {
            base_url: Some("http://runs.internal".into()),
        });
        assert_eq!(http.name(), "http");

        let blank = store_from_config(&RunStoreConfig {
            base_url: Some("  ".into()),
        });
        assert_eq!(blank.name(), "noop");
        assert_eq!(store_from_config(&RunStoreConfig::default()).name(), "noop");
    }

    #[tokio::test]
    async fn unreachable_store_fails_softly() {
        // Port 9 (discard) on localhost is closed in test environments.
        let store = HttpRunStore::new("http://127.0.0.1:9");
        let result = store.update_run("run_1", &RunUpdate::aborted()).await;
        assert!(matches!(result, Err(PersistenceError::Request(_))));
        persist("update", "run_1", store.update_run("run_1", &RunUpdate::aborted())).await;
    }

    #[tokio::test]
    async fn noop_store_accepts_everything() {
        let store = NoopRunStore;
        persist(
            "create",
            "run_1",
            store.create_run(&NewRunRecord {
                run_id: "run_1".into(),
                bot_id: "bot".into(),
                name: "w".into(),
                task: "t".into(),
                spawn_depth: 1,
                parent_run_id: None,
            }),
        )
        .await;
        assert!(store.get_run("run_1").await.unwrap().is_none());
    }
}

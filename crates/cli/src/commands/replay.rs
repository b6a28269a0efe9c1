//! `skein replay`: run a recorded provider stream through the translator.
//!
//! The recording is JSONL, one provider chunk per line (blank lines are
//! skipped). Each resulting action is printed as an SSE frame.

use std::path::Path;

use skein_agent::{StreamTranslator, TruncationPolicy};
use skein_config::AppConfig;
use skein_core::provider::StreamChunk;

pub async fn run(
    file: &Path,
    context_window: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let mut transport = config.transport.clone();
    if let Some(window) = context_window {
        transport.context_window = window;
    }

    let content = tokio::fs::read_to_string(file)
        .await
        .map_err(|e| format!("Failed to read {}: {e}", file.display()))?;
    let chunks = parse_recording(&content)?;
    tracing::debug!(chunks = chunks.len(), file = %file.display(), "Replaying recording");

    for frame in render(chunks, TruncationPolicy::from(&transport)).await? {
        print!("{frame}");
    }
    Ok(())
}

/// Parse a JSONL recording into chunks.
pub fn parse_recording(content: &str) -> Result<Vec<StreamChunk>, String> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| format!("Line {}: invalid chunk: {e}", i + 1))
        })
        .collect()
}

/// Translate `chunks` and encode every action as an SSE frame.
pub async fn render(
    chunks: Vec<StreamChunk>,
    policy: TruncationPolicy,
) -> Result<Vec<String>, serde_json::Error> {
    let mut actions = StreamTranslator::new(policy)
        .with_input(serde_json::json!({ "replay": true }))
        .translate(futures::stream::iter(chunks));

    let mut frames = Vec::new();
    while let Some(action) = actions.recv().await {
        frames.push(action.to_sse()?);
    }
    Ok(frames)
}

//! Process-wide fallback registry.
//!
//! Prefer a registry owned by the agent. This one exists for callers that
//! have no handle to pass around: it is created on first use together with a
//! background task that sweeps it every five minutes, and [`reset_global`]
//! tears both down again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use super::registry::{RegistrySettings, RunRegistry};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct GlobalRegistry {
    registry: Arc<RunRegistry>,
    sweeper: Option<JoinHandle<()>>,
}

static GLOBAL: Mutex<Option<GlobalRegistry>> = Mutex::new(None);

/// The process-wide registry, created with default settings on first call.
///
/// The periodic sweeper is only started when called from inside a tokio
/// runtime.
pub fn global() -> Arc<RunRegistry> {
    let mut slot = GLOBAL.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = slot.as_ref() {
        return Arc::clone(&existing.registry);
    }

    let registry = Arc::new(RunRegistry::new(RegistrySettings::default()));
    let sweeper = tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.spawn(sweep_periodically(Arc::clone(&registry), SWEEP_INTERVAL)));
    debug!(sweeper = sweeper.is_some(), "Global run registry created");

    *slot = Some(GlobalRegistry {
        registry: Arc::clone(&registry),
        sweeper,
    });
    registry
}

/// Stop the sweeper and drop the process-wide registry. The next
/// [`global`] call starts fresh.
pub fn reset_global() {
    let previous = GLOBAL.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(GlobalRegistry {
        sweeper: Some(handle),
        ..
    }) = previous
    {
        handle.abort();
    }
}

/// Sweep `registry` with its retention window every `interval`.
pub async fn sweep_periodically(registry: Arc<RunRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let removed = registry.sweep_expired();
        if removed > 0 {
            debug!(removed, "Periodic run sweep");
        }
    }
}

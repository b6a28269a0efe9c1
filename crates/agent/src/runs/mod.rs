//! Background sub-agent runs: the registry that tracks them, the tools a
//! model drives them with, and the best-effort store that outlives a restart.

pub mod global;
pub mod registry;
pub mod store;
pub mod tools;

pub use global::{global, reset_global, sweep_periodically};
pub use registry::{generate_run_id, RegistrySettings, Run, RunRegistry, RunSpec, RunSummary};
pub use store::{
    store_from_config, HttpRunStore, NewRunRecord, NoopRunStore, RunStore, RunUpdate, StoredRun,
    StoredStatus,
};
pub use tools::{RunSink, SubagentContext, SubagentJob, SubagentRunner};

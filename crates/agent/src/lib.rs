//! The Skein agent runtime.
//!
//! An [`Agent`] answers one request at a time, streamed or not. Around it:
//!
//! 1. **Loop detection** wraps the tools of every request and blocks calls
//!    that make no progress
//! 2. **Retry** re-attempts transient provider failures with backoff
//! 3. **Stream translation** turns provider chunks into the client action
//!    protocol, always bracketed by `agent_start` and `agent_end`
//! 4. **Runs** track background sub-agents spawned through model tools
//!
//! Persona text for system prompts comes from a TTL cache in [`prompt_cache`].

pub mod agent;
pub mod loop_detection;
pub mod prompt_cache;
pub mod retry;
pub mod runs;
pub mod stream;

#[cfg(test)]
mod test_helpers;

pub use agent::{
    sanitize_messages, Agent, AgentInput, AgentOutput, ChildAgentRunner, SubagentInput,
    SubagentOutput,
};
pub use loop_detection::{LoopDetectionSettings, LoopDetector, LoopKind, LoopTrip};
pub use prompt_cache::{
    PersonaFiles, PersonaSource, PromptCacheSettings, StaticPersona, SystemFileCache, SystemMode,
};
pub use retry::{is_retryable_llm_error, with_retry, RetryPolicy};
pub use runs::{
    HttpRunStore, NoopRunStore, RegistrySettings, Run, RunRegistry, RunSink, RunStore,
    SubagentContext, SubagentJob, SubagentRunner,
};
pub use stream::{Action, StreamTranslator, TruncationPolicy};

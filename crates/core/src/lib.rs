//! # Skein Core
//!
//! Domain types, traits, and error definitions for the Skein agent
//! orchestration runtime. This crate has no runtime machinery of its own: it
//! defines the vocabulary the agent crate implements against.
//!
//! ## Design Philosophy
//!
//! Every external collaborator is a trait here:
//! - [`ModelProvider`]: the model client (non-streaming and streaming)
//! - [`Tool`]: one callable exposed to the model
//!
//! Implementations live elsewhere, so tests can swap in scripted mocks.

pub mod attachment;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use attachment::Attachment;
pub use error::{Error, PersistenceError, ProviderError, Result, RunError, ToolError};
pub use event::{EventBus, RunEvent, RunStatus};
pub use message::{ContentPart, MessageContent, ModelMessage, Role};
pub use provider::{
    GeneratedFile, ModelProvider, ProviderRequest, ProviderResponse, RawUsage, StreamChunk,
    StreamError, Usage,
};
pub use tool::{Tool, ToolDefinition, ToolRegistry};

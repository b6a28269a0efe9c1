//! Streaming: the action protocol, the chunk translator, and the helpers that
//! keep payloads transport-safe.

pub mod action;
pub mod attachments;
pub mod translator;
pub mod transport;

pub use action::Action;
pub use attachments::{
    dedupe_attachments, extract_attachments_from_text, strip_attachments_from_messages,
    AttachmentsStreamExtractor, Extracted,
};
pub use translator::StreamTranslator;
pub use transport::{
    compute_max_tool_result_chars, sanitize_tool_chunk_metadata, strip_reasoning_from_messages,
    truncate_messages_for_transport, TruncationPolicy,
};

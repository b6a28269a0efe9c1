//! Error types for the Skein domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.

use thiserror::Error;

/// The top-level error type for all Skein operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Run registry errors ---
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    // --- Run history store ---
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures from the model provider client.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// The HTTP-like status code carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ApiError { status_code, .. } => Some(*status_code),
            Self::RateLimited { .. } => Some(429),
            Self::AuthenticationFailed(_) => Some(401),
            _ => None,
        }
    }
}

/// Failures surfaced to the model as a tool result.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// A loop detector blocked the call before it ran. Recoverable: the model
    /// reads `message` and is expected to change strategy.
    #[error("{message}")]
    LoopDetected { detector: String, message: String },

    #[error("{0}")]
    Run(#[from] RunError),
}

/// Failures raised by the run registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("Max concurrent sub-agents reached ({max}). Kill an existing one first.")]
    ConcurrencyLimit { max: usize },

    #[error(
        "Max spawn depth reached ({max}). Sub-agents at this depth cannot spawn children."
    )]
    DepthLimit { max: u32 },

    #[error("Run not found: {0}")]
    NotFound(String),
}

/// Failures from the best-effort run history store. Always logged and
/// swallowed by callers, never propagated into the core.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Run store request failed: {0}")]
    Request(String),

    #[error("Run store returned status {status_code}")]
    Status { status_code: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn status_codes_for_typed_errors() {
        assert_eq!(
            ProviderError::RateLimited { retry_after_secs: 5 }.status_code(),
            Some(429)
        );
        assert_eq!(
            ProviderError::AuthenticationFailed("bad key".into()).status_code(),
            Some(401)
        );
        assert_eq!(ProviderError::Network("reset".into()).status_code(), None);
    }

    #[test]
    fn run_errors_mention_limits() {
        let err = RunError::ConcurrencyLimit { max: 5 };
        assert!(err.to_string().contains("(5)"));
        let err = RunError::DepthLimit { max: 1 };
        assert!(err.to_string().contains("spawn depth"));
    }

    #[test]
    fn loop_detected_displays_only_message() {
        let err = ToolError::LoopDetected {
            detector: "pingPong".into(),
            message: "[LoopDetected] stop".into(),
        };
        assert_eq!(err.to_string(), "[LoopDetected] stop");
    }
}

//! Error types for the Gateway

use thiserror::Error;

use crate::hitl::ApprovalOutcome;

/// Gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Approval not found: {0}")]
    ApprovalNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Unknown agent label, duplicate registration, bad config file. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Classifier or marketplace failure; the session is left as it was.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The gated action was rejected or its approval timed out.
    #[error("Action not authorized: {0}")]
    Authorization(ApprovalOutcome),

    /// The action was abandoned before completing, e.g. a task-wait timeout.
    #[error("Action aborted: {0}")]
    Aborted(String),

    #[error("Session {session_id} already has decision {decision_id} pending")]
    ApprovalAlreadyPending {
        session_id: String,
        decision_id: String,
    },

    #[error("Decision {0} is already being awaited")]
    AlreadyAwaited(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput(_) => "invalid_input",
            GatewayError::SessionNotFound(_) | GatewayError::ApprovalNotFound(_) => "not_found",
            GatewayError::Configuration(_) | GatewayError::AgentNotFound(_) => "configuration",
            GatewayError::Transient(_) => "transient",
            GatewayError::Authorization(_) => "authorization",
            GatewayError::Aborted(_) => "aborted",
            GatewayError::ApprovalAlreadyPending { .. } | GatewayError::AlreadyAwaited(_) => {
                "conflict"
            }
            GatewayError::Io(_) | GatewayError::Serialization(_) | GatewayError::Internal(_) => {
                "internal"
            }
        }
    }

    /// Whether the caller may retry the same call unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for GatewayError {
    fn from(e: toml::de::Error) -> Self {
        GatewayError::Configuration(e.to_string())
    }
}

impl From<toml::ser::Error> for GatewayError {
    fn from(e: toml::ser::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

/// Result type for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

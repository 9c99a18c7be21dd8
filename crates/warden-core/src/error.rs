//! Error types for Warden Core
//!
//! Each component has its own error enum so callers can tell fatal
//! configuration problems from transient marketplace failures.

use thiserror::Error;

use crate::deal::TaskStatus;
use crate::tag::ConfidentialityTag;
use crate::types::{Address, Bytes32};

/// Result type alias for low-level core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Encoding and signing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid hex: {0}")]
    InvalidHex(String),

    #[error("Signature error: {0}")]
    Signature(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serialization(e.to_string())
    }
}

/// Errors reported by the external marketplace
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarketError {
    /// The marketplace could not be reached or answered with an error.
    #[error("Marketplace unavailable: {0}")]
    Unavailable(String),

    #[error("Not found on marketplace: {0}")]
    NotFound(String),

    /// The marketplace refused a state-changing call.
    #[error("Marketplace rejected the call: {0}")]
    Rejected(String),
}

/// Errors raised while building orders and brokering deals
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("No app order available for {0}")]
    NoAppOrder(Address),

    #[error("Workload requires a {kind} order but none was found")]
    MissingOrder { kind: &'static str },

    #[error("{kind} order price {price} exceeds the request ceiling {max}")]
    PriceExceeded {
        kind: &'static str,
        price: u64,
        max: u64,
    },

    #[error("{kind} order tag {offered} does not satisfy required tag {required}")]
    TagMismatch {
        kind: &'static str,
        required: ConfidentialityTag,
        offered: ConfidentialityTag,
    },

    #[error("Order references {found} but the request expects {expected}")]
    ResourceMismatch { expected: Address, found: Address },

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl BrokerError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Market(MarketError::Unavailable(_))
        )
    }
}

/// Errors raised while following a task to completion
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Task {task_id} did not reach a terminal state in time (last seen: {last_status:?})")]
    Timeout {
        task_id: Bytes32,
        last_status: Option<TaskStatus>,
    },

    /// The marketplace reported a terminal failure; `cause` is its message verbatim.
    #[error("Task {task_id} failed with {status}: {cause}")]
    TaskFailed {
        task_id: Bytes32,
        status: TaskStatus,
        cause: String,
    },

    #[error("Task {task_id} does not belong to deal {deal_id}")]
    TaskNotInDeal { deal_id: Bytes32, task_id: Bytes32 },

    #[error("Task {task_id} is not finalized yet ({status})")]
    NotFinalized { task_id: Bytes32, status: TaskStatus },

    #[error(transparent)]
    Market(#[from] MarketError),
}

/// Errors that prevent the verifier from reaching a verdict at all
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttestationError {
    #[error("Replay store failure: {0}")]
    ReplayStore(String),

    #[error("Canonicalization failed: {0}")]
    Canonicalization(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<rusqlite::Error> for AttestationError {
    fn from(e: rusqlite::Error) -> Self {
        AttestationError::ReplayStore(e.to_string())
    }
}

//! Deals, tasks and execution receipts
//!
//! A deal is what the marketplace records after matching a request order
//! against supply orders. It owns one task per unit of volume; task ids are
//! derived deterministically from the deal id and the task index.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crypto::{keccak256, u256_word};
use crate::tag::{ConfidentialityTag, EnclaveClass};
use crate::types::{Address, Bytes32, Timestamp};

/// Derive the id of task `index` in deal `deal_id`: `keccak256(deal_id ‖ uint256(index))`.
pub fn compute_task_id(deal_id: &Bytes32, index: u64) -> Bytes32 {
    let mut material = [0u8; 64];
    material[..32].copy_from_slice(deal_id.as_bytes());
    material[32..].copy_from_slice(&u256_word(index));
    keccak256(material)
}

/// Task lifecycle as reported by the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Received,
    Initializing,
    Initialized,
    InitializeFailed,
    Running,
    RunFailed,
    ContributionTimeout,
    ConsensusReached,
    Revealed,
    ResultUploading,
    ResultUploaded,
    ResultUploadFailed,
    Finalizing,
    FinalizeFailed,
    Finalized,
    Completed,
    FinalDeadlineReached,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        self.is_success() || self.is_failure()
    }

    pub fn is_success(self) -> bool {
        matches!(self, TaskStatus::Finalized | TaskStatus::Completed)
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            TaskStatus::InitializeFailed
                | TaskStatus::RunFailed
                | TaskStatus::ContributionTimeout
                | TaskStatus::ResultUploadFailed
                | TaskStatus::FinalizeFailed
                | TaskStatus::FinalDeadlineReached
        )
    }

    /// Position along the success path, used to spot out-of-order reports.
    pub fn progress(self) -> u8 {
        use TaskStatus::*;
        match self {
            Received => 0,
            Initializing => 1,
            Initialized => 2,
            Running => 3,
            ConsensusReached => 4,
            Revealed => 5,
            ResultUploading => 6,
            ResultUploaded => 7,
            Finalizing => 8,
            Finalized | Completed => 9,
            InitializeFailed | RunFailed | ContributionTimeout | ResultUploadFailed
            | FinalizeFailed | FinalDeadlineReached => u8::MAX,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", name)
    }
}

/// Outcome of a successful order match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokeredDeal {
    pub deal_id: Bytes32,
    pub volume: u64,
}

impl BrokeredDeal {
    /// Ids of every task in the deal, in index order.
    pub fn task_ids(&self) -> Vec<Bytes32> {
        (0..self.volume)
            .map(|index| compute_task_id(&self.deal_id, index))
            .collect()
    }
}

/// Deal as read back from the marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealView {
    pub deal_id: Bytes32,
    pub app: Address,
    pub app_price: u64,
    pub dataset: Option<Address>,
    pub dataset_price: u64,
    pub workerpool: Option<Address>,
    pub workerpool_price: u64,
    pub requester: Address,
    pub tag: ConfidentialityTag,
    pub volume: u64,
    pub created_at: Timestamp,
}

/// Task as read back from the marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskView {
    pub task_id: Bytes32,
    pub deal_id: Bytes32,
    pub index: u64,
    pub status: TaskStatus,
    /// Failure code reported by the marketplace, if any.
    pub failure_code: Option<String>,
    /// Location of the uploaded results, once available.
    pub results: Option<String>,
}

/// Payment split and trust facts for one finalized task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReceipt {
    pub deal_id: Bytes32,
    pub task_id: Bytes32,
    pub enclave: EnclaveClass,
    pub app_payment: u64,
    pub dataset_payment: u64,
    pub workerpool_payment: u64,
    pub workerpool_penalized: bool,
    pub failed: bool,
}

impl ExecutionReceipt {
    pub fn total_paid(&self) -> u64 {
        self.app_payment
            .saturating_add(self.dataset_payment)
            .saturating_add(self.workerpool_payment)
    }
}

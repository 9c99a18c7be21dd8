//! Task tracking
//!
//! Follows a task until the marketplace reports a terminal state and turns
//! the finished task into an execution receipt.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deal::{ExecutionReceipt, TaskStatus, TaskView};
use crate::error::{MarketError, TrackerError};
use crate::market::Marketplace;
use crate::types::Bytes32;

/// Result type alias for tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Default delay between two task polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Polls task state on the marketplace
pub struct TaskTracker {
    market: Arc<dyn Marketplace>,
    poll_interval: Duration,
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl TaskTracker {
    pub fn new(market: Arc<dyn Marketplace>) -> Self {
        Self {
            market,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Poll until the task reaches a terminal state or `timeout` elapses.
    ///
    /// Transient poll errors are logged and retried until the deadline. A
    /// terminal failure carries the marketplace's failure code verbatim.
    pub async fn wait_for_completion(&self, task_id: &Bytes32, timeout: Duration) -> Result<TaskView> {
        let deadline = Instant::now() + timeout;
        let mut last_status: Option<TaskStatus> = None;

        loop {
            match self.market.task(task_id).await {
                Ok(view) => {
                    if last_status != Some(view.status) {
                        match last_status {
                            Some(previous) => {
                                info!("Task {}: {} -> {}", task_id, previous, view.status)
                            }
                            None => info!("Task {}: {}", task_id, view.status),
                        }
                        last_status = Some(view.status);
                    }

                    if view.status.is_success() {
                        return Ok(view);
                    }
                    if view.status.is_failure() {
                        let cause = view
                            .failure_code
                            .clone()
                            .unwrap_or_else(|| view.status.to_string());
                        return Err(TrackerError::TaskFailed {
                            task_id: *task_id,
                            status: view.status,
                            cause,
                        });
                    }
                }
                Err(MarketError::Unavailable(reason)) => {
                    warn!("Polling task {} failed, retrying: {}", task_id, reason);
                }
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TrackerError::Timeout {
                    task_id: *task_id,
                    last_status,
                });
            }
            let pause = self.poll_interval.min(deadline - now);
            debug!("Task {} not terminal, next poll in {:?}", task_id, pause);
            tokio::time::sleep(pause).await;
        }
    }

    /// Receipt for a terminal task of `deal_id`.
    pub async fn get_execution_receipt(
        &self,
        deal_id: &Bytes32,
        task_id: &Bytes32,
    ) -> Result<ExecutionReceipt> {
        let deal = self.market.deal(deal_id).await?;
        let task = self.market.task(task_id).await?;

        if task.deal_id != *deal_id {
            return Err(TrackerError::TaskNotInDeal {
                deal_id: *deal_id,
                task_id: *task_id,
            });
        }
        if !task.status.is_terminal() {
            return Err(TrackerError::NotFinalized {
                task_id: *task_id,
                status: task.status,
            });
        }

        let failed = task.status.is_failure();
        let (app_payment, dataset_payment, workerpool_payment) = if failed {
            (0, 0, 0)
        } else {
            (deal.app_price, deal.dataset_price, deal.workerpool_price)
        };

        Ok(ExecutionReceipt {
            deal_id: *deal_id,
            task_id: *task_id,
            enclave: deal.tag.enclave_class(),
            app_payment,
            dataset_payment,
            workerpool_payment,
            workerpool_penalized: task.failure_code.is_some(),
            failed,
        })
    }
}

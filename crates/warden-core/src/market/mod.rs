//! Confidential-compute marketplace contract
//!
//! The marketplace (orderbook, on-chain matching, enclave workers) is an
//! external service. Warden only relies on the operations below and treats
//! the service as at-least-once and eventually consistent.

mod memory;

pub use memory::{InMemoryMarketplace, SimulatedEnclave};

use async_trait::async_trait;

use crate::attestation::AttestationEnvelope;
use crate::deal::{BrokeredDeal, DealView, TaskView};
use crate::error::MarketError;
use crate::order::{AppOrder, DatasetOrder, RequestOrder, WorkerpoolOrder};
use crate::tag::ConfidentialityTag;
use crate::types::{Address, Bytes32};

pub type MarketResult<T> = std::result::Result<T, MarketError>;

/// Operations consumed from the external marketplace
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Open app orders for `app` whose tag satisfies `tag`.
    async fn app_orders(&self, app: &Address, tag: ConfidentialityTag)
        -> MarketResult<Vec<AppOrder>>;

    /// Open dataset orders for `dataset` whose tag satisfies `tag`.
    async fn dataset_orders(
        &self,
        dataset: &Address,
        tag: ConfidentialityTag,
    ) -> MarketResult<Vec<DatasetOrder>>;

    /// Open workerpool orders in `category` whose tag satisfies `tag`,
    /// optionally restricted to one workerpool.
    async fn workerpool_orders(
        &self,
        category: u64,
        tag: ConfidentialityTag,
        workerpool: Option<&Address>,
    ) -> MarketResult<Vec<WorkerpoolOrder>>;

    /// Match orders into a deal. This is the only state-changing call.
    async fn match_orders(
        &self,
        request: &RequestOrder,
        app: &AppOrder,
        dataset: Option<&DatasetOrder>,
        workerpool: Option<&WorkerpoolOrder>,
    ) -> MarketResult<BrokeredDeal>;

    async fn deal(&self, deal_id: &Bytes32) -> MarketResult<DealView>;

    /// Current view of a task; polled by the tracker.
    async fn task(&self, task_id: &Bytes32) -> MarketResult<TaskView>;

    /// Signed result envelope published by the enclave, once available.
    async fn task_result(&self, task_id: &Bytes32) -> MarketResult<Option<AttestationEnvelope>>;
}

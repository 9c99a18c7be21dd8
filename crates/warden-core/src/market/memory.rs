//! In-process marketplace
//!
//! Holds an orderbook, forms deals and advances tasks through a scripted
//! lifecycle, one step per poll. Used by the demo gateway and by tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};

use super::{MarketResult, Marketplace};
use crate::attestation::{AttestationEnvelope, AttestationSigner};
use crate::crypto::keccak256;
use crate::deal::{compute_task_id, BrokeredDeal, DealView, TaskStatus, TaskView};
use crate::error::{AttestationError, MarketError};
use crate::order::{AppOrder, DatasetOrder, Order, RequestOrder, WorkerpoolOrder};
use crate::tag::ConfidentialityTag;
use crate::types::{now, Address, Bytes32};

/// Enclave stand-in that signs a result for every task that completes
#[derive(Debug, Clone)]
pub struct SimulatedEnclave {
    signer: AttestationSigner,
    measurement: String,
    result: Value,
}

impl SimulatedEnclave {
    pub fn new(signer: AttestationSigner, measurement: impl Into<String>, result: Value) -> Self {
        Self {
            signer,
            measurement: measurement.into(),
            result,
        }
    }

    pub fn signer_address(&self) -> &Address {
        self.signer.address()
    }

    /// Signed envelope for `task_id`, with the task id as receipt id.
    pub fn attest(
        &self,
        deal_id: &Bytes32,
        task_id: &Bytes32,
    ) -> Result<AttestationEnvelope, AttestationError> {
        let payload = json!({
            "receipt_id": task_id.to_hex(),
            "enclave_measurement": self.measurement,
            "deal_id": deal_id.to_hex(),
            "result": self.result,
        });
        self.signer.sign_now(payload)
    }
}

struct TaskRecord {
    view: TaskView,
    script: VecDeque<TaskStatus>,
}

#[derive(Default)]
struct MarketState {
    app_orders: Vec<AppOrder>,
    dataset_orders: Vec<DatasetOrder>,
    workerpool_orders: Vec<WorkerpoolOrder>,
    deals: HashMap<Bytes32, DealView>,
    tasks: HashMap<Bytes32, TaskRecord>,
    results: HashMap<Bytes32, AttestationEnvelope>,
    deal_nonce: u64,
}

/// Scriptable marketplace kept entirely in memory
pub struct InMemoryMarketplace {
    state: RwLock<MarketState>,
    progression: RwLock<Vec<TaskStatus>>,
    enclave: RwLock<Option<SimulatedEnclave>>,
    available: AtomicBool,
    failing_polls: AtomicUsize,
    match_calls: AtomicUsize,
}

impl Default for InMemoryMarketplace {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryMarketplace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryMarketplace")
            .field("match_calls", &self.match_calls())
            .finish_non_exhaustive()
    }
}

impl InMemoryMarketplace {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MarketState::default()),
            progression: RwLock::new(Self::default_progression()),
            enclave: RwLock::new(None),
            available: AtomicBool::new(true),
            failing_polls: AtomicUsize::new(0),
            match_calls: AtomicUsize::new(0),
        }
    }

    /// Statuses a new task walks through after `RECEIVED`.
    pub fn default_progression() -> Vec<TaskStatus> {
        vec![
            TaskStatus::Initializing,
            TaskStatus::Initialized,
            TaskStatus::Running,
            TaskStatus::ConsensusReached,
            TaskStatus::Revealed,
            TaskStatus::ResultUploading,
            TaskStatus::ResultUploaded,
            TaskStatus::Finalizing,
            TaskStatus::Completed,
        ]
    }

    pub fn with_enclave(self, enclave: SimulatedEnclave) -> Self {
        *self.enclave.write() = Some(enclave);
        self
    }

    pub fn publish_app_order(&self, order: AppOrder) {
        self.state.write().app_orders.push(order);
    }

    pub fn publish_dataset_order(&self, order: DatasetOrder) {
        self.state.write().dataset_orders.push(order);
    }

    pub fn publish_workerpool_order(&self, order: WorkerpoolOrder) {
        self.state.write().workerpool_orders.push(order);
    }

    /// Take the marketplace offline (every call fails with `Unavailable`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` task polls with `Unavailable`.
    pub fn fail_next_polls(&self, count: usize) {
        self.failing_polls.store(count, Ordering::SeqCst);
    }

    /// Replace the lifecycle used by tasks created from now on.
    pub fn set_progression(&self, statuses: Vec<TaskStatus>) {
        *self.progression.write() = statuses;
    }

    /// Replace the remaining lifecycle of an existing task.
    pub fn script_task(&self, task_id: &Bytes32, statuses: Vec<TaskStatus>) -> MarketResult<()> {
        let mut state = self.state.write();
        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MarketError::NotFound(format!("task {}", task_id)))?;
        record.script = statuses.into();
        Ok(())
    }

    /// Force a task into a failed terminal state with a failure code.
    pub fn fail_task(
        &self,
        task_id: &Bytes32,
        status: TaskStatus,
        code: impl Into<String>,
    ) -> MarketResult<()> {
        let mut state = self.state.write();
        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MarketError::NotFound(format!("task {}", task_id)))?;
        record.view.status = status;
        record.view.failure_code = Some(code.into());
        record.script.clear();
        Ok(())
    }

    /// Publish a result envelope for a task, replacing any existing one.
    pub fn set_task_result(&self, task_id: &Bytes32, envelope: AttestationEnvelope) {
        self.state.write().results.insert(*task_id, envelope);
    }

    /// Number of `match_orders` calls received, successful or not.
    pub fn match_calls(&self) -> usize {
        self.match_calls.load(Ordering::SeqCst)
    }

    pub fn deal_count(&self) -> usize {
        self.state.read().deals.len()
    }

    fn ensure_available(&self) -> MarketResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MarketError::Unavailable("marketplace offline".to_string()))
        }
    }

    fn next_deal_id(state: &mut MarketState, request: &RequestOrder) -> MarketResult<Bytes32> {
        state.deal_nonce += 1;
        let request_hash = request
            .order_hash()
            .map_err(|e| MarketError::Rejected(e.to_string()))?;
        let mut material = Vec::with_capacity(32 + 8);
        material.extend_from_slice(request_hash.as_bytes());
        material.extend_from_slice(&state.deal_nonce.to_be_bytes());
        Ok(keccak256(material))
    }
}

fn check_signed<O: Order>(order: &O, kind: &str) -> MarketResult<()> {
    order
        .signer()
        .map(|_| ())
        .map_err(|e| MarketError::Rejected(format!("{} order signature: {}", kind, e)))
}

fn check_tag(kind: &str, offered: ConfidentialityTag, required: ConfidentialityTag) -> MarketResult<()> {
    if offered.satisfies(required) {
        Ok(())
    } else {
        Err(MarketError::Rejected(format!(
            "{} order tag {} does not cover {}",
            kind, offered, required
        )))
    }
}

#[async_trait]
impl Marketplace for InMemoryMarketplace {
    async fn app_orders(
        &self,
        app: &Address,
        tag: ConfidentialityTag,
    ) -> MarketResult<Vec<AppOrder>> {
        self.ensure_available()?;
        let state = self.state.read();
        Ok(state
            .app_orders
            .iter()
            .filter(|o| &o.app == app && o.tag.satisfies(tag))
            .cloned()
            .collect())
    }

    async fn dataset_orders(
        &self,
        dataset: &Address,
        tag: ConfidentialityTag,
    ) -> MarketResult<Vec<DatasetOrder>> {
        self.ensure_available()?;
        let state = self.state.read();
        Ok(state
            .dataset_orders
            .iter()
            .filter(|o| &o.dataset == dataset && o.tag.satisfies(tag))
            .cloned()
            .collect())
    }

    async fn workerpool_orders(
        &self,
        category: u64,
        tag: ConfidentialityTag,
        workerpool: Option<&Address>,
    ) -> MarketResult<Vec<WorkerpoolOrder>> {
        self.ensure_available()?;
        let state = self.state.read();
        Ok(state
            .workerpool_orders
            .iter()
            .filter(|o| o.category == category && o.tag.satisfies(tag))
            .filter(|o| workerpool.map_or(true, |wp| &o.workerpool == wp))
            .cloned()
            .collect())
    }

    async fn match_orders(
        &self,
        request: &RequestOrder,
        app: &AppOrder,
        dataset: Option<&DatasetOrder>,
        workerpool: Option<&WorkerpoolOrder>,
    ) -> MarketResult<BrokeredDeal> {
        self.match_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        check_signed(request, "request")?;
        check_signed(app, "app")?;
        check_tag("app", app.tag, request.tag)?;
        if let Some(order) = dataset {
            check_signed(order, "dataset")?;
            check_tag("dataset", order.tag, request.tag)?;
        }
        if let Some(order) = workerpool {
            check_signed(order, "workerpool")?;
            check_tag("workerpool", order.tag, request.tag)?;
        }

        let mut volume = request.volume.min(app.volume);
        if let Some(order) = dataset {
            volume = volume.min(order.volume);
        }
        if let Some(order) = workerpool {
            volume = volume.min(order.volume);
        }
        if volume == 0 {
            return Err(MarketError::Rejected("no remaining volume".to_string()));
        }

        let mut state = self.state.write();
        let deal_id = Self::next_deal_id(&mut state, request)?;
        let tag = app.tag
            | dataset.map(|o| o.tag).unwrap_or_default()
            | workerpool.map(|o| o.tag).unwrap_or_default()
            | request.tag;

        let deal = DealView {
            deal_id,
            app: app.app.clone(),
            app_price: app.app_price,
            dataset: dataset.map(|o| o.dataset.clone()),
            dataset_price: dataset.map(|o| o.dataset_price).unwrap_or(0),
            workerpool: workerpool.map(|o| o.workerpool.clone()),
            workerpool_price: workerpool.map(|o| o.workerpool_price).unwrap_or(0),
            requester: request.requester.clone(),
            tag,
            volume,
            created_at: now(),
        };
        state.deals.insert(deal_id, deal);

        let progression = self.progression.read().clone();
        for index in 0..volume {
            let task_id = compute_task_id(&deal_id, index);
            state.tasks.insert(
                task_id,
                TaskRecord {
                    view: TaskView {
                        task_id,
                        deal_id,
                        index,
                        status: TaskStatus::Received,
                        failure_code: None,
                        results: None,
                    },
                    script: progression.clone().into(),
                },
            );
        }

        // Consume volume from the matched supply orders.
        state.app_orders.retain_mut(|o| {
            if o.salt == app.salt {
                o.volume = o.volume.saturating_sub(volume);
            }
            o.volume > 0
        });
        if let Some(matched) = dataset {
            state.dataset_orders.retain_mut(|o| {
                if o.salt == matched.salt {
                    o.volume = o.volume.saturating_sub(volume);
                }
                o.volume > 0
            });
        }
        if let Some(matched) = workerpool {
            state.workerpool_orders.retain_mut(|o| {
                if o.salt == matched.salt {
                    o.volume = o.volume.saturating_sub(volume);
                }
                o.volume > 0
            });
        }

        info!("Matched deal {} (volume {}, tag {})", deal_id, volume, tag);
        Ok(BrokeredDeal { deal_id, volume })
    }

    async fn deal(&self, deal_id: &Bytes32) -> MarketResult<DealView> {
        self.ensure_available()?;
        self.state
            .read()
            .deals
            .get(deal_id)
            .cloned()
            .ok_or_else(|| MarketError::NotFound(format!("deal {}", deal_id)))
    }

    async fn task(&self, task_id: &Bytes32) -> MarketResult<TaskView> {
        self.ensure_available()?;
        let pending_failures = self.failing_polls.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_polls.store(pending_failures - 1, Ordering::SeqCst);
            return Err(MarketError::Unavailable("poll failed".to_string()));
        }

        let mut state = self.state.write();
        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| MarketError::NotFound(format!("task {}", task_id)))?;

        let current = record.view.clone();
        if !current.status.is_terminal() {
            if let Some(next) = record.script.pop_front() {
                debug!("Task {} advancing {} -> {}", task_id, current.status, next);
                record.view.status = next;
            }
        }

        let finished = record.view.clone();
        if finished.status.is_success() && !state.results.contains_key(task_id) {
            if let Some(enclave) = self.enclave.read().as_ref() {
                let envelope = enclave
                    .attest(&finished.deal_id, task_id)
                    .map_err(|e| MarketError::Unavailable(format!("enclave signing: {}", e)))?;
                state.results.insert(*task_id, envelope);
                if let Some(record) = state.tasks.get_mut(task_id) {
                    record.view.results = Some(format!("memory://results/{}", task_id));
                }
            }
        }

        Ok(current)
    }

    async fn task_result(&self, task_id: &Bytes32) -> MarketResult<Option<AttestationEnvelope>> {
        self.ensure_available()?;
        Ok(self.state.read().results.get(task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EvmSigner;
    use crate::order::RequestOrderParams;

    fn app() -> Address {
        Address::from_bytes([0xa1; 20])
    }

    fn seeded() -> (InMemoryMarketplace, EvmSigner) {
        let owner = EvmSigner::random();
        let market = InMemoryMarketplace::new();
        market.publish_app_order(
            AppOrder::new(app(), 0, 10, ConfidentialityTag::tdx())
                .sign(&owner)
                .unwrap(),
        );
        market.publish_workerpool_order(
            WorkerpoolOrder::new(Address::from_bytes([0xb2; 20]), 1, 10, ConfidentialityTag::tdx(), 0)
                .sign(&owner)
                .unwrap(),
        );
        (market, owner)
    }

    fn request(requester: &EvmSigner) -> RequestOrder {
        RequestOrderParams::for_app(app())
            .with_tag(ConfidentialityTag::tdx())
            .with_prices(0, 0, 5)
            .into_order(requester.address())
            .unwrap()
            .sign(requester)
            .unwrap()
    }

    #[tokio::test]
    async fn test_orderbook_filters_by_tag() {
        let (market, _) = seeded();
        assert_eq!(market.app_orders(&app(), ConfidentialityTag::tdx()).await.unwrap().len(), 1);
        assert!(market
            .app_orders(&app(), ConfidentialityTag::scone())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_task_walks_progression_once_per_poll() {
        let (market, owner) = seeded();
        market.set_progression(vec![TaskStatus::Running, TaskStatus::Completed]);
        let app_order = market.app_orders(&app(), ConfidentialityTag::tdx()).await.unwrap();
        let deal = market
            .match_orders(&request(&owner), &app_order[0], None, None)
            .await
            .unwrap();
        let task_id = compute_task_id(&deal.deal_id, 0);

        assert_eq!(market.task(&task_id).await.unwrap().status, TaskStatus::Received);
        assert_eq!(market.task(&task_id).await.unwrap().status, TaskStatus::Running);
        assert_eq!(market.task(&task_id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(market.task(&task_id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(market.match_calls(), 1);
    }

    #[tokio::test]
    async fn test_offline_marketplace() {
        let (market, _) = seeded();
        market.set_available(false);
        let err = market
            .app_orders(&app(), ConfidentialityTag::tdx())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Unavailable(_)));
    }
}

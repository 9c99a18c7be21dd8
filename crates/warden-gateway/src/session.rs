//! Per-conversation session state
//!
//! Sessions are created lazily on the first message for an unseen id and are
//! only mutated by the orchestrator. The store is an explicit abstraction so
//! the same orchestration logic runs against the in-memory map here or a
//! durable keyed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::Result;

/// Routing mode of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionMode {
    /// No agent owns the conversation; the next message is classified.
    Neutral,
    /// Messages go straight to the active agent.
    AgentActive,
}

/// Typed conversation context
///
/// Recognised keys are typed fields; anything else lands in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,

    #[serde(default, alias = "requestedTier", skip_serializing_if = "Option::is_none")]
    pub requested_tier: Option<String>,

    #[serde(default, alias = "creditScore", skip_serializing_if = "Option::is_none")]
    pub credit_score: Option<u32>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SessionContext {
    pub fn with_wallet(mut self, wallet: impl Into<String>) -> Self {
        self.wallet = Some(wallet.into());
        self
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_credit_score(mut self, score: u32) -> Self {
        self.credit_score = Some(score);
        self
    }

    /// Merge `incoming` key by key: present values win, absent ones keep
    /// what is stored.
    pub fn merge(&mut self, incoming: SessionContext) {
        if incoming.wallet.is_some() {
            self.wallet = incoming.wallet;
        }
        if incoming.amount.is_some() {
            self.amount = incoming.amount;
        }
        if incoming.requested_tier.is_some() {
            self.requested_tier = incoming.requested_tier;
        }
        if incoming.credit_score.is_some() {
            self.credit_score = incoming.credit_score;
        }
        self.extra.extend(incoming.extra);
    }

    pub fn is_empty(&self) -> bool {
        self == &SessionContext::default()
    }
}

/// Session - one conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    /// Present iff `mode == AgentActive`.
    pub active_agent: Option<String>,
    pub task_started_at: Option<DateTime<Utc>>,
    /// `"<label> completed"` entries, oldest first.
    pub task_history: Vec<String>,
    pub hitl_pending: bool,
    /// Outstanding approval for the active task, if any.
    pub pending_decision: Option<Uuid>,
    pub context: SessionContext,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            mode: SessionMode::Neutral,
            active_agent: None,
            task_started_at: None,
            task_history: Vec::new(),
            hitl_pending: false,
            pending_decision: None,
            context: SessionContext::default(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Hand the conversation to `agent`.
    pub fn activate(&mut self, agent: impl Into<String>, hitl_pending: bool) {
        self.mode = SessionMode::AgentActive;
        self.active_agent = Some(agent.into());
        self.task_started_at = Some(Utc::now());
        self.hitl_pending = hitl_pending;
        self.touch();
    }

    /// Close the active task successfully and return to neutral.
    /// Returns the label of the agent that completed.
    pub fn complete(&mut self) -> Option<String> {
        let label = self.active_agent.take();
        if let Some(ref label) = label {
            self.task_history.push(format!("{} completed", label));
        }
        self.reset();
        label
    }

    /// Return to neutral without recording anything in the history.
    pub fn reset(&mut self) {
        self.mode = SessionMode::Neutral;
        self.active_agent = None;
        self.task_started_at = None;
        self.hitl_pending = false;
        self.pending_decision = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_idle_for(&self, max_idle: Duration) -> bool {
        let idle = (Utc::now() - self.last_activity).num_milliseconds().max(0) as u128;
        idle > max_idle.as_millis()
    }

    /// Mode and active agent agree.
    pub fn is_consistent(&self) -> bool {
        (self.mode == SessionMode::AgentActive) == self.active_agent.is_some()
    }
}

/// Keyed session storage
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Session>>;

    async fn upsert(&self, session: Session) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<bool>;

    /// Remove sessions idle for longer than `max_idle`. Returns how many.
    async fn purge_idle(&self, max_idle: Duration) -> Result<usize>;

    async fn len(&self) -> Result<usize>;
}

/// In-memory session store, sharded per key
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn upsert(&self, session: Session) -> Result<()> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.sessions.remove(id).is_some())
    }

    async fn purge_idle(&self, max_idle: Duration) -> Result<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            let keep = !session.is_idle_for(max_idle);
            if !keep {
                tracing::info!("Session expired and removed: {}", id);
            }
            keep
        });
        Ok(before.saturating_sub(self.sessions.len()))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.sessions.len())
    }
}

/// One async mutex per session id
///
/// Waiters are served in arrival order, so messages for a session are
/// processed in the order they came in. Different ids never share a lock.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// Drop lock entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

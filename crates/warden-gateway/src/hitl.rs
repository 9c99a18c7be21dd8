//! Human-in-the-Loop approval gate
//!
//! A gated action is announced to an external notification sink and then
//! blocked, inside the agent call, until a decision event for its id arrives
//! or the timeout elapses. Timeouts resolve deterministically to
//! `TimedOut`; they never hang and never proceed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::AgentError;
use crate::routing::{RiskLevel, RoutingDecision};
use crate::session::SessionContext;
use crate::{GatewayError, Result};

/// Final state of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

impl fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalOutcome::Approved => write!(f, "APPROVED"),
            ApprovalOutcome::Rejected => write!(f, "REJECTED"),
            ApprovalOutcome::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// Action waiting for a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub decision_id: Uuid,
    pub session_id: String,
    pub agent: String,
    /// Human-readable description of what will run once approved.
    pub action: String,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    pub created_at: DateTime<Utc>,
    /// Reference to the external conversation carrying the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ref: Option<String>,
}

/// Decision delivered by the external approval channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionEvent {
    pub decision_id: Uuid,
    pub approved: bool,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl DecisionEvent {
    pub fn approve(decision_id: Uuid, approver: impl Into<String>) -> Self {
        Self {
            decision_id,
            approved: true,
            approver: Some(approver.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn reject(decision_id: Uuid, approver: impl Into<String>) -> Self {
        Self {
            decision_id,
            approved: false,
            approver: Some(approver.into()),
            timestamp: Utc::now(),
        }
    }

    fn outcome(&self) -> ApprovalOutcome {
        if self.approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Rejected
        }
    }
}

/// Receives pending approvals; delivery is fire-and-forget
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, approval: &PendingApproval) -> anyhow::Result<()>;
}

/// Fans pending approvals out to in-process subscribers (WebSocket clients)
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<PendingApproval>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PendingApproval> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn publish(&self, approval: &PendingApproval) -> anyhow::Result<()> {
        match self.tx.send(approval.clone()) {
            Ok(receivers) => debug!("Approval {} sent to {} subscriber(s)", approval.decision_id, receivers),
            Err(_) => debug!("Approval {} published with no subscribers", approval.decision_id),
        }
        Ok(())
    }
}

/// Writes pending approvals to the log
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn publish(&self, approval: &PendingApproval) -> anyhow::Result<()> {
        info!(
            "Approval required [{}] session={} agent={} risk={:?}: {}",
            approval.decision_id, approval.session_id, approval.agent, approval.risk_level, approval.action
        );
        Ok(())
    }
}

struct PendingEntry {
    approval: PendingApproval,
    tx: oneshot::Sender<ApprovalOutcome>,
    rx: Option<oneshot::Receiver<ApprovalOutcome>>,
}

struct Resolution {
    outcome: ApprovalOutcome,
    awaited: bool,
    resolved_at: Instant,
}

impl Resolution {
    fn new(outcome: ApprovalOutcome, awaited: bool) -> Self {
        Self {
            outcome,
            awaited,
            resolved_at: Instant::now(),
        }
    }
}

/// Cancels the request if the waiting future is dropped before it resolves.
struct AbandonGuard<'a> {
    gate: &'a HitlGate,
    decision_id: Uuid,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.gate.cancel(self.decision_id) {
            warn!("Approval {} abandoned by its waiter", self.decision_id);
        }
    }
}

#[derive(Default)]
struct GateState {
    pending: HashMap<Uuid, PendingEntry>,
    by_session: HashMap<String, Uuid>,
    resolved: HashMap<Uuid, Resolution>,
}

/// Approval gate shared by the orchestrator and the decision channel
pub struct HitlGate {
    state: Mutex<GateState>,
    sink: Arc<dyn NotificationSink>,
    default_timeout: Duration,
    /// How long resolved outcomes stay queryable.
    retention: Duration,
}

impl fmt::Debug for HitlGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HitlGate")
            .field("pending", &self.state.lock().pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl HitlGate {
    pub fn new(sink: Arc<dyn NotificationSink>, default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            sink,
            default_timeout,
            retention: default_timeout.saturating_mul(2),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Forget outcomes resolved longer ago than the retention window.
    /// Returns how many were dropped.
    pub fn prune_resolved(&self) -> usize {
        let mut state = self.state.lock();
        Self::prune_locked(&mut state, self.retention)
    }

    fn prune_locked(state: &mut GateState, retention: Duration) -> usize {
        let before = state.resolved.len();
        state
            .resolved
            .retain(|_, resolution| resolution.resolved_at.elapsed() <= retention);
        before - state.resolved.len()
    }

    /// Record a pending approval and announce it. Does not block.
    pub fn request_approval(
        &self,
        session_id: &str,
        decision: &RoutingDecision,
        context: &SessionContext,
        action: impl Into<String>,
    ) -> Result<PendingApproval> {
        let approval = {
            let mut state = self.state.lock();
            Self::prune_locked(&mut state, self.retention);
            if let Some(existing) = state.by_session.get(session_id) {
                return Err(GatewayError::ApprovalAlreadyPending {
                    session_id: session_id.to_string(),
                    decision_id: existing.to_string(),
                });
            }

            let approval = PendingApproval {
                decision_id: Uuid::new_v4(),
                session_id: session_id.to_string(),
                agent: decision.agent.clone(),
                action: action.into(),
                risk_level: decision.risk_level,
                confidence: decision.confidence,
                wallet: context.wallet.clone(),
                amount: context.amount,
                created_at: Utc::now(),
                thread_ref: None,
            };
            let (tx, rx) = oneshot::channel();
            state
                .by_session
                .insert(session_id.to_string(), approval.decision_id);
            state.pending.insert(
                approval.decision_id,
                PendingEntry {
                    approval: approval.clone(),
                    tx,
                    rx: Some(rx),
                },
            );
            approval
        };

        info!(
            "Approval {} requested for session {} ({:?} risk)",
            approval.decision_id, session_id, approval.risk_level
        );

        let sink = self.sink.clone();
        let published = approval.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.publish(&published).await {
                warn!("Failed to publish approval {}: {}", published.decision_id, e);
            }
        });

        Ok(approval)
    }

    /// Wait for the decision on `decision_id`, at most `timeout`.
    ///
    /// Only one caller may wait per id. A decision that arrived before the
    /// wait started is returned immediately.
    pub async fn await_decision(&self, decision_id: Uuid, timeout: Duration) -> Result<ApprovalOutcome> {
        let rx = {
            let mut state = self.state.lock();
            if let Some(entry) = state.pending.get_mut(&decision_id) {
                entry
                    .rx
                    .take()
                    .ok_or_else(|| GatewayError::AlreadyAwaited(decision_id.to_string()))?
            } else if let Some(resolution) = state.resolved.get_mut(&decision_id) {
                if resolution.awaited {
                    return Err(GatewayError::AlreadyAwaited(decision_id.to_string()));
                }
                resolution.awaited = true;
                return Ok(resolution.outcome);
            } else {
                return Err(GatewayError::ApprovalNotFound(decision_id.to_string()));
            }
        };

        let mut guard = AbandonGuard {
            gate: self,
            decision_id,
            armed: true,
        };
        let waited = tokio::time::timeout(timeout, rx).await;
        guard.armed = false;

        match waited {
            Ok(Ok(outcome)) => Ok(outcome),
            // Sender dropped: the request was cancelled.
            Ok(Err(_)) => Ok(ApprovalOutcome::Rejected),
            Err(_) => {
                let mut state = self.state.lock();
                match state.pending.remove(&decision_id) {
                    Some(entry) => {
                        state.by_session.remove(&entry.approval.session_id);
                        state
                            .resolved
                            .insert(decision_id, Resolution::new(ApprovalOutcome::TimedOut, true));
                        warn!("Approval {} timed out after {:?}", decision_id, timeout);
                        Ok(ApprovalOutcome::TimedOut)
                    }
                    // A decision landed between the timer firing and the lock.
                    None => Ok(state
                        .resolved
                        .get(&decision_id)
                        .map(|r| r.outcome)
                        .unwrap_or(ApprovalOutcome::TimedOut)),
                }
            }
        }
    }

    /// Apply a decision. Returns `false` if the id is unknown or already
    /// resolved; the first decision always wins.
    pub fn submit_decision(&self, event: DecisionEvent) -> bool {
        let mut state = self.state.lock();
        let entry = match state.pending.remove(&event.decision_id) {
            Some(entry) => entry,
            None => {
                debug!("Ignoring decision for unknown or resolved id {}", event.decision_id);
                return false;
            }
        };

        state.by_session.remove(&entry.approval.session_id);
        let outcome = event.outcome();
        state
            .resolved
            .insert(event.decision_id, Resolution::new(outcome, entry.rx.is_none()));
        // The waiter may have gone away; the outcome is recorded either way.
        let _ = entry.tx.send(outcome);

        info!(
            "Decision {} resolved {} by {}",
            event.decision_id,
            outcome,
            event.approver.as_deref().unwrap_or("unknown")
        );
        true
    }

    /// Withdraw a pending request. A current waiter sees `Rejected`.
    pub fn cancel(&self, decision_id: Uuid) -> bool {
        let mut state = self.state.lock();
        match state.pending.remove(&decision_id) {
            Some(entry) => {
                state.by_session.remove(&entry.approval.session_id);
                state
                    .resolved
                    .insert(decision_id, Resolution::new(ApprovalOutcome::Rejected, true));
                info!("Approval {} cancelled", decision_id);
                true
            }
            None => false,
        }
    }

    /// All outstanding approvals, oldest first.
    pub fn pending(&self) -> Vec<PendingApproval> {
        let state = self.state.lock();
        let mut approvals: Vec<PendingApproval> =
            state.pending.values().map(|e| e.approval.clone()).collect();
        approvals.sort_by_key(|a| a.created_at);
        approvals
    }

    pub fn pending_for_session(&self, session_id: &str) -> Option<PendingApproval> {
        let state = self.state.lock();
        let id = state.by_session.get(session_id)?;
        state.pending.get(id).map(|e| e.approval.clone())
    }

    /// Outcome of a resolved request; `None` while pending or if unknown.
    pub fn outcome(&self, decision_id: Uuid) -> Option<ApprovalOutcome> {
        self.state
            .lock()
            .resolved
            .get(&decision_id)
            .map(|r| r.outcome)
    }

    /// Feed decisions from an external channel into the gate.
    pub fn spawn_listener(self: Arc<Self>, mut rx: mpsc::Receiver<DecisionEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.submit_decision(event);
            }
            debug!("Decision channel closed");
        })
    }
}

/// Permission for an agent to run its gated action once approved
#[derive(Debug, Clone)]
pub struct ApprovalTicket {
    gate: Arc<HitlGate>,
    decision_id: Uuid,
    timeout: Duration,
    approved: Arc<AtomicBool>,
}

impl ApprovalTicket {
    pub fn new(gate: Arc<HitlGate>, decision_id: Uuid, timeout: Duration) -> Self {
        Self {
            gate,
            decision_id,
            timeout,
            approved: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn decision_id(&self) -> Uuid {
        self.decision_id
    }

    /// Approval was granted, whether or not the agent waited for it.
    /// Survives the gate forgetting the outcome.
    pub fn is_approved(&self) -> bool {
        self.approved.load(Ordering::Acquire)
            || self.gate.outcome(self.decision_id) == Some(ApprovalOutcome::Approved)
    }

    /// Block until approved. Rejection and timeout are hard failures.
    pub async fn authorize(&self) -> std::result::Result<(), AgentError> {
        if self.approved.load(Ordering::Acquire) {
            return Ok(());
        }
        let outcome = match self.gate.outcome(self.decision_id) {
            Some(outcome) => Ok(outcome),
            None => self.gate.await_decision(self.decision_id, self.timeout).await,
        };
        match outcome {
            Ok(ApprovalOutcome::Approved) => {
                self.approved.store(true, Ordering::Release);
                Ok(())
            }
            Ok(outcome) => Err(AgentError::Unauthorized(outcome)),
            Err(e) => Err(AgentError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RiskLevel;

    fn decision() -> RoutingDecision {
        RoutingDecision {
            agent: "credit".to_string(),
            confidence: 0.9,
            reasoning: "wallet scoring".to_string(),
            requires_approval: true,
            risk_level: RiskLevel::High,
            risk_factors: vec!["amount".to_string()],
        }
    }

    fn gate() -> Arc<HitlGate> {
        Arc::new(HitlGate::new(Arc::new(TracingSink), Duration::from_secs(300)))
    }

    fn request(gate: &HitlGate, session: &str) -> PendingApproval {
        gate.request_approval(
            session,
            &decision(),
            &SessionContext::default().with_amount(60_000.0),
            "score wallet",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_approval_unblocks_waiter() {
        let gate = gate();
        let approval = request(&gate, "s-1");
        assert_eq!(approval.amount, Some(60_000.0));
        assert_eq!(gate.pending().len(), 1);
        let id = approval.decision_id;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.await_decision(id, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        assert!(gate.submit_decision(DecisionEvent::approve(id, "ops")));
        assert_eq!(waiter.await.unwrap().unwrap(), ApprovalOutcome::Approved);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_resolves_and_clears() {
        let gate = gate();
        let approval = request(&gate, "s-1");

        let outcome = gate
            .await_decision(approval.decision_id, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::TimedOut);
        assert!(gate.pending().is_empty());
        assert!(gate.pending_for_session("s-1").is_none());

        // A late approval does not override the timeout.
        assert!(!gate.submit_decision(DecisionEvent::approve(approval.decision_id, "late")));
        assert_eq!(gate.outcome(approval.decision_id), Some(ApprovalOutcome::TimedOut));
    }

    #[tokio::test]
    async fn test_decision_before_wait() {
        let gate = gate();
        let approval = request(&gate, "s-1");
        assert!(gate.submit_decision(DecisionEvent::reject(approval.decision_id, "ops")));

        let outcome = gate
            .await_decision(approval.decision_id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_duplicate_decisions_ignored() {
        let gate = gate();
        let approval = request(&gate, "s-1");

        assert!(gate.submit_decision(DecisionEvent::reject(approval.decision_id, "a")));
        assert!(!gate.submit_decision(DecisionEvent::approve(approval.decision_id, "b")));
        assert_eq!(gate.outcome(approval.decision_id), Some(ApprovalOutcome::Rejected));
    }

    #[tokio::test]
    async fn test_one_pending_per_session() {
        let gate = gate();
        request(&gate, "s-1");
        let err = gate
            .request_approval("s-1", &decision(), &SessionContext::default(), "again")
            .unwrap_err();
        assert!(matches!(err, GatewayError::ApprovalAlreadyPending { .. }));

        // Other sessions are unaffected.
        request(&gate, "s-2");
        assert_eq!(gate.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_single_waiter_per_id() {
        let gate = gate();
        let id = request(&gate, "s-1").decision_id;

        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.await_decision(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = gate.await_decision(id, Duration::from_millis(10)).await;
        assert!(matches!(second, Err(GatewayError::AlreadyAwaited(_))));

        gate.submit_decision(DecisionEvent::approve(id, "ops"));
        assert_eq!(first.await.unwrap().unwrap(), ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn test_cancel_releases_waiter() {
        let gate = gate();
        let approval = request(&gate, "s-1");
        assert!(gate.cancel(approval.decision_id));
        assert!(gate.pending_for_session("s-1").is_none());
        assert!(!gate.submit_decision(DecisionEvent::approve(approval.decision_id, "ops")));
    }

    #[tokio::test]
    async fn test_listener_and_broadcast() {
        let sink = Arc::new(BroadcastSink::new(8));
        let mut subscriber = sink.subscribe();
        let gate = Arc::new(HitlGate::new(sink, Duration::from_secs(5)));
        let (tx, rx) = mpsc::channel(4);
        let _listener = gate.clone().spawn_listener(rx);

        let approval = request(&gate, "s-1");
        let announced = subscriber.recv().await.unwrap();
        assert_eq!(announced.decision_id, approval.decision_id);

        tx.send(DecisionEvent::approve(approval.decision_id, "ops"))
            .await
            .unwrap();
        let outcome = gate
            .await_decision(approval.decision_id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, ApprovalOutcome::Approved);
    }

    #[tokio::test]
    async fn test_dropped_waiter_releases_session() {
        let gate = gate();
        let id = request(&gate, "s-1").decision_id;

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.await_decision(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        assert!(gate.pending().is_empty());
        assert_eq!(gate.outcome(id), Some(ApprovalOutcome::Rejected));
        assert!(!gate.submit_decision(DecisionEvent::approve(id, "ops")));
        request(&gate, "s-1");
    }

    #[tokio::test]
    async fn test_resolved_outcomes_expire() {
        let gate = HitlGate::new(Arc::new(TracingSink), Duration::from_secs(5))
            .with_retention(Duration::from_millis(20));
        let first = request(&gate, "s-1").decision_id;
        assert!(gate.submit_decision(DecisionEvent::approve(first, "ops")));
        assert_eq!(gate.prune_resolved(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = request(&gate, "s-1").decision_id;
        gate.cancel(second);

        // Opening the second request already swept the first outcome.
        assert_eq!(gate.outcome(first), None);
        assert_eq!(gate.outcome(second), Some(ApprovalOutcome::Rejected));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(gate.prune_resolved(), 1);
        assert_eq!(gate.outcome(second), None);
    }

    #[tokio::test]
    async fn test_ticket_for_resolved_rejection_fails_fast() {
        let gate = gate();
        let id = request(&gate, "s-1").decision_id;
        gate.cancel(id);

        let ticket = ApprovalTicket::new(gate.clone(), id, Duration::from_secs(5));
        let err = ticket.authorize().await.unwrap_err();
        assert!(matches!(err, AgentError::Unauthorized(ApprovalOutcome::Rejected)));
    }

    #[tokio::test]
    async fn test_ticket_authorize() {
        let gate = gate();
        let approval = request(&gate, "s-1");
        let ticket = ApprovalTicket::new(gate.clone(), approval.decision_id, Duration::from_millis(20));

        let err = ticket.authorize().await.unwrap_err();
        assert!(matches!(err, AgentError::Unauthorized(ApprovalOutcome::TimedOut)));
    }
}

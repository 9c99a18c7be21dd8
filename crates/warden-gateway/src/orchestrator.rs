//! Message orchestration
//!
//! Every inbound message runs through [`Orchestrator::process_message`]
//! while holding its session's lock. In NEUTRAL mode the message is
//! classified and, when confident enough, hands the session to an agent
//! (behind an approval when the risk policy asks for one). In AGENT_ACTIVE
//! mode it goes straight to the active agent. A response carrying
//! [`COMPLETION_MARKER`] ends the task and returns the session to NEUTRAL.
//!
//! Failure policy:
//! - classifier or transient agent failures leave the stored session exactly
//!   as it was and cancel any approval opened by the failed call;
//! - a rejected or timed-out approval, a task-wait timeout, or a fatal agent
//!   failure resets the session to NEUTRAL (history untouched), persists it,
//!   and then returns the error.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{Agent, AgentContext, AgentError, AgentRegistry};
use crate::config::RoutingSettings;
use crate::hitl::{ApprovalTicket, HitlGate};
use crate::routing::{Classifier, RiskPolicy, RoutingDecision};
use crate::session::{Session, SessionContext, SessionLocks, SessionMode, SessionStore};
use crate::{GatewayError, Result};

/// Reserved token an agent puts in its response to end its task.
///
/// There is no escaping: every occurrence counts and all are removed.
pub const COMPLETION_MARKER: &str = "[TASK_COMPLETE]";

/// Remove every completion marker. Returns the cleaned text and whether a
/// marker was present. Stripping an already-stripped text is a no-op.
pub fn strip_marker(text: &str) -> (String, bool) {
    if !text.contains(COMPLETION_MARKER) {
        return (text.to_string(), false);
    }
    let mut cleaned = text.to_string();
    // Removal can splice a new marker together, e.g. "[TASK_[TASK_COMPLETE]COMPLETE]".
    while cleaned.contains(COMPLETION_MARKER) {
        cleaned = cleaned.replace(COMPLETION_MARKER, "");
    }
    (cleaned.trim_end().to_string(), true)
}

/// Result of one processed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub response: String,
    /// Session state after the message.
    pub session: Session,
    /// Present when the message was routed in NEUTRAL mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<RoutingDecision>,
}

pub struct Orchestrator {
    classifier: Arc<dyn Classifier>,
    registry: Arc<AgentRegistry>,
    sessions: Arc<dyn SessionStore>,
    locks: SessionLocks,
    gate: Arc<HitlGate>,
    policy: RiskPolicy,
    settings: RoutingSettings,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.registry.len())
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        registry: Arc<AgentRegistry>,
        sessions: Arc<dyn SessionStore>,
        gate: Arc<HitlGate>,
    ) -> Self {
        Self {
            classifier,
            registry,
            sessions,
            locks: SessionLocks::new(),
            gate,
            policy: RiskPolicy::default(),
            settings: RoutingSettings::default(),
        }
    }

    pub fn with_policy(mut self, policy: RiskPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_routing(mut self, settings: RoutingSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn gate(&self) -> &Arc<HitlGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn session(&self, id: &str) -> Result<Session> {
        self.sessions
            .get(id)
            .await?
            .ok_or_else(|| GatewayError::SessionNotFound(id.to_string()))
    }

    pub async fn session_count(&self) -> Result<usize> {
        self.sessions.len().await
    }

    /// Drop sessions idle longer than `max_idle` and their unused locks.
    pub async fn purge_idle(&self, max_idle: Duration) -> Result<usize> {
        let removed = self.sessions.purge_idle(max_idle).await?;
        self.locks.prune();
        Ok(removed)
    }

    /// Route one message for `session_id`.
    pub async fn process_message(
        &self,
        session_id: &str,
        message: &str,
        context: SessionContext,
    ) -> Result<ProcessOutcome> {
        if session_id.trim().is_empty() {
            return Err(GatewayError::InvalidInput(
                "session id must not be empty".to_string(),
            ));
        }

        let _guard = self.locks.acquire(session_id).await;

        let original = self.sessions.get(session_id).await?;
        let mut session = original
            .clone()
            .unwrap_or_else(|| Session::new(session_id));
        if !session.is_consistent() {
            return Err(GatewayError::Internal(format!(
                "session {} has mode {:?} with active agent {:?}",
                session_id, session.mode, session.active_agent
            )));
        }
        session.context.merge(context);
        session.touch();

        match session.mode {
            SessionMode::Neutral => self.route(session, original, message).await,
            SessionMode::AgentActive => {
                let label = session.active_agent.clone().unwrap_or_default();
                let agent = self.registry.get(&label)?;
                debug!("Session {} forwarding to active agent {}", session_id, label);
                self.forward(agent, session, message, None, None).await
            }
        }
    }

    async fn route(
        &self,
        mut session: Session,
        original: Option<Session>,
        message: &str,
    ) -> Result<ProcessOutcome> {
        if message.trim().is_empty() {
            return Err(GatewayError::InvalidInput(
                "message must not be empty when no agent is active".to_string(),
            ));
        }

        let classification = self
            .classifier
            .classify(message)
            .await
            .map_err(|e| GatewayError::Transient(format!("classifier failed: {:#}", e)))?;
        let decision = self.policy.assess(classification, &session.context);
        info!(
            "Session {} routed to {} (confidence {:.2}, risk {:?})",
            session.id, decision.agent, decision.confidence, decision.risk_level
        );

        if decision.confidence < self.settings.confidence_threshold {
            let response = format!(
                "I'm not sure which assistant fits that request. My best guess is '{}' ({:.0}% confident). Could you tell me more about what you need?",
                decision.agent,
                decision.confidence * 100.0
            );
            return Ok(ProcessOutcome {
                response,
                session: original.unwrap_or_else(|| Session::new(session.id.clone())),
                routing: Some(decision),
            });
        }

        let agent = self.registry.get(&decision.agent)?;
        session.activate(decision.agent.clone(), decision.requires_approval);

        let mut opened = None;
        if decision.requires_approval {
            // A neutral session owns no approval; anything left is from a dropped call.
            if let Some(stale) = self.gate.pending_for_session(&session.id) {
                warn!("Session {}: cancelling stale approval {}", session.id, stale.decision_id);
                self.gate.cancel(stale.decision_id);
            }
            let action = format!("Run '{}' for: {}", decision.agent, message.trim());
            let approval = self
                .gate
                .request_approval(&session.id, &decision, &session.context, action)?;
            session.pending_decision = Some(approval.decision_id);
            opened = Some(approval.decision_id);
        }

        self.forward(agent, session, message, opened, Some(decision))
            .await
    }

    async fn forward(
        &self,
        agent: Arc<dyn Agent>,
        mut session: Session,
        message: &str,
        opened: Option<Uuid>,
        routing: Option<RoutingDecision>,
    ) -> Result<ProcessOutcome> {
        let mut ctx = AgentContext::new(session.id.clone(), session.context.clone());
        if let Some(decision_id) = session.pending_decision {
            ctx = ctx.with_ticket(ApprovalTicket::new(
                self.gate.clone(),
                decision_id,
                self.gate.default_timeout(),
            ));
        }

        let reply = match agent.process(message, &ctx).await {
            Ok(reply) => reply,
            Err(AgentError::Transient(reason)) => {
                if let Some(decision_id) = opened {
                    self.gate.cancel(decision_id);
                }
                warn!("Session {}: agent {} failed transiently: {}", session.id, agent.label(), reason);
                return Err(GatewayError::Transient(reason));
            }
            Err(e) => return Err(self.abort(session, agent.label(), e).await),
        };

        if ctx.is_approved() {
            session.hitl_pending = false;
            session.pending_decision = None;
        }

        let (cleaned, completed) = strip_marker(&reply);
        let response = if completed {
            if let Some(decision_id) = session.pending_decision {
                self.gate.cancel(decision_id);
            }
            if let Some(label) = session.complete() {
                info!("Session {}: {} completed its task", session.id, label);
            }
            format!("{}{}", cleaned, self.settings.completion_suffix)
        } else {
            reply
        };

        self.sessions.upsert(session.clone()).await?;
        Ok(ProcessOutcome {
            response,
            session,
            routing,
        })
    }

    /// Reset to NEUTRAL, persist, and translate the agent failure.
    async fn abort(&self, mut session: Session, label: &str, error: AgentError) -> GatewayError {
        warn!("Session {}: agent {} aborted: {}", session.id, label, error);
        if let Some(decision_id) = session.pending_decision {
            self.gate.cancel(decision_id);
        }
        session.reset();
        if let Err(e) = self.sessions.upsert(session).await {
            return e;
        }

        match error {
            AgentError::Unauthorized(outcome) => GatewayError::Authorization(outcome),
            AgentError::TimedOut(reason) => GatewayError::Aborted(reason),
            AgentError::Configuration(reason) => GatewayError::Configuration(reason),
            AgentError::Failed(reason) | AgentError::Transient(reason) => {
                GatewayError::Internal(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_strip_marker() {
        let (text, found) = strip_marker("Done.\n[TASK_COMPLETE]");
        assert!(found);
        assert_eq!(text, "Done.");

        let (text, found) = strip_marker("a [TASK_COMPLETE] b [TASK_COMPLETE]");
        assert!(found);
        assert_eq!(text, "a  b");

        let (text, found) = strip_marker("still working");
        assert!(!found);
        assert_eq!(text, "still working");
    }

    #[test]
    fn test_strip_marker_spliced() {
        let (text, found) = strip_marker("x [TASK_[TASK_COMPLETE]COMPLETE] y");
        assert!(found);
        assert_eq!(text, "x  y");
    }

    proptest! {
        #[test]
        fn prop_strip_marker_is_idempotent(
            parts in proptest::collection::vec("[a-zA-Z \\[\\]_]{0,12}", 0..6),
            markers in proptest::collection::vec(any::<bool>(), 0..6),
        ) {
            let mut text = String::new();
            for (part, marker) in parts.iter().zip(markers.iter().chain(std::iter::repeat(&false))) {
                text.push_str(part);
                if *marker {
                    text.push_str(COMPLETION_MARKER);
                }
            }

            let (once, _) = strip_marker(&text);
            let (twice, found_again) = strip_marker(&once);
            prop_assert!(!once.contains(COMPLETION_MARKER));
            prop_assert!(!found_again);
            prop_assert_eq!(once, twice);
        }
    }
}

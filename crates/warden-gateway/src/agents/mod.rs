//! Agents and the agent registry
//!
//! An agent turns a goal into response text. A response containing
//! [`crate::orchestrator::COMPLETION_MARKER`] closes the agent's task.

mod confidential_job;

pub use confidential_job::ConfidentialJobAgent;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::hitl::{ApprovalOutcome, ApprovalTicket};
use crate::session::SessionContext;
use crate::{GatewayError, Result};

/// Why an agent could not produce a response
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// The gated action was rejected or its approval timed out.
    #[error("not authorized: {0}")]
    Unauthorized(ApprovalOutcome),

    /// A dependency failed in a way a retry may fix.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The action was abandoned after waiting too long.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// The action cannot run as configured.
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("{0}")]
    Failed(String),
}

/// What an agent sees of the conversation
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub session_id: String,
    pub context: SessionContext,
    /// Present while the task's activation awaits or holds human approval.
    pub ticket: Option<ApprovalTicket>,
}

impl AgentContext {
    pub fn new(session_id: impl Into<String>, context: SessionContext) -> Self {
        Self {
            session_id: session_id.into(),
            context,
            ticket: None,
        }
    }

    pub fn with_ticket(mut self, ticket: ApprovalTicket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    /// Whether a gated activation has been approved.
    pub fn is_approved(&self) -> bool {
        self.ticket.as_ref().map_or(false, ApprovalTicket::is_approved)
    }

    /// Wait for approval when the action is gated; no-op otherwise.
    pub async fn authorize(&self) -> std::result::Result<(), AgentError> {
        match &self.ticket {
            Some(ticket) => ticket.authorize().await,
            None => Ok(()),
        }
    }
}

/// Specialised agent reachable through the orchestrator
#[async_trait]
pub trait Agent: Send + Sync + fmt::Debug {
    /// Routing label; unique within a registry.
    fn label(&self) -> &str;

    /// One line shown to classifiers and status endpoints.
    fn description(&self) -> &str;

    async fn process(&self, goal: &str, ctx: &AgentContext) -> std::result::Result<String, AgentError>;
}

/// Agents by label; built once at startup and then shared read-only
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<()> {
        let label = agent.label().to_string();
        if label.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "agent label must not be empty".to_string(),
            ));
        }
        if self.agents.contains_key(&label) {
            return Err(GatewayError::Configuration(format!(
                "agent '{}' is already registered",
                label
            )));
        }
        tracing::info!("Registered agent: {}", label);
        self.agents.insert(label, agent);
        Ok(())
    }

    pub fn get(&self, label: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(label)
            .cloned()
            .ok_or_else(|| GatewayError::AgentNotFound(label.to_string()))
    }

    /// All agents, sorted by label.
    pub fn list(&self) -> Vec<Arc<dyn Agent>> {
        let mut agents: Vec<_> = self.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.label().cmp(b.label()));
        agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Agent that replays scripted replies, falling back to echoing the goal
#[derive(Debug)]
pub struct EchoAgent {
    label: String,
    description: String,
    script: Mutex<VecDeque<std::result::Result<String, AgentError>>>,
    executions: AtomicUsize,
}

impl EchoAgent {
    pub fn new(label: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: description.into(),
            script: Mutex::new(VecDeque::new()),
            executions: AtomicUsize::new(0),
        }
    }

    /// Queue the next reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.script.lock().push_back(Ok(text.into()));
        self
    }

    /// Queue a failure as the next reply.
    pub fn fail(self, error: AgentError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    pub fn push_reply(&self, text: impl Into<String>) {
        self.script.lock().push_back(Ok(text.into()));
    }

    /// Replies produced after authorization.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn label(&self) -> &str {
        &self.label
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn process(&self, goal: &str, ctx: &AgentContext) -> std::result::Result<String, AgentError> {
        ctx.authorize().await?;

        let next = self.script.lock().pop_front();
        let reply = match next {
            Some(scripted) => scripted?,
            None => format!("{}: {}", self.label, goal),
        };
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hitl::{DecisionEvent, HitlGate, TracingSink};
    use crate::routing::{RiskLevel, RoutingDecision};
    use std::time::Duration;

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = AgentRegistry::new();
        registry
            .register(Arc::new(EchoAgent::new("credit", "scores wallets")))
            .unwrap();
        let err = registry
            .register(Arc::new(EchoAgent::new("credit", "again")))
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = AgentRegistry::new();
        registry.register(Arc::new(EchoAgent::new("echo", ""))).unwrap();
        registry.register(Arc::new(EchoAgent::new("credit", ""))).unwrap();

        assert_eq!(registry.get("echo").unwrap().label(), "echo");
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, GatewayError::AgentNotFound(_)));
        assert_eq!(err.kind(), "configuration");

        let labels: Vec<_> = registry.list().iter().map(|a| a.label().to_string()).collect();
        assert_eq!(labels, vec!["credit", "echo"]);
    }

    #[tokio::test]
    async fn test_echo_agent_script() {
        let agent = EchoAgent::new("echo", "")
            .reply("first")
            .fail(AgentError::Transient("down".to_string()));
        let ctx = AgentContext::new("s-1", SessionContext::default());

        assert_eq!(agent.process("hi", &ctx).await.unwrap(), "first");
        assert!(matches!(
            agent.process("hi", &ctx).await,
            Err(AgentError::Transient(_))
        ));
        assert_eq!(agent.process("hi", &ctx).await.unwrap(), "echo: hi");
        assert_eq!(agent.executions(), 2);
    }

    #[tokio::test]
    async fn test_echo_agent_waits_for_approval() {
        let gate = Arc::new(HitlGate::new(Arc::new(TracingSink), Duration::from_secs(5)));
        let decision = RoutingDecision {
            agent: "echo".to_string(),
            confidence: 0.9,
            reasoning: String::new(),
            requires_approval: true,
            risk_level: RiskLevel::Medium,
            risk_factors: vec![],
        };
        let approval = gate
            .request_approval("s-1", &decision, &SessionContext::default(), "echo")
            .unwrap();
        let ticket = ApprovalTicket::new(gate.clone(), approval.decision_id, Duration::from_millis(50));
        let ctx = AgentContext::new("s-1", SessionContext::default()).with_ticket(ticket);
        let agent = EchoAgent::new("echo", "");

        let err = agent.process("go", &ctx).await.unwrap_err();
        assert_eq!(err, AgentError::Unauthorized(ApprovalOutcome::TimedOut));
        assert_eq!(agent.executions(), 0);

        let approval = gate
            .request_approval("s-1", &decision, &SessionContext::default(), "echo")
            .unwrap();
        gate.submit_decision(DecisionEvent::approve(approval.decision_id, "ops"));
        let ticket = ApprovalTicket::new(gate.clone(), approval.decision_id, Duration::from_millis(50));
        let ctx = AgentContext::new("s-1", SessionContext::default()).with_ticket(ticket);
        assert_eq!(agent.process("go", &ctx).await.unwrap(), "echo: go");
        assert_eq!(agent.executions(), 1);
    }
}

//! Warden Gateway - conversational routing with human approval
//!
//! Routes free-text goals to specialised agents, gates risky activations
//! behind a human decision, and serves it all over HTTP and WebSocket.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Warden Gateway                      │
//! ├──────────────────────────────────────────────────────────┤
//! │   POST /sessions/:id/messages        GET /ws (approvals) │
//! │                │                             ▲           │
//! │     ┌──────────▼──────────┐        ┌─────────┴────────┐  │
//! │     │    Orchestrator     │───────▶│     HITL Gate    │  │
//! │     │ (per-session lock)  │        └──────────────────┘  │
//! │     └──┬───────────────┬──┘                              │
//! │        │ NEUTRAL       │ AGENT_ACTIVE                    │
//! │  ┌─────▼─────┐   ┌─────▼──────────────────────────────┐  │
//! │  │Classifier │   │ Agents (credit: confidential job,  │  │
//! │  │+ RiskPolicy│  │ broker, tracker, attestation)      │  │
//! │  └───────────┘   └────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Two-mode sessions**: classify once, then talk to the active agent
//! - **Risk policy**: amount, credit score and per-agent gating
//! - **Approval gate**: bounded waits that resolve to `TimedOut`, never hang
//! - **Completion marker**: `[TASK_COMPLETE]` hands the session back

pub mod agents;
pub mod config;
pub mod error;
pub mod gateway;
pub mod hitl;
pub mod orchestrator;
pub mod routing;
pub mod session;

pub use agents::{Agent, AgentContext, AgentError, AgentRegistry, ConfidentialJobAgent, EchoAgent};
pub use config::WardenConfig;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use hitl::{
    ApprovalOutcome, ApprovalTicket, BroadcastSink, DecisionEvent, HitlGate, NotificationSink,
    PendingApproval, TracingSink,
};
pub use orchestrator::{strip_marker, Orchestrator, ProcessOutcome, COMPLETION_MARKER};
pub use routing::{
    Classification, Classifier, KeywordClassifier, LlmClassifier, RiskLevel, RiskPolicy,
    RoutingDecision,
};
pub use session::{InMemorySessionStore, Session, SessionContext, SessionMode, SessionStore};

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 18789;

/// Default host
pub const DEFAULT_HOST: &str = "127.0.0.1";

//! Goal routing
//!
//! A classifier names the agent best suited to a free-text goal; the risk
//! policy then decides whether the activation needs a human decision.

mod keyword;
mod llm;

pub use keyword::{KeywordClassifier, KeywordRule};
pub use llm::LlmClassifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RiskSettings;
use crate::session::SessionContext;

/// Raw classifier answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub agent: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl Classification {
    pub fn new(agent: impl Into<String>, confidence: f64, reasoning: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
        }
    }
}

/// Maps a free-text goal to an agent label
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, goal: &str) -> anyhow::Result<Classification>;
}

/// Risk attached to a routing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Decision for one inbound message in neutral mode; never persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub agent: String,
    pub confidence: f64,
    pub reasoning: String,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    /// Which thresholds were crossed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risk_factors: Vec<String>,
}

/// Threshold rules that force human approval
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    settings: RiskSettings,
}

impl RiskPolicy {
    pub fn new(settings: RiskSettings) -> Self {
        Self { settings }
    }

    /// Turn a classification into a decision for `context`.
    ///
    /// Each crossed threshold is one risk factor: none is LOW, one is
    /// MEDIUM, more is HIGH. Any factor requires approval.
    pub fn assess(&self, classification: Classification, context: &SessionContext) -> RoutingDecision {
        let mut factors = Vec::new();

        if let Some(amount) = context.amount {
            if amount > self.settings.max_unattended_amount {
                factors.push(format!(
                    "amount {} exceeds {}",
                    amount, self.settings.max_unattended_amount
                ));
            }
        }
        if let Some(score) = context.credit_score {
            if score < self.settings.min_credit_score {
                factors.push(format!(
                    "credit score {} below {}",
                    score, self.settings.min_credit_score
                ));
            }
        }
        if self
            .settings
            .gated_agents
            .iter()
            .any(|agent| agent == &classification.agent)
        {
            factors.push(format!("agent '{}' always requires approval", classification.agent));
        }

        let risk_level = match factors.len() {
            0 => RiskLevel::Low,
            1 => RiskLevel::Medium,
            _ => RiskLevel::High,
        };

        RoutingDecision {
            agent: classification.agent,
            confidence: classification.confidence,
            reasoning: classification.reasoning,
            requires_approval: !factors.is_empty(),
            risk_level,
            risk_factors: factors,
        }
    }
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self::new(RiskSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credit(confidence: f64) -> Classification {
        Classification::new("credit", confidence, "wallet scoring")
    }

    #[test]
    fn test_low_risk_needs_no_approval() {
        let decision = RiskPolicy::default().assess(
            credit(0.95),
            &SessionContext::default().with_amount(1_000.0),
        );
        assert!(!decision.requires_approval);
        assert_eq!(decision.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let policy = RiskPolicy::default();
        let at_limit = SessionContext::default()
            .with_amount(50_000.0)
            .with_credit_score(650);
        assert!(!policy.assess(credit(0.9), &at_limit).requires_approval);

        let over = SessionContext::default().with_amount(50_000.01);
        let decision = policy.assess(credit(0.9), &over);
        assert!(decision.requires_approval);
        assert_eq!(decision.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_multiple_factors_are_high_risk() {
        let context = SessionContext::default()
            .with_amount(75_000.0)
            .with_credit_score(600);
        let decision = RiskPolicy::default().assess(credit(0.9), &context);
        assert_eq!(decision.risk_level, RiskLevel::High);
        assert_eq!(decision.risk_factors.len(), 2);
    }

    #[test]
    fn test_gated_agents() {
        let policy = RiskPolicy::new(RiskSettings {
            gated_agents: vec!["credit".to_string()],
            ..RiskSettings::default()
        });
        assert!(policy.assess(credit(0.9), &SessionContext::default()).requires_approval);
        let other = Classification::new("echo", 0.9, "");
        assert!(!policy.assess(other, &SessionContext::default()).requires_approval);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Classification::new("x", 1.7, "").confidence, 1.0);
        assert_eq!(Classification::new("x", -0.2, "").confidence, 0.0);
    }
}

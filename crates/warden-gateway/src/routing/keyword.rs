//! Deterministic keyword classifier

use async_trait::async_trait;

use super::{Classification, Classifier};

/// Keywords that point to one agent
#[derive(Debug, Clone)]
pub struct KeywordRule {
    pub agent: String,
    pub keywords: Vec<String>,
}

impl KeywordRule {
    pub fn new(agent: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            agent: agent.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    fn hits(&self, goal: &str) -> Vec<&str> {
        self.keywords
            .iter()
            .filter(|kw| goal.contains(kw.as_str()))
            .map(String::as_str)
            .collect()
    }
}

/// Scores each rule by how many of its keywords appear in the goal
///
/// Two or more hits give high confidence, one hit moderate confidence. With
/// no hits the fallback agent is named as a low-confidence guess.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<KeywordRule>,
    fallback: String,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<KeywordRule>, fallback: impl Into<String>) -> Self {
        Self {
            rules,
            fallback: fallback.into(),
        }
    }

    /// Rules for the built-in agents.
    pub fn default_rules() -> Self {
        Self::new(
            vec![
                KeywordRule::new(
                    "credit",
                    &["score", "credit", "wallet", "loan", "borrow", "tier", "lend"],
                ),
                KeywordRule::new("echo", &["echo", "repeat", "ping"]),
            ],
            "credit",
        )
    }

    fn confidence_for(hits: usize) -> f64 {
        match hits {
            0 => 0.3,
            1 => 0.75,
            _ => 0.95,
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, goal: &str) -> anyhow::Result<Classification> {
        let goal_lower = goal.to_lowercase();

        // First rule wins ties.
        let best = self
            .rules
            .iter()
            .map(|rule| (rule, rule.hits(&goal_lower)))
            .fold(None::<(&KeywordRule, Vec<&str>)>, |best, (rule, hits)| match best {
                Some((_, ref best_hits)) if best_hits.len() >= hits.len() => best,
                _ => Some((rule, hits)),
            });

        Ok(match best {
            Some((rule, hits)) if !hits.is_empty() => Classification::new(
                rule.agent.clone(),
                Self::confidence_for(hits.len()),
                format!("matched keywords: {}", hits.join(", ")),
            ),
            _ => Classification::new(
                self.fallback.clone(),
                Self::confidence_for(0),
                "no keyword matched",
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wallet_scoring_goal() {
        let classifier = KeywordClassifier::default_rules();
        let result = classifier.classify("I want to score my wallet").await.unwrap();
        assert_eq!(result.agent, "credit");
        assert_eq!(result.confidence, 0.95);
        assert!(result.reasoning.contains("score"));
    }

    #[tokio::test]
    async fn test_single_hit_is_moderate() {
        let classifier = KeywordClassifier::default_rules();
        let result = classifier.classify("please ping").await.unwrap();
        assert_eq!(result.agent, "echo");
        assert_eq!(result.confidence, 0.75);
    }

    #[tokio::test]
    async fn test_no_hit_falls_back_with_low_confidence() {
        let classifier = KeywordClassifier::default_rules();
        let result = classifier.classify("what's the weather").await.unwrap();
        assert_eq!(result.agent, "credit");
        assert!(result.confidence < 0.7);
    }
}

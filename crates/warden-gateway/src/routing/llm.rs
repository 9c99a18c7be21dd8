//! Classifier backed by an OpenAI-compatible chat endpoint

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{Classification, Classifier};
use crate::config::ClassifierSettings;

#[derive(Debug, Clone)]
pub struct LlmClassifier {
    api_key: Option<String>,
    base_url: String,
    model: String,
    /// `(label, description)` of every routable agent.
    agents: Vec<(String, String)>,
    http_client: reqwest::Client,
}

impl LlmClassifier {
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            agents: Vec::new(),
            http_client,
        })
    }

    /// Build from settings; the API key is read from the configured
    /// environment variable.
    pub fn from_settings(settings: &ClassifierSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.api_key_env).ok();
        if api_key.is_none() {
            tracing::warn!(
                "{} is not set; sending classifier requests without credentials",
                settings.api_key_env
            );
        }
        Self::new(
            api_key,
            &settings.base_url,
            &settings.model,
            Duration::from_secs(settings.timeout_secs),
        )
    }

    pub fn with_agent(mut self, label: impl Into<String>, description: impl Into<String>) -> Self {
        self.agents.push((label.into(), description.into()));
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn system_prompt(&self) -> String {
        let mut prompt = String::from(
            "You route user goals to exactly one agent. Answer with a single JSON object \
             {\"agent\": <label>, \"confidence\": <number between 0 and 1>, \"reasoning\": <short text>} \
             and nothing else.\n\nAgents:\n",
        );
        for (label, description) in &self.agents {
            prompt.push_str(&format!("- {}: {}\n", label, description));
        }
        prompt
    }

    async fn request_completion(&self, goal: &str) -> Result<String> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: self.system_prompt(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: goal.to_string(),
                },
            ],
            temperature: Some(0.0),
        };

        let mut builder = self
            .http_client
            .post(self.endpoint())
            .header("Content-Type", "application/json");

        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .context("Failed to send classifier request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Classifier API error ({}): {}", status, error_text);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse classifier response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("Classifier response had no choices")
    }
}

/// Pull the JSON answer out of the model's text, tolerating code fences
/// and surrounding prose.
pub(crate) fn parse_answer(content: &str) -> Result<Classification> {
    let start = content.find('{').context("No JSON object in classifier answer")?;
    let end = content.rfind('}').context("No JSON object in classifier answer")?;
    if end < start {
        anyhow::bail!("Malformed JSON object in classifier answer");
    }

    let answer: Classification = serde_json::from_str(&content[start..=end])
        .context("Classifier answer is not a valid classification")?;
    if answer.agent.trim().is_empty() {
        anyhow::bail!("Classifier answer names no agent");
    }
    Ok(Classification::new(
        answer.agent.trim(),
        answer.confidence,
        answer.reasoning,
    ))
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, goal: &str) -> Result<Classification> {
        let content = self.request_completion(goal).await?;
        tracing::debug!("Classifier answer: {}", content);
        parse_answer(&content)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_answer() {
        let answer =
            parse_answer(r#"{"agent": "credit", "confidence": 0.92, "reasoning": "wallet"}"#)
                .unwrap();
        assert_eq!(answer.agent, "credit");
        assert_eq!(answer.confidence, 0.92);
    }

    #[test]
    fn test_parse_fenced_answer() {
        let content = "Sure:\n```json\n{\"agent\": \" echo \", \"confidence\": 3}\n```";
        let answer = parse_answer(content).unwrap();
        assert_eq!(answer.agent, "echo");
        assert_eq!(answer.confidence, 1.0);
        assert!(answer.reasoning.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_answer("I think credit").is_err());
        assert!(parse_answer(r#"{"agent": "", "confidence": 0.5}"#).is_err());
    }

    #[test]
    fn test_system_prompt_lists_agents() {
        let classifier = LlmClassifier::new(None, "http://localhost:1/v1/", "m", Duration::from_secs(1))
            .unwrap()
            .with_agent("credit", "scores wallets");
        assert_eq!(classifier.endpoint(), "http://localhost:1/v1/chat/completions");
        assert!(classifier.system_prompt().contains("- credit: scores wallets"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let classifier =
            LlmClassifier::new(None, "http://127.0.0.1:9", "m", Duration::from_millis(500)).unwrap();
        assert!(classifier.classify("score my wallet").await.is_err());
    }
}

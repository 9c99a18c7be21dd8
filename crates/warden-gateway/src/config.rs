//! Gateway configuration
//!
//! Loaded from TOML; every section has defaults so a partial file (or no
//! file at all) is valid.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use warden_core::attestation::VerifierConfig;
use warden_core::{Address, ConfidentialityTag};

use crate::{GatewayError, DEFAULT_HOST, DEFAULT_PORT};

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub server: ServerSettings,
    pub routing: RoutingSettings,
    pub risk: RiskSettings,
    pub hitl: HitlSettings,
    pub attestation: AttestationSettings,
    pub tracker: TrackerSettings,
    pub classifier: ClassifierSettings,
    pub job: JobSettings,
}

impl WardenConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values no component could run with.
    pub fn validate(&self) -> crate::Result<()> {
        let threshold = self.routing.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(GatewayError::Configuration(format!(
                "routing.confidence_threshold must be within [0, 1], got {}",
                threshold
            )));
        }
        if self.hitl.decision_timeout_secs == 0 {
            return Err(GatewayError::Configuration(
                "hitl.decision_timeout_secs must be positive".to_string(),
            ));
        }
        if self.tracker.poll_interval_ms == 0 {
            return Err(GatewayError::Configuration(
                "tracker.poll_interval_ms must be positive".to_string(),
            ));
        }
        self.job.confidentiality_tag()?;
        self.server.socket_addr()?;
        Ok(())
    }
}

/// HTTP server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Buffered events per WebSocket subscriber before it starts lagging.
    pub event_buffer: usize,
    /// Sessions idle for longer than this are dropped.
    pub session_idle_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            event_buffer: 256,
            session_idle_secs: 3600,
        }
    }
}

impl ServerSettings {
    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }

    pub fn socket_addr(&self) -> crate::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| GatewayError::Configuration(format!("invalid listen address: {}", e)))
    }
}

/// Orchestrator routing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Decisions below this confidence only produce a suggestion.
    pub confidence_threshold: f64,

    /// Appended to an agent response that completes its task.
    pub completion_suffix: String,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            completion_suffix: "\n\n✅ Task complete. What would you like to do next?".to_string(),
        }
    }
}

/// Risk thresholds that force human approval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSettings {
    /// Amounts above this need approval.
    pub max_unattended_amount: f64,

    /// Credit scores below this need approval.
    pub min_credit_score: u32,

    /// Agents whose every activation needs approval.
    pub gated_agents: Vec<String>,
}

impl Default for RiskSettings {
    fn default() -> Self {
        Self {
            max_unattended_amount: 50_000.0,
            min_credit_score: 650,
            gated_agents: Vec::new(),
        }
    }
}

/// Human approval settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitlSettings {
    pub decision_timeout_secs: u64,
}

impl Default for HitlSettings {
    fn default() -> Self {
        Self {
            decision_timeout_secs: 300,
        }
    }
}

impl HitlSettings {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }
}

/// Attestation verifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationSettings {
    pub registry_address: Address,
    pub expiry_window_secs: u64,
    pub future_tolerance_secs: u64,
    /// SQLite replay database; in-memory when unset.
    pub replay_db_path: Option<PathBuf>,
}

impl Default for AttestationSettings {
    fn default() -> Self {
        Self {
            registry_address: Address::zero(),
            expiry_window_secs: 3600,
            future_tolerance_secs: 300,
            replay_db_path: None,
        }
    }
}

impl AttestationSettings {
    pub fn verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            registry_address: self.registry_address.clone(),
            expiry_window_secs: self.expiry_window_secs,
            future_tolerance_secs: self.future_tolerance_secs,
        }
    }
}

/// Task tracker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub poll_interval_ms: u64,
    pub task_timeout_secs: u64,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            task_timeout_secs: 600,
        }
    }
}

impl TrackerSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

/// Which classifier routes free-text goals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    Keyword,
    Llm,
}

/// Classifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub kind: ClassifierKind,
    /// OpenAI-compatible endpoint, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::Keyword,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "WARDEN_LLM_API_KEY".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Confidential credit-scoring job settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Registry label of the agent running the job.
    pub agent_label: String,
    pub app: Address,
    pub dataset: Option<Address>,
    pub workerpool: Option<Address>,
    /// Tag as a hex word, e.g. `0x9` for TDX.
    pub tag: String,
    pub category: u64,
    pub app_max_price: u64,
    pub dataset_max_price: u64,
    pub workerpool_max_price: u64,
    /// Environment variable holding the requester's secp256k1 key.
    pub requester_key_env: String,
    /// Enclave signers whose results are accepted; any signer when empty.
    pub trusted_enclaves: Vec<Address>,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            agent_label: "credit".to_string(),
            app: Address::zero(),
            dataset: None,
            workerpool: None,
            tag: ConfidentialityTag::tdx().to_hex(),
            category: 0,
            app_max_price: 0,
            dataset_max_price: 0,
            workerpool_max_price: 0,
            requester_key_env: "WARDEN_REQUESTER_KEY".to_string(),
            trusted_enclaves: Vec::new(),
        }
    }
}

impl JobSettings {
    pub fn confidentiality_tag(&self) -> crate::Result<ConfidentialityTag> {
        ConfidentialityTag::from_hex(&self.tag)
            .map_err(|e| GatewayError::Configuration(format!("job.tag: {}", e)))
    }
}

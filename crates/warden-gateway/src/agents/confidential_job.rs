//! Credit scoring as a confidential compute job
//!
//! Runs the scoring app inside an enclave on the marketplace and only
//! reports a result whose attestation verifies.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use warden_core::attestation::AttestationVerifier;
use warden_core::crypto::EvmSigner;
use warden_core::{
    compute_task_id, Address, BrokerError, ConfidentialJobBroker, ConfidentialityTag,
    MarketError, Marketplace, RequestOrderParams, TaskTracker, TrackerError,
};

use super::{Agent, AgentContext, AgentError};
use crate::config::{JobSettings, TrackerSettings};
use crate::orchestrator::COMPLETION_MARKER;

const DESCRIPTION: &str =
    "Scores a wallet's creditworthiness inside an attested enclave on the compute marketplace";

/// Agent that brokers, tracks and verifies one scoring job per task
pub struct ConfidentialJobAgent {
    settings: JobSettings,
    tag: ConfidentialityTag,
    market: Arc<dyn Marketplace>,
    broker: ConfidentialJobBroker,
    tracker: TaskTracker,
    verifier: Arc<AttestationVerifier>,
    task_timeout: Duration,
}

impl fmt::Debug for ConfidentialJobAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfidentialJobAgent")
            .field("label", &self.settings.agent_label)
            .field("app", &self.settings.app)
            .field("tag", &self.tag)
            .field("broker", &self.broker)
            .field("task_timeout", &self.task_timeout)
            .finish_non_exhaustive()
    }
}

impl ConfidentialJobAgent {
    pub fn new(
        settings: JobSettings,
        market: Arc<dyn Marketplace>,
        requester: EvmSigner,
        verifier: Arc<AttestationVerifier>,
    ) -> crate::Result<Self> {
        let tag = settings.confidentiality_tag()?;
        let tracker = TrackerSettings::default();
        Ok(Self {
            tag,
            broker: ConfidentialJobBroker::new(market.clone(), requester),
            tracker: TaskTracker::new(market.clone()).with_poll_interval(tracker.poll_interval()),
            market,
            verifier,
            task_timeout: tracker.task_timeout(),
            settings,
        })
    }

    pub fn with_tracker_settings(mut self, tracker: &TrackerSettings) -> Self {
        self.tracker = TaskTracker::new(self.market.clone()).with_poll_interval(tracker.poll_interval());
        self.task_timeout = tracker.task_timeout();
        self
    }

    pub fn requester(&self) -> &Address {
        self.broker.requester()
    }

    fn request_params(&self, wallet: &Address, ctx: &AgentContext) -> RequestOrderParams {
        let mut args = format!("--wallet {}", wallet);
        if let Some(tier) = &ctx.context.requested_tier {
            args.push_str(&format!(" --tier {}", tier));
        }
        if let Some(amount) = ctx.context.amount {
            args.push_str(&format!(" --amount {}", amount));
        }

        let mut params = RequestOrderParams::for_app(self.settings.app.clone())
            .with_tag(self.tag)
            .with_category(self.settings.category)
            .with_prices(
                self.settings.app_max_price,
                self.settings.dataset_max_price,
                self.settings.workerpool_max_price,
            )
            .with_args(args);
        if let Some(dataset) = &self.settings.dataset {
            params = params.with_dataset(dataset.clone(), self.settings.dataset_max_price);
        }
        if let Some(workerpool) = &self.settings.workerpool {
            params = params.with_workerpool(workerpool.clone());
        }
        params
    }

    async fn run_job(&self, wallet: &Address, ctx: &AgentContext) -> Result<String, AgentError> {
        let request = self
            .broker
            .create_signed_request_order(self.request_params(wallet, ctx))
            .map_err(broker_failure)?;
        let orders = self
            .broker
            .fetch_matching_orders(
                &request.app,
                self.settings.dataset.as_ref(),
                self.settings.workerpool.as_ref(),
                request.tag,
                request.category,
            )
            .await
            .map_err(broker_failure)?;
        let deal = self
            .broker
            .broker_deal(&request, &orders)
            .await
            .map_err(broker_failure)?;

        let task_id = compute_task_id(&deal.deal_id, 0);
        info!(
            "Session {}: scoring {} in deal {} (task {})",
            ctx.session_id, wallet, deal.deal_id, task_id
        );

        match self.tracker.wait_for_completion(&task_id, self.task_timeout).await {
            Ok(_) => {}
            Err(TrackerError::TaskFailed { status, cause, .. }) => {
                warn!("Task {} failed: {} ({})", task_id, cause, status);
                return Ok(format!(
                    "The confidential scoring task failed ({}: {}). No result was produced and no supplier was paid.\n{}",
                    status, cause, COMPLETION_MARKER
                ));
            }
            Err(e) => return Err(tracker_failure(e)),
        }

        let receipt = self
            .tracker
            .get_execution_receipt(&deal.deal_id, &task_id)
            .await
            .map_err(tracker_failure)?;

        let mut envelope = match self
            .market
            .task_result(&task_id)
            .await
            .map_err(market_failure)?
        {
            Some(envelope) => envelope,
            None => {
                warn!("Task {} finished without a signed result", task_id);
                return Ok(untrusted("missing_fields"));
            }
        };

        let verdict = self
            .verifier
            .verify_envelope(&mut envelope)
            .await
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        if let Some(reason) = verdict.reason {
            warn!("Result of task {} rejected: {}", task_id, reason);
            return Ok(untrusted(reason.as_str()));
        }
        if envelope.receipt_id() != Some(task_id.to_hex().as_str()) {
            warn!("Result of task {} attests a different receipt", task_id);
            return Ok(untrusted("receipt_mismatch"));
        }

        let signer = match verdict.signer {
            Some(signer) => signer,
            None => return Ok(untrusted("invalid_signature")),
        };
        if !self.settings.trusted_enclaves.is_empty() && !self.settings.trusted_enclaves.contains(&signer) {
            warn!("Result of task {} signed by unknown enclave {}", task_id, signer);
            return Ok(untrusted("untrusted_signer"));
        }

        let result = envelope
            .attestation
            .get("result")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "{}".to_string());

        info!("Session {}: verified result for task {}", ctx.session_id, task_id);
        Ok(format!(
            "Credit score for {}: {}\nComputed in a {} enclave (measurement {}), attested by {}.\nDeal {}, task {}, total paid {}.\n{}",
            wallet,
            result,
            receipt.enclave,
            envelope.enclave_measurement().unwrap_or("unknown"),
            signer,
            deal.deal_id,
            task_id,
            receipt.total_paid(),
            COMPLETION_MARKER
        ))
    }
}

fn untrusted(reason: &str) -> String {
    format!(
        "The enclave result was rejected as untrusted (reason: {}).\n{}",
        reason, COMPLETION_MARKER
    )
}

fn market_failure(e: MarketError) -> AgentError {
    match e {
        MarketError::Unavailable(msg) => AgentError::Transient(msg),
        other => AgentError::Failed(other.to_string()),
    }
}

fn broker_failure(e: BrokerError) -> AgentError {
    match e {
        BrokerError::Market(market) => market_failure(market),
        BrokerError::Core(core) => AgentError::Failed(core.to_string()),
        other => AgentError::Configuration(other.to_string()),
    }
}

fn tracker_failure(e: TrackerError) -> AgentError {
    match e {
        TrackerError::Timeout { .. } => AgentError::TimedOut(e.to_string()),
        TrackerError::Market(market) => market_failure(market),
        other => AgentError::Failed(other.to_string()),
    }
}

#[async_trait]
impl Agent for ConfidentialJobAgent {
    fn label(&self) -> &str {
        &self.settings.agent_label
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    async fn process(&self, goal: &str, ctx: &AgentContext) -> Result<String, AgentError> {
        let wallet = match ctx.context.wallet.as_deref().map(Address::parse) {
            Some(Ok(wallet)) => wallet,
            Some(Err(_)) => {
                return Ok("That wallet address doesn't look valid. Please send a 0x-prefixed, 20-byte address.".to_string())
            }
            None => {
                return Ok("Which wallet should I score? Please share its address.".to_string());
            }
        };

        tracing::debug!("Session {}: goal '{}'", ctx.session_id, goal);
        ctx.authorize().await?;
        self.run_job(&wallet, ctx).await
    }
}

//! Warden Gateway Binary
//!
//! Serves the orchestrator over HTTP/WebSocket against the in-memory
//! marketplace, with a simulated enclave signing job results.
//!
//! # Usage
//! ```bash
//! warden-gateway [--config warden.toml] [--port 18789] [--host 127.0.0.1] [--verbose]
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use warden_core::attestation::{
    AttestationSigner, AttestationVerifier, InMemoryReplayStore, ReplayStore, SqliteReplayStore,
};
use warden_core::crypto::EvmSigner;
use warden_core::{AppOrder, InMemoryMarketplace, SimulatedEnclave, WorkerpoolOrder};
use warden_gateway::config::ClassifierKind;
use warden_gateway::{
    AgentRegistry, BroadcastSink, Classifier, ConfidentialJobAgent, EchoAgent, Gateway, HitlGate,
    InMemorySessionStore, KeywordClassifier, LlmClassifier, Orchestrator, RiskPolicy, WardenConfig,
};

/// Warden Gateway - agent routing with human approval and attested compute
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(args.verbose)
        .init();

    let mut config = match &args.config {
        Some(path) => WardenConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => WardenConfig::default(),
    };
    if let Some(host) = args.host {
        config = config.with_host(host);
    }
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    config.validate()?;

    let gateway = build(config.clone())?;

    let addr = config.server.socket_addr()?;
    tracing::info!("HTTP   http://{}/sessions/:id/messages", addr);
    tracing::info!("WS     ws://{}/ws (pending approvals)", addr);

    tokio::select! {
        served = gateway.start() => served?,
        _ = tokio::signal::ctrl_c() => {
            gateway.shutdown();
            tracing::info!("Interrupted, shutting down");
        }
    }

    Ok(())
}

fn build(config: WardenConfig) -> Result<Gateway> {
    let replay: Arc<dyn ReplayStore> = match &config.attestation.replay_db_path {
        Some(path) => Arc::new(
            SqliteReplayStore::open(path)
                .with_context(|| format!("Failed to open replay store {}", path.display()))?,
        ),
        None => {
            tracing::warn!("No replay_db_path configured; replay protection lasts until restart");
            Arc::new(InMemoryReplayStore::new())
        }
    };
    let verifier = Arc::new(AttestationVerifier::new(
        config.attestation.verifier_config(),
        replay,
    ));

    let market = Arc::new(demo_market(&config)?);

    let requester = match std::env::var(&config.job.requester_key_env) {
        Ok(secret) => EvmSigner::from_hex(&secret).context("Invalid requester key")?,
        Err(_) => {
            tracing::warn!(
                "{} is not set; using an ephemeral requester key",
                config.job.requester_key_env
            );
            EvmSigner::random()
        }
    };

    let credit = ConfidentialJobAgent::new(config.job.clone(), market.clone(), requester, verifier)?
        .with_tracker_settings(&config.tracker);
    tracing::info!("Requester address: {}", credit.requester());

    let mut registry = AgentRegistry::new();
    registry.register(Arc::new(credit))?;
    registry.register(Arc::new(EchoAgent::new(
        "echo",
        "Repeats what you say; useful to check the gateway end to end",
    )))?;
    let registry = Arc::new(registry);

    let classifier: Arc<dyn Classifier> = match config.classifier.kind {
        ClassifierKind::Keyword => Arc::new(KeywordClassifier::default_rules()),
        ClassifierKind::Llm => {
            let llm = registry.list().iter().fold(
                LlmClassifier::from_settings(&config.classifier)?,
                |llm, agent| llm.with_agent(agent.label(), agent.description()),
            );
            Arc::new(llm)
        }
    };

    let approvals = BroadcastSink::new(config.server.event_buffer);
    let gate = Arc::new(HitlGate::new(
        Arc::new(approvals.clone()),
        config.hitl.decision_timeout(),
    ));

    let orchestrator = Orchestrator::new(
        classifier,
        registry,
        Arc::new(InMemorySessionStore::new()),
        gate,
    )
    .with_policy(RiskPolicy::new(config.risk.clone()))
    .with_routing(config.routing.clone());

    Ok(Gateway::new(config, Arc::new(orchestrator), approvals))
}

/// In-memory marketplace with supply for the configured job.
fn demo_market(config: &WardenConfig) -> Result<InMemoryMarketplace> {
    let tag = config.job.confidentiality_tag()?;
    let enclave = SimulatedEnclave::new(
        AttestationSigner::new(EvmSigner::random(), config.attestation.registry_address.clone()),
        "warden-credit-scoring",
        json!({"score": 712, "tier": "B"}),
    );
    tracing::info!("Simulated enclave signer: {}", enclave.signer_address());

    let market = InMemoryMarketplace::new().with_enclave(enclave);
    let supplier = EvmSigner::random();
    market.publish_app_order(
        AppOrder::new(config.job.app.clone(), config.job.app_max_price, 1_000, tag)
            .sign(&supplier)?,
    );
    if let Some(workerpool) = &config.job.workerpool {
        market.publish_workerpool_order(
            WorkerpoolOrder::new(
                workerpool.clone(),
                config.job.workerpool_max_price,
                1_000,
                tag,
                config.job.category,
            )
            .sign(&supplier)?,
        );
    }
    Ok(market)
}

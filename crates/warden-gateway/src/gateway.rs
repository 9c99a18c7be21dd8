//! HTTP and WebSocket surface
//!
//! Chat messages come in over REST; pending approvals stream out over
//! `/ws`, and decisions come back over the same socket or REST.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::WardenConfig;
use crate::hitl::{BroadcastSink, DecisionEvent, PendingApproval};
use crate::orchestrator::{Orchestrator, ProcessOutcome};
use crate::session::{Session, SessionContext};
use crate::{GatewayError, Result};

/// Gateway state shared across handlers
#[derive(Clone)]
pub struct GatewayState {
    pub config: WardenConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub approvals: BroadcastSink,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(config: WardenConfig, orchestrator: Arc<Orchestrator>, approvals: BroadcastSink) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            orchestrator,
            approvals,
            shutdown_tx,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            "invalid_input" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "authorization" => StatusCode::FORBIDDEN,
            "transient" => StatusCode::SERVICE_UNAVAILABLE,
            "aborted" => StatusCode::GATEWAY_TIMEOUT,
            "conflict" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({
            "error": self.to_string(),
            "kind": self.kind(),
        }));
        (status, body).into_response()
    }
}

/// Body of `POST /sessions/:id/messages`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context: SessionContext,
}

/// Body of `POST /approvals/:id/decision`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub approved: bool,
    #[serde(default)]
    pub approver: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionAck {
    pub decision_id: Uuid,
    pub accepted: bool,
}

/// Main Gateway
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(config: WardenConfig, orchestrator: Arc<Orchestrator>, approvals: BroadcastSink) -> Self {
        Self {
            state: Arc::new(GatewayState::new(config, orchestrator, approvals)),
        }
    }

    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Build the Axum router
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/health", get(Self::handle_health))
            .route("/status", get(Self::handle_status))
            .route("/sessions/:id", get(Self::handle_get_session))
            .route("/sessions/:id/messages", post(Self::handle_message))
            .route("/approvals", get(Self::handle_list_approvals))
            .route("/approvals/:id/decision", post(Self::handle_decision))
            .route("/ws", get(Self::handle_ws_upgrade))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until [`Self::shutdown`] is called.
    pub async fn start(&self) -> Result<()> {
        let addr = self.state.config.server.socket_addr()?;
        let router = self.build_router();

        tracing::info!("Warden gateway starting on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let maintenance = self.spawn_maintenance();

        let mut shutdown_rx = self.state.shutdown_tx.subscribe();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await;
        maintenance.abort();

        served.map_err(|e| GatewayError::Internal(e.to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.state.shutdown_tx.send(());
        tracing::info!("Gateway shutdown initiated");
    }

    /// Periodically drop idle sessions and stale approval outcomes.
    fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            let max_idle = state.config.server.session_idle();
            let mut interval = tokio::time::interval(max_idle.max(std::time::Duration::from_secs(1)));
            interval.tick().await;
            loop {
                interval.tick().await;
                match state.orchestrator.purge_idle(max_idle).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!("Purged {} idle session(s)", removed),
                    Err(e) => tracing::warn!("Session purge failed: {}", e),
                }
                let forgotten = state.orchestrator.gate().prune_resolved();
                if forgotten > 0 {
                    tracing::debug!("Forgot {} resolved approval(s)", forgotten);
                }
            }
        })
    }

    // HTTP handlers

    async fn handle_health() -> impl IntoResponse {
        Json(serde_json::json!({
            "status": "healthy",
            "version": crate::VERSION
        }))
    }

    async fn handle_status(State(state): State<Arc<GatewayState>>) -> Result<Json<serde_json::Value>> {
        let orchestrator = &state.orchestrator;
        let agents: Vec<_> = orchestrator
            .registry()
            .list()
            .iter()
            .map(|agent| {
                serde_json::json!({
                    "label": agent.label(),
                    "description": agent.description(),
                })
            })
            .collect();

        Ok(Json(serde_json::json!({
            "version": crate::VERSION,
            "sessions": orchestrator.session_count().await?,
            "pending_approvals": orchestrator.gate().pending().len(),
            "agents": agents,
            "routing": {
                "confidence_threshold": state.config.routing.confidence_threshold,
            },
        })))
    }

    async fn handle_message(
        State(state): State<Arc<GatewayState>>,
        Path(session_id): Path<String>,
        Json(request): Json<MessageRequest>,
    ) -> Result<Json<ProcessOutcome>> {
        let outcome = state
            .orchestrator
            .process_message(&session_id, &request.message, request.context)
            .await?;
        Ok(Json(outcome))
    }

    async fn handle_get_session(
        State(state): State<Arc<GatewayState>>,
        Path(session_id): Path<String>,
    ) -> Result<Json<Session>> {
        Ok(Json(state.orchestrator.session(&session_id).await?))
    }

    async fn handle_list_approvals(State(state): State<Arc<GatewayState>>) -> Json<Vec<PendingApproval>> {
        Json(state.orchestrator.gate().pending())
    }

    async fn handle_decision(
        State(state): State<Arc<GatewayState>>,
        Path(decision_id): Path<Uuid>,
        Json(request): Json<DecisionRequest>,
    ) -> Result<Json<DecisionAck>> {
        let event = DecisionEvent {
            decision_id,
            approved: request.approved,
            approver: request.approver,
            timestamp: chrono::Utc::now(),
        };
        Self::submit(&state, event).map(Json)
    }

    fn submit(state: &GatewayState, event: DecisionEvent) -> Result<DecisionAck> {
        let decision_id = event.decision_id;
        let gate = state.orchestrator.gate();
        if gate.submit_decision(event) {
            return Ok(DecisionAck {
                decision_id,
                accepted: true,
            });
        }
        match gate.outcome(decision_id) {
            Some(_) => Ok(DecisionAck {
                decision_id,
                accepted: false,
            }),
            None => Err(GatewayError::ApprovalNotFound(decision_id.to_string())),
        }
    }

    async fn handle_ws_upgrade(
        ws: WebSocketUpgrade,
        State(state): State<Arc<GatewayState>>,
    ) -> Response {
        ws.on_upgrade(move |socket| Self::handle_ws_connection(socket, state))
    }

    async fn handle_ws_connection(socket: WebSocket, state: Arc<GatewayState>) {
        let (mut tx, mut rx) = socket.split();
        let mut approvals = state.approvals.subscribe();
        let (reply_tx, mut reply_rx) = tokio::sync::mpsc::channel::<String>(16);

        tracing::info!("Approval subscriber connected");

        // Approvals already waiting are sent first.
        let backlog: Vec<String> = state
            .orchestrator
            .gate()
            .pending()
            .iter()
            .filter_map(|approval| serde_json::to_string(approval).ok())
            .collect();

        let outgoing = tokio::spawn(async move {
            for json in backlog {
                if tx.send(Message::Text(json)).await.is_err() {
                    return;
                }
            }
            loop {
                let json = tokio::select! {
                    approval = approvals.recv() => match approval {
                        Ok(approval) => match serde_json::to_string(&approval) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("Failed to encode approval: {}", e);
                                continue;
                            }
                        },
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Approval subscriber lagged, {} event(s) skipped", skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    reply = reply_rx.recv() => match reply {
                        Some(json) => json,
                        None => break,
                    },
                };
                if tx.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let reply = match serde_json::from_str::<DecisionEvent>(&text) {
                        Ok(event) => match Self::submit(&state, event) {
                            Ok(ack) => serde_json::to_value(ack).unwrap_or_default(),
                            Err(e) => serde_json::json!({"error": e.to_string(), "kind": e.kind()}),
                        },
                        Err(e) => serde_json::json!({
                            "error": format!("invalid decision event: {}", e),
                            "kind": "invalid_input",
                        }),
                    };
                    if reply_tx.send(reply.to_string()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("WebSocket error: {}", e);
                    break;
                }
            }
        }

        outgoing.abort();
        tracing::info!("Approval subscriber disconnected");
    }
}

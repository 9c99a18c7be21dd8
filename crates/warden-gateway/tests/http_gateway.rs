//! HTTP surface tests. REST routes are driven through the router in
//! process; `/ws` runs against a bound listener.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use warden_gateway::config::RiskSettings;
use warden_gateway::{
    AgentRegistry, BroadcastSink, EchoAgent, Gateway, HitlGate, InMemorySessionStore,
    KeywordClassifier, Orchestrator, RiskPolicy, WardenConfig, COMPLETION_MARKER,
};

fn router(risk: RiskSettings, decision_timeout: Duration) -> (Router, Arc<HitlGate>) {
    let mut registry = AgentRegistry::new();
    registry
        .register(Arc::new(
            EchoAgent::new("credit", "scores wallets")
                .reply("Which wallet?")
                .reply(format!("712 {}", COMPLETION_MARKER)),
        ))
        .unwrap();

    let approvals = BroadcastSink::new(16);
    let gate = Arc::new(HitlGate::new(
        Arc::new(approvals.clone()),
        decision_timeout,
    ));
    let orchestrator = Orchestrator::new(
        Arc::new(KeywordClassifier::default_rules()),
        Arc::new(registry),
        Arc::new(InMemorySessionStore::new()),
        gate.clone(),
    )
    .with_policy(RiskPolicy::new(risk));

    let gateway = Gateway::new(WardenConfig::default(), Arc::new(orchestrator), approvals);
    (gateway.build_router(), gate)
}

fn gated() -> RiskSettings {
    RiskSettings {
        gated_agents: vec!["credit".to_string()],
        ..RiskSettings::default()
    }
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (router, _) = router(RiskSettings::default(), Duration::from_secs(1));
    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_message_round_trip() {
    let (router, _) = router(RiskSettings::default(), Duration::from_secs(1));

    let (status, body) = send(
        &router,
        "POST",
        "/sessions/s-1/messages",
        Some(json!({"message": "I want to score my wallet"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "Which wallet?");
    assert_eq!(body["session"]["mode"], "AGENT_ACTIVE");
    assert_eq!(body["routing"]["agent"], "credit");
    assert_eq!(body["routing"]["risk_level"], "LOW");

    let (status, body) = send(
        &router,
        "POST",
        "/sessions/s-1/messages",
        Some(json!({"message": "0xabc", "context": {"wallet": "0xabc"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["response"].as_str().unwrap().starts_with("712"));
    assert_eq!(body["session"]["mode"], "NEUTRAL");

    let (status, body) = send(&router, "GET", "/sessions/s-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_history"], json!(["credit completed"]));
    assert_eq!(body["context"]["wallet"], "0xabc");

    let (status, body) = send(&router, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["agents"][0]["label"], "credit");
}

#[tokio::test]
async fn test_error_mapping() {
    let (router, _) = router(RiskSettings::default(), Duration::from_secs(1));

    let (status, body) = send(&router, "GET", "/sessions/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");

    let (status, body) = send(
        &router,
        "POST",
        "/sessions/s-1/messages",
        Some(json!({"message": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");

    let (status, body) = send(
        &router,
        "POST",
        &format!("/approvals/{}/decision", uuid::Uuid::new_v4()),
        Some(json!({"approved": true})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn test_gated_message_times_out_with_forbidden() {
    let (router, gate) = router(gated(), Duration::from_millis(100));

    let (status, body) = send(
        &router,
        "POST",
        "/sessions/s-1/messages",
        Some(json!({"message": "score my wallet"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["kind"], "authorization");
    assert!(gate.pending().is_empty());

    let (_, body) = send(&router, "GET", "/sessions/s-1", None).await;
    assert_eq!(body["mode"], "NEUTRAL");
}

#[tokio::test]
async fn test_decision_over_http() {
    let (router, gate) = router(gated(), Duration::from_secs(5));

    let pending_router = router.clone();
    let message = tokio::spawn(async move {
        send(
            &pending_router,
            "POST",
            "/sessions/s-1/messages",
            Some(json!({"message": "score my wallet"})),
        )
        .await
    });

    let decision_id = loop {
        let (_, body) = send(&router, "GET", "/approvals", None).await;
        if let Some(id) = body[0]["decision_id"].as_str() {
            break id.to_string();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };

    let uri = format!("/approvals/{}/decision", decision_id);
    let (status, body) = send(&router, "POST", &uri, Some(json!({"approved": true, "approver": "ops"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], true);

    let (status, body) = message.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "Which wallet?");
    assert_eq!(body["session"]["hitl_pending"], false);

    // A second decision for the same id is acknowledged but ignored.
    let (status, body) = send(&router, "POST", &uri, Some(json!({"approved": false}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["accepted"], false);
    assert!(gate.pending().is_empty());
}

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Next text frame carrying `key`. Approvals opened while the socket
/// subscribes can arrive twice, so unrelated frames are skipped.
async fn frame_with(ws: &mut Client, key: &str) -> Value {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let frame: Value = serde_json::from_str(&text).unwrap();
                if frame.get(key).is_some() {
                    return frame;
                }
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_ws_streams_approvals_and_takes_decisions() {
    let (router, gate) = router(gated(), Duration::from_secs(5));
    let message_router = router.clone();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, router).await });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    let message = tokio::spawn(async move {
        send(
            &message_router,
            "POST",
            "/sessions/s-1/messages",
            Some(json!({"message": "score my wallet"})),
        )
        .await
    });

    let approval = frame_with(&mut ws, "session_id").await;
    assert_eq!(approval["session_id"], "s-1");
    assert_eq!(approval["agent"], "credit");
    let decision_id = approval["decision_id"].as_str().unwrap().to_string();

    let decision = json!({"decision_id": decision_id, "approved": true, "approver": "ops"});
    ws.send(Message::Text(decision.to_string())).await.unwrap();
    let ack = frame_with(&mut ws, "accepted").await;
    assert_eq!(ack["decision_id"], decision_id.as_str());
    assert_eq!(ack["accepted"], true);

    let (status, body) = message.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "Which wallet?");
    assert!(gate.pending().is_empty());

    ws.send(Message::Text("not a decision".to_string())).await.unwrap();
    let error = frame_with(&mut ws, "kind").await;
    assert_eq!(error["kind"], "invalid_input");

    ws.close(None).await.unwrap();
    server.abort();
}

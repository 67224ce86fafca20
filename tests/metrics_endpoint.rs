//! Integration tests for the metrics HTTP server.
//!
//! Binds an ephemeral port, scrapes it with `reqwest`, and shuts the server
//! down through its watch channel.

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;

use tokio_stream_router::metrics::{MetricsSink, PrometheusSink, STREAM_OUTCOMES_TOTAL};
use tokio_stream_router::metrics_server::{self, MetricsState};
use tokio_stream_router::routing::{ArmHealth, ArmSpec};
use tokio_stream_router::{ArmId, EchoBackend, Orchestrator, PrincipalId, RouterConfig};

// ============================================================================
// Helpers
// ============================================================================

struct Server {
    base: String,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    orchestrator: Arc<Orchestrator>,
    sink: Arc<PrometheusSink>,
}

async fn start() -> Server {
    let sink = Arc::new(PrometheusSink::new().unwrap());
    let config = RouterConfig {
        arms: vec![
            ArmSpec::new("small", "gpu-small", "echo"),
            ArmSpec::new("large", "gpu-large", "echo"),
        ],
        ..RouterConfig::default()
    };
    let orchestrator = Arc::new(
        Orchestrator::builder(config)
            .backend(Arc::new(EchoBackend::new("echo")))
            .metrics(sink.clone())
            .build()
            .unwrap(),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let (stop, rx) = watch::channel(false);
    let state = MetricsState {
        sink: sink.clone(),
        orchestrator: orchestrator.clone(),
    };
    let task = tokio::spawn(async move {
        metrics_server::serve(listener, state, rx).await.unwrap();
    });
    Server {
        base,
        stop,
        task,
        orchestrator,
        sink,
    }
}

// ============================================================================
// Endpoints
// ============================================================================

#[tokio::test]
async fn test_metrics_endpoint_renders_prometheus_text() {
    let server = start().await;
    server
        .sink
        .inc_counter(STREAM_OUTCOMES_TOTAL, &[("outcome", "completed")]);

    let response = reqwest::get(format!("{}/metrics", server.base)).await.unwrap();
    assert!(response.status().is_success());
    let body = response.text().await.unwrap();
    assert!(body.contains("stream_outcomes_total{outcome=\"completed\"} 1"));

    server.stop.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_health_endpoint_counts_sessions_and_arms() {
    let server = start().await;
    let session = server.orchestrator.open_session(PrincipalId::new("p"));
    // The session registers with the ledger on its first frame.
    session.send_text("{}".into()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let health: serde_json::Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["sessions"], 1);
    assert_eq!(health["arms"], 2);
    assert_eq!(health["retiredArms"], 0);

    session.close().await.unwrap();
    server.stop.send(true).unwrap();
    server.task.await.unwrap();
}

#[tokio::test]
async fn test_revive_endpoint_returns_retired_arm_to_rotation() {
    let server = start().await;
    let small = ArmId::new("small");
    server.orchestrator.registry().retire(&small);
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/arms/small/revive", server.base))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["armId"], "small");
    assert_eq!(
        server.orchestrator.registry().health(&small),
        Some(ArmHealth::Live)
    );

    let unknown = client
        .post(format!("{}/arms/nope/revive", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop.send(true).unwrap();
    server.task.await.unwrap();
}

//! Demo binary for tokio-stream-router
//!
//! Builds a router over echo backends, opens one session, sends a handful
//! of streamed requests, and prints the frames it gets back.
//!
//! ## Usage
//!
//! ```text
//! stream-router [--config router.toml]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG=info`: log level filter (default: info)

use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream_router::config::loader;
use tokio_stream_router::metrics::PrometheusSink;
use tokio_stream_router::metrics_server::{self, MetricsState};
use tokio_stream_router::protocol::{Frame, Payload, PayloadKind};
use tokio_stream_router::routing::ArmSpec;
use tokio_stream_router::{
    init_tracing_with, EchoBackend, Orchestrator, PrincipalId, RouterConfig, StreamId,
};
use tracing::{error, info};

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

fn demo_arms() -> Vec<ArmSpec> {
    vec![
        ArmSpec::new("small", "gpu-small", "echo")
            .with_price(200)
            .with_quality(0.7)
            .with_latency(200),
        ArmSpec::new("large", "gpu-large", "echo-slow")
            .with_price(2_000)
            .with_quality(0.95)
            .with_latency(800)
            .with_cold_start_penalty(400),
        ArmSpec::new("canary", "gpu-small", "echo")
            .with_price(150)
            .with_quality(0.75)
            .as_challenger(),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match config_path() {
        Some(path) => loader::load_from_file(&path)?,
        None => RouterConfig::default(),
    };
    if config.arms.is_empty() {
        config.arms = demo_arms();
    }
    let _ = init_tracing_with(config.observability.log_format);

    info!(arms = config.arms.len(), "Starting tokio-stream-router demo");

    let sink = Arc::new(PrometheusSink::new()?);
    let orchestrator = Arc::new(
        Orchestrator::builder(config.clone())
            .backend(Arc::new(EchoBackend::new("echo").with_price(200)))
            .backend(Arc::new(EchoBackend::new("echo-slow").with_delay(25).with_price(2_000)))
            .metrics(sink.clone())
            .build()?,
    );
    orchestrator.spawn_background();

    let (server_stop, server_rx) = watch::channel(false);
    let server = config.observability.metrics_port.map(|port| {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let state = MetricsState {
            sink: sink.clone(),
            orchestrator: orchestrator.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = metrics_server::start_server(addr, state, server_rx).await {
                error!(error = %e, "metrics server stopped");
            }
        })
    });

    let mut session = orchestrator.open_session(PrincipalId::new("demo-client"));
    let prompts = [
        "What is the capital of France?",
        "Explain quantum computing in simple terms",
        "Write a haiku about programming",
        "Describe the water cycle",
    ];

    for (i, prompt) in prompts.iter().enumerate() {
        let mut frame = Frame::new(
            session.session_id.clone(),
            StreamId::new((i + 1).to_string()),
            1,
            Payload::new(PayloadKind::Request, json!(prompt)),
        );
        frame.meta.task_type = Some("chat".to_string());
        frame.meta.languages = vec!["en".to_string()];
        frame.ttl = Some(30_000);
        session.send(&frame).await?;
    }
    info!(count = prompts.len(), "All requests sent");

    let mut finished = 0;
    while finished < prompts.len() {
        let Some(frame) = session.recv().await? else {
            break;
        };
        match frame.payload.kind {
            PayloadKind::Chunk => {}
            PayloadKind::Final | PayloadKind::Error => {
                finished += 1;
                println!(
                    "stream {} -> {} {}",
                    frame.stream_id,
                    frame.payload.kind.as_str(),
                    frame.payload.content
                );
            }
            kind => println!("stream {} -> {} {}", frame.stream_id, kind.as_str(), frame.payload.content),
        }
    }

    let summary = session.close().await?;
    info!(streams = summary.streams.len(), end = ?summary.end, "Session closed");

    orchestrator.shutdown().await;
    let _ = server_stop.send(true);
    if let Some(server) = server {
        let _ = server.await;
    }

    println!("{}", sink.gather());
    info!("Demo complete");
    Ok(())
}

//! meshrpc demo node.
//!
//! Starts a small in-process mesh: `--nodes` engines, each serving an
//! `EchoApi` schema over the loopback transport and announcing itself to
//! the others through the peer registry. Node 0 serves the health surface
//! and periodically calls `EchoApi.echo` on the mesh. Ctrl-C or SIGTERM
//! destroys every engine and exits.
//!
//! ```bash
//! meshrpc-node --nodes 3 --health-port 8080
//! MESHRPC_LOG_JSON=true RUST_LOG=meshrpc_runtime=debug meshrpc-node
//! ```

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use meshrpc_core::{Address, Microservice, Version};
use meshrpc_runtime::config::EngineConfig;
use meshrpc_runtime::engine::{Engine, ProducerSchema, StaticProducerProvider};
use meshrpc_runtime::invocation::{FnOperation, InvocationError};
use meshrpc_runtime::network::{HealthConfig, HealthServer};
use meshrpc_runtime::transport::LoopbackNetwork;
use serde_json::{json, Value};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshrpc-node", version, about = "Runs an in-process meshrpc mesh")]
struct Args {
    /// Application id shared by every engine.
    #[arg(long, env = "MESHRPC_APP_ID", default_value = "demo")]
    app_id: String,

    /// Microservice name served by every engine.
    #[arg(long, env = "MESHRPC_SERVICE", default_value = "echo")]
    service: String,

    #[arg(long, env = "MESHRPC_VERSION", default_value = "1.0.0")]
    service_version: Version,

    /// Number of engines in the mesh.
    #[arg(long, env = "MESHRPC_NODES", default_value_t = 2)]
    nodes: u16,

    #[arg(long, env = "MESHRPC_HEALTH_HOST", default_value = "127.0.0.1")]
    health_host: String,

    /// 0 picks a free port.
    #[arg(long, env = "MESHRPC_HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,

    #[arg(long, env = "MESHRPC_HEARTBEAT_MS", default_value_t = 5_000)]
    heartbeat_ms: u64,

    #[arg(long, env = "MESHRPC_DEAD_INSTANCE_MS", default_value_t = 15_000)]
    dead_instance_ms: u64,

    /// Grace period for peers to see DOWN before transports close.
    #[arg(long, env = "MESHRPC_TURN_DOWN_WAIT_SECS", default_value_t = 0)]
    turn_down_wait_secs: u64,

    /// Interval of the demo echo call; 0 disables it.
    #[arg(long, env = "MESHRPC_CALL_INTERVAL_MS", default_value_t = 2_000)]
    call_interval_ms: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "MESHRPC_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            heartbeat_interval_ms: self.heartbeat_ms,
            dead_instance_timeout_ms: self.dead_instance_ms,
            turn_down_wait_secs: self.turn_down_wait_secs,
            ..EngineConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

fn echo_schema(node: u16) -> ProducerSchema {
    ProducerSchema::new("EchoApi", "echo(args...) -> {node, args}").operation(
        "echo",
        FnOperation(move |args: Vec<Value>| async move {
            Ok::<_, InvocationError>(json!({ "node": node, "args": args }))
        }),
    )
}

fn build_engine(args: &Args, network: &LoopbackNetwork, node: u16) -> anyhow::Result<Engine> {
    let host = format!("node-{node}");
    let own = Address::parse(&format!("loopback://{host}:7000"))
        .with_context(|| format!("invalid loopback address for {host}"))?;
    let microservice = Microservice::new(&args.app_id, &args.service, args.service_version);

    Ok(Engine::builder(microservice)
        .config(args.engine_config())
        .instance_id(host.clone())
        .property("node", node.to_string())
        .transport(network.transport(&host, 7000))
        .discovery_client(std::sync::Arc::new(network.discovery_client()))
        .publisher(std::sync::Arc::new(network.publisher(&own)))
        .producer_provider(StaticProducerProvider::new("echo", vec![echo_schema(node)]))
        .build())
}

async fn call_loop(engine: Engine, service: String, interval: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    let mut sequence = 0u64;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sequence += 1;
                match engine.call(&service, "EchoApi", "echo", vec![json!(sequence)]).await {
                    Ok(value) => info!(sequence, reply = %value, "echo call answered"),
                    Err(e) => warn!(sequence, status = e.status_code(), error = %e, "echo call failed"),
                }
            }
            _ = stop.changed() => break,
        }
    }
}

/// Wait for shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {err}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let network = LoopbackNetwork::new();
    let mut engines = Vec::with_capacity(usize::from(args.nodes.max(1)));
    for node in 0..args.nodes.max(1) {
        let engine = build_engine(&args, &network, node)?;
        engine
            .run()
            .await
            .with_context(|| format!("node-{node} failed to start"))?;
        engines.push(engine);
    }
    // Earlier nodes only hear about later ones once they heartbeat.
    for engine in &engines {
        if !engine.heartbeat_now().await {
            warn!(instance_id = %engine.identity().instance_id(), "heartbeat not running");
        }
    }
    info!(nodes = engines.len(), bound = ?network.bound(), "mesh is up");

    let (stop_tx, stop_rx) = watch::channel(false);

    let mut health = HealthServer::new(
        HealthConfig {
            host: args.health_host.clone(),
            port: args.health_port,
        },
        engines[0].clone(),
    );
    let port = health.start().await.context("failed to bind health server")?;
    info!(port, "health surface listening");
    let mut health_stop = stop_rx.clone();
    let health_task = tokio::spawn(health.serve(async move {
        let _ = health_stop.changed().await;
    }));

    let caller = (args.call_interval_ms > 0).then(|| {
        tokio::spawn(call_loop(
            engines[0].clone(),
            args.service.clone(),
            Duration::from_millis(args.call_interval_ms),
            stop_rx.clone(),
        ))
    });

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = stop_tx.send(true);

    if let Some(caller) = caller {
        let _ = caller.await;
    }
    for engine in engines.iter().rev() {
        engine.destroy().await;
    }
    match health_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "health server failed"),
        Err(e) => error!(error = %e, "health server task panicked"),
    }
    info!("bye");
    Ok(())
}

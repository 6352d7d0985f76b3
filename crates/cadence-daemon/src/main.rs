use std::net::SocketAddr;
use std::sync::Arc;

use cadence_core::{CadenceConfig, TaskPayload};
use cadence_scheduler::{ChannelSink, EngineConfig, Enqueued, JobStore, SchedulerEngine, StoreOptions};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

mod cli;
mod http;
mod jobs;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence_daemon=info,cadence_scheduler=info,tower_http=debug".into()
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    // load config: --config > CADENCE_CONFIG env > ~/.cadence/cadence.toml
    let config_path = cli
        .config
        .as_ref()
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve(config).await,
        Command::Jobs { action } => {
            let store = open_store(&config)?;
            jobs::execute(&store, action)
        }
    }
}

fn open_store(config: &CadenceConfig) -> anyhow::Result<JobStore> {
    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, namespace = %config.scheduler.namespace, "opening SQLite database");
    Ok(JobStore::open(
        db_path,
        config.database.busy_timeout(),
        StoreOptions::from(&config.scheduler),
    )?)
}

async fn serve(config: CadenceConfig) -> anyhow::Result<()> {
    let store = Arc::new(open_store(&config)?);

    // Enqueued-task channel: SchedulerEngine → delivery consumer task
    let (sink, enqueued_rx) = ChannelSink::new(config.sink.capacity, config.sink.max_payload_bytes);
    tokio::spawn(deliver(enqueued_rx));

    let engine = SchedulerEngine::new(store, Arc::new(sink), EngineConfig::from(&config.scheduler));
    let health = engine.health();

    // spawn scheduler engine loop in background
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx.clone()));

    if config.http.enabled {
        let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port).parse()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("health endpoint listening on {}", addr);
        let router = http::build_router(health);
        let mut stop = shutdown_rx;
        tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopping| *stopping).await;
                })
                .await;
            if let Err(e) = served {
                warn!("health endpoint stopped: {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");

    // signal scheduler to stop; it finishes in-flight claims first
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await? {
        warn!(code = e.code(), "scheduler had halted: {e}");
    }
    Ok(())
}

/// Built-in consumer of the channel sink: logs each enqueued task.
async fn deliver(mut rx: mpsc::Receiver<Enqueued>) {
    while let Some(msg) = rx.recv().await {
        match TaskPayload::from_bytes(&msg.payload) {
            Ok(task) => info!(
                execution_id = %msg.execution_id,
                queue = %task.queue,
                scheduled_for = %msg.scheduled_for,
                "enqueued {}",
                task.function_string()
            ),
            Err(e) => warn!(
                execution_id = %msg.execution_id,
                bytes = msg.payload.len(),
                "enqueued payload is not a task descriptor: {e}"
            ),
        }
    }
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

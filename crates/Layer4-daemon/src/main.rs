//! kestreld - Kestrel daemon entry point
//!
//! 매니페스트에 적힌 워크스페이스/컨테이너/트랙을 띄우고, 이벤트를
//! JSON Lines로 출력하다가 Ctrl-C를 받으면 모든 컨테이너를 정지합니다.

mod event_log;
mod manifest;

use anyhow::{Context, Result};
use clap::Parser;
use event_log::JsonLineLogger;
use kestrel_foundation::{RuntimeConfig, Topic};
use kestrel_runtime::{
    ContainerAdapter, DockerAdapter, FindingsStore, MsfRpcClient, RpcClient, Runtime,
    SqliteFindingsStore,
};
use manifest::Manifest;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Kestrel - container and console lifecycle daemon
#[derive(Parser, Debug)]
#[command(name = "kestreld")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Runtime configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspaces, containers and tracks to bring up (TOML)
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Findings database (SQLite)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Docker network for new containers
    #[arg(long)]
    docker_network: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config =
        RuntimeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let manifest = match &args.manifest {
        Some(path) => Manifest::load(path)?,
        None => Manifest::default(),
    };

    let runtime = build_runtime(&args, config).await?;
    bring_up(&runtime, &manifest).await;

    info!(
        workspaces = manifest.workspaces.len(),
        containers = manifest.container_count(),
        "kestreld running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutting down");
    runtime.shutdown().await;
    Ok(())
}

async fn build_runtime(args: &Args, config: RuntimeConfig) -> Result<Runtime> {
    let adapter = DockerAdapter::connect().context("failed to connect to Docker")?;
    if !adapter.is_available().await {
        warn!("Docker daemon is not responding, containers will fail to start until it is");
    }

    let rpc = MsfRpcClient::with_timeout(config.call_timeout())
        .context("failed to build console RPC client")?;

    let database = match &args.database {
        Some(path) => path.clone(),
        None => default_database_path(),
    };
    if let Some(parent) = database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteFindingsStore::open(&database)
        .with_context(|| format!("failed to open findings database {}", database.display()))?;
    info!(database = %database.display(), "Findings store opened");

    let mut runtime = Runtime::new(
        config,
        Arc::new(adapter) as Arc<dyn ContainerAdapter>,
        Arc::new(rpc) as Arc<dyn RpcClient>,
        Arc::new(store) as Arc<dyn FindingsStore>,
    );
    if let Some(network) = &args.docker_network {
        runtime = runtime.with_network(network.clone());
    }
    Ok(runtime)
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kestrel")
        .join("findings.db")
}

/// 매니페스트 순서대로 기동 (실패한 항목은 로그만 남기고 계속)
async fn bring_up(runtime: &Runtime, manifest: &Manifest) {
    let logger = Arc::new(JsonLineLogger);

    for workspace in &manifest.workspaces {
        runtime.open_workspace(workspace.id).await;
        let _ = runtime
            .bus()
            .attach(Topic::workspace(workspace.id), Arc::clone(&logger) as _);

        for container in &workspace.containers {
            if let Err(e) = runtime
                .provision_container(workspace.id, container.id, &container.slug, &container.image)
                .await
            {
                error!(container_id = %container.id, error = %e, "Provisioning failed");
                continue;
            }

            for track in &container.tracks {
                if let Err(e) = runtime.activate_track(workspace.id, container.id, *track).await {
                    error!(track_id = %track, error = %e, "Track activation failed");
                }
            }

            if container.autostart {
                if let Err(e) = runtime.start_container(container.id).await {
                    error!(container_id = %container.id, error = %e, "Container start failed");
                }
            }
        }
    }
}

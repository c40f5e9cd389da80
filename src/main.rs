use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

use burst_proxy::capture::RequestStore;
use burst_proxy::commands;
use burst_proxy::config::{self, Config};
use burst_proxy::error::Result;
use burst_proxy::logging;
use burst_proxy::proxy::{ProxyServer, ProxyService};
use burst_proxy::state::AppState;
use burst_proxy::web;

const RETENTION_INTERVAL: Duration = Duration::from_secs(86_400);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "burst-proxy")]
#[command(about = "An intercepting HTTP/HTTPS proxy that captures and replays requests", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the proxy (default)
    Run,
    /// Validate configuration and load or create the root CA
    Check,
    /// Print the root CA certificate for installation in client trust stores
    Ca {
        /// Write the PEM to this file instead of stdout
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => config::load_from_path(path).await?,
        None => config::load_from_env_or_file().await?,
    };

    let _log_guard = logging::init(&config.logging, args.debug);
    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }

    match args.command.unwrap_or(Command::Run) {
        Command::Check => commands::run_config_check(config).await,
        Command::Ca { out } => commands::export_ca(config, out.as_deref()).await,
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting burst proxy");
    let (state, _shutdown_rx) = AppState::initialize(config).await?;

    let service = Arc::new(ProxyService::from_state(&state)?);
    let proxy_server = ProxyServer::bind(&state, service).await?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!("Proxy server error: {}", e);
        }
    });

    let web_handle = if state.config.admin.enabled {
        let (_, server) = web::bind(state.clone())?;
        Some(tokio::spawn(async move {
            server.await;
            info!("Admin API stopped");
        }))
    } else {
        None
    };

    if let Some(store) = state.store.clone() {
        spawn_retention_job(store, state.config.capture.retention_days);
    }

    shutdown_signal().await;
    info!("Shutting down burst proxy");

    let shutdown = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        state.shutdown();
        if let Some(web_handle) = web_handle {
            let _ = tokio::join!(proxy_handle, web_handle);
        } else {
            let _ = proxy_handle.await;
        }
    })
    .await;

    match shutdown {
        Ok(_) => info!("Graceful shutdown completed"),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn spawn_retention_job(store: Arc<dyn RequestStore>, retention_days: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RETENTION_INTERVAL);
        loop {
            interval.tick().await;
            let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
            info!("Running capture retention policy ({}d)", retention_days);
            match store.purge_older_than(cutoff).await {
                Ok(deleted) => info!("Retention policy deleted {} old captures", deleted),
                Err(e) => error!("Retention policy failed: {}", e),
            }
        }
    });
    info!("Background retention job started (runs daily)");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

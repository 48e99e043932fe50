use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::http::HttpServer;
use tollgate::ratelimit::{AdmissionEngine, PolicyRegistry};

/// Policy-based admission control service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Tollgate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        policies = config.policies.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(PolicyRegistry::from_config(&config).await?);
    let engine = AdmissionEngine::new(registry);

    let server = HttpServer::new(config.server.clone(), engine);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Tollgate admission service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

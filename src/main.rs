use std::path::PathBuf;
use std::sync::Arc;

use btc_payment_monitor::app::App;
use btc_payment_monitor::config::load_config;
use btc_payment_monitor::shutdown::Shutdown;
use btc_payment_monitor::supervisor::Supervisor;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Runs the payment-monitoring core: address pool, blockchain query layer,
/// payment observers, and real-time fanout, fronted by the HTTP/webhook/
/// websocket surface in `server::serve`.
#[derive(Debug, Clone, Parser)]
#[clap(rename_all = "kebab-case")]
struct Args {
    /// Path to a TOML config file. Environment variables (`MON__...`) and
    /// the legacy single-name aliases in `config::legacy_aliases` still
    /// apply on top of it.
    #[clap(short, long, env)]
    config: Option<PathBuf>,

    /// Emit logs as JSON instead of the default human-readable format.
    #[clap(long, env)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().json().with_filter(env_filter))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = load_config(args.config.as_deref())?;
    info!(address = %config.server.address, data_dir = %config.data_dir.display(), "starting");

    let shutdown = Shutdown::spawn(config.server.shutdown_timeout, config.server.shutdown_delay);
    let server_config = config.server.clone();
    let app = App::new(config, shutdown.clone()).await?;

    let supervisor = Supervisor::new(app.clone());
    let background = supervisor.start();

    let server = tokio::spawn(run_server(app, server_config, shutdown.clone()));

    shutdown.await_shutdown_begin().await;
    info!("shutdown requested, draining background tasks");

    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked during shutdown");
        }
    }

    server.await??;
    info!("shutdown complete");
    Ok(())
}

async fn run_server(
    app: Arc<App>,
    config: btc_payment_monitor::config::ServerConfig,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    btc_payment_monitor::server::run(app, config, shutdown).await
}

//! sparkrelay - broker-to-SMS notification relay
//!
//! Subscribes to one broker topic and forwards each inbound message as an
//! SMS alert. A small HTTP listener provides liveness and metrics.

use anyhow::Result;
use clap::Parser;
use sparkrelay::{app::App, cli::Cli, config::Config};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment,
    // and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("sparkrelay starting up");
    info!("broker endpoint: {}", config.broker.endpoint);
    info!("topic: {}", config.broker.topic);
    info!("client id: {}", config.broker.client_id);
    info!(
        "dispatch: {}",
        if config.dispatch.enabled { "enabled" } else { "disabled (dry run)" }
    );
    info!(
        "liveness listener: {}",
        if config.http.enabled {
            config.http.listen_address.to_string()
        } else {
            "disabled".to_string()
        }
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Startup is fail-fast: config gaps, a rejected connect, or a rejected
    // subscribe must exit non-zero instead of leaving a half-started relay.
    let app = match App::builder(config).build(shutdown_rx).await {
        Ok(app) => app,
        Err(err) => {
            error!("startup failed: {err:#}");
            std::process::exit(1);
        }
    };

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    app.run().await?;
    info!("all tasks shut down, exiting");
    Ok(())
}

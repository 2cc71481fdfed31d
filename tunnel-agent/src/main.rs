//! tunnel-agent - expose local services through a relay tunnel
//!
//! Usage:
//!   tunnel-agent -f <name>|<target> -k <key> [-h <host>] [-n] [-l <level>] [-d]

mod cli;
mod config;
mod dispatcher;
mod idle;
mod registry;
mod session;
mod status;
mod supervisor;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;
use idle::{FirebaseIdleWatch, IdleWatch};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_filter());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "tunnel agent exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(
        cli.into_session_config()
            .context("invalid tunnel configuration")?,
    );

    tracing::info!(
        hostname = %config.hostname,
        tunnels = config.tunnels.len(),
        "starting tunnel agent"
    );

    let idle_watch: Arc<dyn IdleWatch> = Arc::new(FirebaseIdleWatch::new(reqwest::Client::new()));
    let (status_tx, _status_rx) = status::channel();

    tokio::select! {
        _ = supervisor::run(config, idle_watch, status_tx) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received interrupt, shutting down");
        }
    }

    Ok(())
}

fn init_logging(filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{filter},tunnel_agent=debug").into()),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .init();
}

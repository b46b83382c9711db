//! Marionette - webhook-driven meta-controller runtime for Kubernetes

use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use marionette::crd::MetaController;
use marionette::hook::WebhookClient;
use marionette::sweep::Sweeper;

/// Marionette - webhook-driven meta-controller runtime for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "marionette", version, about, long_about = None)]
struct Cli {
    /// Generate the MetaController CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Seconds between reconciliation sweeps
    #[arg(long, default_value_t = marionette::DEFAULT_SWEEP_INTERVAL_SECS)]
    interval_secs: u64,

    /// Timeout for a single sync webhook call, in seconds
    #[arg(long, default_value_t = marionette::DEFAULT_HOOK_TIMEOUT_SECS)]
    hook_timeout_secs: u64,

    /// Run a single sweep and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("Failed to install crypto provider");

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML
        let crd = serde_yaml::to_string(&MetaController::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    tracing::info!("Marionette starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let hook = WebhookClient::with_timeout(Duration::from_secs(cli.hook_timeout_secs))
        .map_err(|e| anyhow::anyhow!("Failed to create webhook client: {}", e))?;

    let sweeper = Sweeper::new(client, hook);

    let mut interval = tokio::time::interval(Duration::from_secs(cli.interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        interval_secs = cli.interval_secs,
        "Starting reconciliation sweeps"
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = sweeper.sweep().await {
                    tracing::error!(error = %e, "Sweep failed");
                }
                if cli.once {
                    break;
                }
            }
        }
    }

    tracing::info!("Marionette shutting down");
    Ok(())
}

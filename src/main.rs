//! Nonce Keeper daemon
//!
//! Connects every configured EVM network, syncs the configured wallets with
//! their nodes and keeps reconciling nonces until interrupted.
//!
//! ## Features
//!
//! - **Durable nonce state**: sled-backed nonce records and transaction log
//! - **Reconciliation**: startup sync, receipt checks, expired nonce reclaim
//! - **Shared storage**: one store per path, closed after the last connector
//! - **Metrics**: Prometheus text endpoint

// Compiler warning configuration
#![warn(unused_imports)]
#![warn(unused_mut)]
#![warn(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nonce_keeper::chain::{CachingOracle, ConnectorRegistry, JsonRpcOracle, LedgerOracle};
use nonce_keeper::config::Config;
use nonce_keeper::endpoints;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml", env = "NONCE_KEEPER_CONFIG")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON logs (overrides the config file)
    #[arg(long)]
    json_logs: bool,

    /// Metrics port (overrides the config file)
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration before logging so the log format can come from it
    let config = load_config(&args.config)?;

    // Initialize logging
    init_logging(args.verbose, args.json_logs || config.monitoring.json_logs)?;

    info!("Starting nonce keeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from: {}", args.config);

    config.validate().context("Invalid configuration")?;
    let settings = config
        .connector_settings()
        .context("Failed to resolve storage paths")?;
    info!(
        nonce_db = %settings.nonce_db_path.display(),
        transaction_db = %settings.transaction_db_path.display(),
        "Storage paths resolved"
    );

    let registry = Arc::new(ConnectorRegistry::new(
        settings,
        config.server.flush_on_write,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Initialize metrics
    if config.monitoring.enable_metrics {
        let metrics_port = args.metrics_port.unwrap_or(config.monitoring.metrics_port);
        info!("Starting metrics server on port {}", metrics_port);
        let registry = registry.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(metrics_port, registry, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    // Connect chains
    for descriptor in &config.chains {
        let rpc = JsonRpcOracle::new(&descriptor.rpc_url, config.reconciler.oracle_timeout())
            .with_context(|| format!("Failed to build RPC client for {}", descriptor.ledger_id()))?;
        let oracle: Arc<dyn LedgerOracle> = Arc::new(CachingOracle::new(
            Arc::new(rpc),
            config.reconciler.receipt_cache_ttl(),
        ));

        let connector = registry
            .get_or_create(descriptor.clone(), oracle)
            .await
            .with_context(|| format!("Failed to connect {}", descriptor.ledger_id()))?;

        // A node that is down now is retried on the next call to init
        if let Err(e) = connector.init().await {
            warn!(chain = %descriptor.ledger_id(), error = %e, "Chain not ready yet");
        }
    }

    info!(
        chains = registry.connected_instances().await.len(),
        "All chains connected, reconciling until interrupted"
    );

    run_until_shutdown(&registry).await?;

    shutdown_tx.send_replace(true);
    registry
        .shutdown_all()
        .await
        .context("Failed to close chain connectors")?;

    info!("Shutting down gracefully...");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "nonce_keeper=debug,info"
    } else {
        "nonce_keeper=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Load configuration from file
fn load_config(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        anyhow::bail!("Config file '{}' not found", path);
    }
    Config::from_file_with_env(path).with_context(|| format!("Failed to load config from {}", path))
}

/// Retry chains that failed to initialize until ctrl-c
async fn run_until_shutdown(registry: &ConnectorRegistry) -> Result<()> {
    let mut retry_interval = tokio::time::interval(registry.settings().reconciler.interval);

    loop {
        tokio::select! {
            _ = retry_interval.tick() => {
                for connector in registry.connected_instances().await {
                    if connector.is_ready() {
                        continue;
                    }
                    if let Err(e) = connector.init().await {
                        warn!(chain = %connector.descriptor().ledger_id(), error = %e, "Chain still not ready");
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                info!("Received shutdown signal");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["nonce-keeper", "-c", "keeper.toml", "-v", "--metrics-port", "9100"]);
        assert_eq!(args.config, "keeper.toml");
        assert!(args.verbose);
        assert!(!args.json_logs);
        assert_eq!(args.metrics_port, Some(9100));
    }
}

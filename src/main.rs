//! Tesseract Wallet service - pending transaction tracking and RPC status
//!
//! Runs the poller that reconciles submitted transactions and serves the
//! status API and Prometheus metrics.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tesseract_wallet::api;
use tesseract_wallet::chain::EthersConnector;
use tesseract_wallet::config::{FamilyKind, Settings};
use tesseract_wallet::ledger::{Scheduler, TokioScheduler};
use tesseract_wallet::metrics::MetricsServer;
use tesseract_wallet::signer::{self, LocalKeyAdapter};
use tesseract_wallet::state;
use tesseract_wallet::WalletServices;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Tesseract Wallet v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let store = state::open_store(&settings.storage).await?;
    info!("Storage backend {:?} ready", settings.storage.backend);

    let scheduler = Arc::new(TokioScheduler::default());
    let services = WalletServices::new(
        &settings,
        store,
        Arc::new(EthersConnector),
        scheduler.clone(),
    );
    services.start().await?;

    report_signers(&settings);

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = services.api_state();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Health check loop
    let health_handle = tokio::spawn({
        let connections = services.connections.clone();
        let interval = settings.wallet.poll_interval();
        async move {
            loop {
                tokio::time::sleep(interval).await;
                for chain_key in connections.chain_keys() {
                    if !connections.health_check(&chain_key).await {
                        warn!("Chain {} health check failed", chain_key);
                    }
                }
            }
        }
    });

    info!("Tesseract Wallet is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    scheduler.disarm();
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Tesseract Wallet stopped");
    Ok(())
}

/// Log the configured signing account per EVM chain
fn report_signers(settings: &Settings) {
    if settings.signer.private_key_env.is_none() && settings.signer.mnemonic_env.is_none() {
        info!("No signer configured, running in watch-only mode");
        return;
    }

    for (key, chain) in settings.enabled_chains() {
        let Some(chain_id) = chain.chain_id.filter(|_| chain.family == FamilyKind::Evm) else {
            continue;
        };
        match LocalKeyAdapter::from_config(&settings.signer, chain_id) {
            Ok(adapter) => signer::describe(&adapter),
            Err(e) => warn!("Signer unavailable for {}: {}", key, e),
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,tesseract_wallet=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
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
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! Flowerinbox relay server.
//!
//! Loads the accounts file, registers one cron job per enabled webhook
//! pattern, and serves the on-demand run endpoints until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flowerinbox::util::user_agent::USER_AGENT;
use flowerinbox::web::{router, AppState};
use flowerinbox::{
    AccountProvider, AccountStore, Config, CronScheduler, ImapClientFactory, MailboxSynchronizer,
    WebhookDispatcher,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("relay_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        accounts_file = %config.accounts_file.display(),
        webhook_timeout_ms = config.webhook_timeout_ms,
        webhook_max_attempts = config.webhook_max_attempts,
        cron_enabled = config.cron_enabled,
        "config_loaded"
    );

    let store = Arc::new(AccountStore::new(
        config.accounts_file.clone(),
        config.accounts_cache_ttl(),
    ));
    let accounts = store
        .accounts()
        .await
        .with_context(|| format!("Failed to load {}", config.accounts_file.display()))?;
    info!(accounts = accounts.accounts.len(), "accounts_loaded");

    let client = Client::builder()
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(100)
        .build()
        .context("Failed to create HTTP client")?;

    let dispatcher = WebhookDispatcher::new(client, config.webhook_timeout(), config.retry_policy());
    let factory = Arc::new(ImapClientFactory::new(config.imap_timeout()));
    let synchronizer = Arc::new(MailboxSynchronizer::new(factory, dispatcher));
    let scheduler = Arc::new(CronScheduler::new(store, synchronizer));

    if config.cron_enabled {
        let registered = scheduler.initialize(&accounts.accounts);
        info!(jobs = registered, "cron_initialized");
    } else {
        warn!("cron_disabled");
    }

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(config, Arc::clone(&scheduler)));

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    scheduler.shutdown();

    info!("relay_shutdown_complete");

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c_handler_failed");
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
                warn!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}

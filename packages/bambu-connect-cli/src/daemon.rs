//! Background daemon mode for continuous fleet reconciliation
//!
//! This module implements a background service that:
//! - Periodically reconciles the cloud device list with LAN discovery
//! - Keeps the cloud session refreshed (and re-logs in when allowed)
//! - Saves the session and device snapshot after every cycle
//! - Handles graceful shutdown via SIGTERM/SIGINT

use crate::{save_snapshot, ENV_ACCOUNT, ENV_PASSWORD};
use anyhow::{Context, Result};
use bambu_connect_core::{
    config, ConfigStore, CredentialState, FileConfigStore, Fleet, FleetError, LoginCredentials,
};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run the background reconciliation daemon
pub async fn run_daemon(interval_secs: Option<u64>) -> Result<()> {
    let mut settings = config::load_settings();
    if let Some(secs) = interval_secs.filter(|s| *s > 0) {
        settings.poll_interval = Duration::from_secs(secs);
    }

    let store = FileConfigStore::default_location()?;
    let snapshot = store.load_config().context("Failed to load saved state")?;
    let fleet = Fleet::from_config(&snapshot, &settings)?;

    // Unattended re-login, only when the operator opted in through the environment
    if let (Ok(account), Ok(password)) = (std::env::var(ENV_ACCOUNT), std::env::var(ENV_PASSWORD)) {
        if !account.is_empty() && !password.is_empty() {
            tracing::info!("Automatic re-login enabled for {}", account);
            fleet
                .set_login_credentials(Some(LoginCredentials::new(account, password)))
                .await;
        }
    }

    if fleet.credential_state().await == CredentialState::Unauthenticated {
        tracing::warn!(
            "Not logged in; only LAN discovery will run. Use 'bambu-connect login' to add the cloud."
        );
    }

    tracing::info!(
        "Starting daemon: reconciling every {}s against {}",
        settings.poll_interval.as_secs(),
        settings.api_url
    );

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    fleet
        .run(shutdown, |report| {
            let fleet = fleet.clone();
            let store = store.clone();
            async move {
                if let Err(FleetError::ReauthenticationRequired) = &report.cloud {
                    tracing::warn!("Cloud session lost. Run 'bambu-connect login' to reconnect.");
                }
                if let Err(e) = save_snapshot(&store, &fleet).await {
                    tracing::error!("Failed to persist state: {:#}", e);
                }
            }
        })
        .await;

    tracing::info!("Daemon stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT
fn setup_signal_handlers(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let shutdown_term = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM");
                    shutdown_term.cancel();
                }
                Err(e) => tracing::warn!("Failed to register SIGTERM handler: {}", e),
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received Ctrl+C, shutting down");
                shutdown.cancel();
            }
            Err(e) => tracing::warn!("Failed to register Ctrl+C handler: {}", e),
        }
    });
}

//! The fleet façade exposed to hosts (CLI, daemon, GUI shells).

use crate::auth::{Credential, CredentialManager, CredentialState, LoginCredentials};
use crate::cloud::{BambuCloudClient, CloudAuth, CloudDevices};
use crate::config::FleetSettings;
use crate::discovery::{LocalDiscovery, SsdpDiscovery};
use crate::error::FleetResult;
use crate::persistence::{BambuInfo, Config};
use crate::reconciler::{CycleReport, Reconciler, ReconcilerOptions};
use crate::registry::{Device, DeviceRegistry};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Session, registry and reconciliation for one Bambu account.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Fleet {
    credentials: CredentialManager,
    registry: Arc<DeviceRegistry>,
    reconciler: Arc<Reconciler>,
    first_run: Arc<AtomicBool>,
}

impl Fleet {
    /// Build a fleet with the production collaborators: the reqwest cloud
    /// client and SSDP discovery.
    pub fn from_config(config: &Config, settings: &FleetSettings) -> anyhow::Result<Self> {
        let mut client = BambuCloudClient::new(settings.api_url.clone(), settings.request_timeout)?;
        if let Some(login_url) = &settings.login_url {
            client = client.with_login_url(login_url.clone());
        }
        let client = Arc::new(client);
        let discovery = Arc::new(SsdpDiscovery::new(
            settings.discovery_ports.clone(),
            settings.discovery_window,
        ));

        tracing::debug!(
            "Using Bambu API at {} ({})",
            settings.api_url,
            settings.source
        );

        Ok(Self::with_collaborators(
            config,
            settings,
            client.clone(),
            client,
            discovery,
        ))
    }

    pub fn with_collaborators(
        config: &Config,
        settings: &FleetSettings,
        auth: Arc<dyn CloudAuth>,
        cloud: Arc<dyn CloudDevices>,
        discovery: Arc<dyn LocalDiscovery>,
    ) -> Self {
        let credentials =
            CredentialManager::new(auth, settings.refresh_policy(), config.credential());
        let registry = Arc::new(DeviceRegistry::new(config.bambu_devices.clone()));

        let options = ReconcilerOptions {
            poll_interval: settings.poll_interval,
            request_timeout: settings.request_timeout,
            discovery_timeout: settings.discovery_window + settings.request_timeout,
            prune_after_cycles: settings.prune_after_cycles,
        };
        let reconciler = Arc::new(Reconciler::new(
            credentials.clone(),
            cloud,
            discovery,
            registry.clone(),
            options,
        ));

        Self {
            credentials,
            registry,
            reconciler,
            first_run: Arc::new(AtomicBool::new(config.is_first_run)),
        }
    }

    /// An access token valid for at least the refresh margin.
    pub async fn get_valid_access_token(&self) -> FleetResult<String> {
        self.credentials.ensure_valid_token().await
    }

    pub async fn get_device(&self, dev_id: &str) -> FleetResult<Device> {
        self.registry.get_device(dev_id).await
    }

    pub async fn list_devices(&self) -> Vec<Device> {
        self.registry.list_devices().await
    }

    /// Refresh the session now, then run a reconciliation cycle. The cycle
    /// runs even when the refresh fails, so LAN devices stay current.
    pub async fn force_refresh(&self) -> (FleetResult<()>, CycleReport) {
        let refreshed = self.credentials.force_refresh().await.map(|_| ());
        if let Err(e) = &refreshed {
            tracing::warn!("Forced refresh failed: {}", e);
        }
        (refreshed, self.reconciler.run_cycle().await)
    }

    /// Log in and remember the account for automatic re-login.
    pub async fn login(&self, credentials: LoginCredentials) -> FleetResult<Credential> {
        let credential = self.credentials.login(credentials).await?;
        self.first_run.store(false, Ordering::Relaxed);
        Ok(credential)
    }

    /// Allow automatic re-login once the refresh token has lapsed.
    pub async fn set_login_credentials(&self, credentials: Option<LoginCredentials>) {
        self.credentials.set_login_credentials(credentials).await;
    }

    /// Forget the session and every device learned through it.
    pub async fn logout(&self) {
        self.credentials.logout().await;
        self.registry.restore(Vec::new()).await;
    }

    pub async fn credential_state(&self) -> CredentialState {
        self.credentials.state().await
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.credentials.credential().await
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.reconciler.run_cycle().await
    }

    /// Reconcile every poll interval until `shutdown` is cancelled.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, on_cycle: F)
    where
        F: FnMut(CycleReport) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.reconciler.run(shutdown, on_cycle).await
    }

    /// Current state in the persisted layout.
    pub async fn snapshot_config(&self) -> Config {
        let credential = self.credentials.credential().await;
        Config {
            is_first_run: self.first_run.load(Ordering::Relaxed) && credential.is_none(),
            bambu_info: credential
                .as_ref()
                .map(BambuInfo::from_credential)
                .unwrap_or_default(),
            bambu_devices: self.registry.list_devices().await,
        }
    }

    /// Receive the canonical device list after every cycle.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Device>> {
        self.registry.subscribe()
    }
}

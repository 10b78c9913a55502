//! Periodic reconciliation of cloud and LAN device lists.
//!
//! One cycle fetches the account's device list (through the credential
//! manager) and runs a local discovery pass concurrently, folds both into the
//! registry and publishes the result. Either source may fail without
//! affecting the other.

use crate::auth::CredentialManager;
use crate::cloud::CloudDevices;
use crate::discovery::LocalDiscovery;
use crate::error::{FleetError, FleetResult};
use crate::registry::{CloudDeviceReport, Device, DeviceRegistry, LocalDeviceReport};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ReconcilerOptions {
    pub poll_interval: Duration,
    /// Bound on the device list request.
    pub request_timeout: Duration,
    /// Bound on a whole discovery pass.
    pub discovery_timeout: Duration,
    /// Cloud syncs a device may be missing from before it is dropped.
    pub prune_after_cycles: u32,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(15),
            prune_after_cycles: 3,
        }
    }
}

/// What one cycle did, per source.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    /// Number of devices the cloud listed, or why the fetch failed.
    pub cloud: FleetResult<usize>,
    /// Number of devices heard on the LAN, or why discovery failed.
    pub local: FleetResult<usize>,
    /// Devices dropped for being absent from the cloud too long.
    pub pruned: Vec<String>,
    /// The published canonical list.
    pub devices: Vec<Device>,
}

impl CycleReport {
    pub fn is_fully_successful(&self) -> bool {
        self.cloud.is_ok() && self.local.is_ok()
    }
}

pub struct Reconciler {
    credentials: CredentialManager,
    cloud: Arc<dyn CloudDevices>,
    discovery: Arc<dyn LocalDiscovery>,
    registry: Arc<DeviceRegistry>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        credentials: CredentialManager,
        cloud: Arc<dyn CloudDevices>,
        discovery: Arc<dyn LocalDiscovery>,
        registry: Arc<DeviceRegistry>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            credentials,
            cloud,
            discovery,
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Run one reconciliation cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        let started_at = Utc::now();
        self.registry.begin_cycle().await;

        let (cloud, local) = futures::join!(self.fetch_cloud(), self.discover_local());

        // Local first, so cloud live fields only land on devices the LAN
        // did not confirm this cycle.
        let local_count = match local {
            Ok(reports) => {
                let count = reports.len();
                self.registry.merge_local(reports).await;
                Ok(count)
            }
            Err(e) => {
                tracing::warn!("Local discovery failed: {}", e);
                Err(e)
            }
        };

        let mut pruned = Vec::new();
        let cloud_count = match cloud {
            Ok(reports) => {
                let count = reports.len();
                let present: HashSet<String> = reports.iter().map(|r| r.dev_id.clone()).collect();
                self.registry.merge_cloud(reports).await;
                pruned = self
                    .registry
                    .finish_cloud_sync(&present, self.options.prune_after_cycles)
                    .await;
                Ok(count)
            }
            Err(e) => {
                tracing::warn!("Cloud device sync failed: {}", e);
                Err(e)
            }
        };

        let devices = self.registry.publish().await;

        tracing::info!(
            "Reconciliation cycle complete: {} devices (cloud: {}, local: {})",
            devices.len(),
            describe(&cloud_count),
            describe(&local_count)
        );

        CycleReport {
            started_at,
            cloud: cloud_count,
            local: local_count,
            pruned,
            devices,
        }
    }

    /// Drive cycles every `poll_interval` until `shutdown` is cancelled.
    /// The first cycle runs immediately; a cycle in progress always finishes.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, mut on_cycle: F)
    where
        F: FnMut(CycleReport) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = interval(self.options.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, stopping reconciler");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let report = self.run_cycle().await;
            on_cycle(report).await;
        }
    }

    async fn fetch_cloud(&self) -> FleetResult<Vec<CloudDeviceReport>> {
        let token = self.credentials.ensure_valid_token().await?;

        match self.fetch_with_token(&token).await {
            // The server dropped a token we still considered valid: refresh once.
            Err(FleetError::AuthRejected(reason)) => {
                tracing::info!("Device list rejected the access token ({}), refreshing", reason);
                let token = self.credentials.force_refresh().await?;
                self.fetch_with_token(&token).await
            }
            other => other,
        }
    }

    async fn fetch_with_token(&self, token: &str) -> FleetResult<Vec<CloudDeviceReport>> {
        match tokio::time::timeout(
            self.options.request_timeout,
            self.cloud.fetch_cloud_devices(token),
        )
        .await
        {
            Ok(result) => result.map_err(FleetError::from),
            Err(_) => Err(FleetError::Transient(format!(
                "device list request timed out after {:?}",
                self.options.request_timeout
            ))),
        }
    }

    async fn discover_local(&self) -> FleetResult<Vec<LocalDeviceReport>> {
        match tokio::time::timeout(
            self.options.discovery_timeout,
            self.discovery.discover_local_devices(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FleetError::DiscoveryUnavailable(format!(
                "discovery timed out after {:?}",
                self.options.discovery_timeout
            ))),
        }
    }
}

fn describe(outcome: &FleetResult<usize>) -> String {
    match outcome {
        Ok(count) => count.to_string(),
        Err(e) => format!("failed ({})", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, LoginCredentials, RefreshPolicy, TokenGrant};
    use crate::cloud::CloudAuth;
    use crate::error::CloudError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StaticAuth {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl CloudAuth for StaticAuth {
        async fn login(&self, _credentials: &LoginCredentials) -> Result<TokenGrant, CloudError> {
            Err(CloudError::Rejected("no login in tests".to_string()))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, CloudError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            Ok(TokenGrant {
                access_token: "refreshed".to_string(),
                access_token_expires_at: now + chrono::Duration::hours(2),
                refresh_token: "refresh-2".to_string(),
                refresh_token_expires_at: now + chrono::Duration::days(30),
            })
        }
    }

    struct FakeCloud {
        results: Mutex<Vec<Result<Vec<CloudDeviceReport>, CloudError>>>,
        tokens: Mutex<Vec<String>>,
    }

    impl FakeCloud {
        fn new(results: Vec<Result<Vec<CloudDeviceReport>, CloudError>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                tokens: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CloudDevices for FakeCloud {
        async fn fetch_cloud_devices(
            &self,
            access_token: &str,
        ) -> Result<Vec<CloudDeviceReport>, CloudError> {
            self.tokens.lock().unwrap().push(access_token.to_string());
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(Vec::new())
            } else {
                results.remove(0)
            }
        }
    }

    struct FakeDiscovery {
        results: Mutex<Vec<FleetResult<Vec<LocalDeviceReport>>>>,
    }

    impl FakeDiscovery {
        fn new(results: Vec<FleetResult<Vec<LocalDeviceReport>>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
            })
        }
    }

    #[async_trait]
    impl LocalDiscovery for FakeDiscovery {
        async fn discover_local_devices(&self) -> FleetResult<Vec<LocalDeviceReport>> {
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(Vec::new())
            } else {
                results.remove(0)
            }
        }
    }

    fn credentials(auth: Arc<StaticAuth>, access: &str) -> CredentialManager {
        let now = Utc::now();
        let credential = Credential {
            access_token: access.to_string(),
            access_token_expires_at: now + chrono::Duration::hours(2),
            refresh_token: "refresh-1".to_string(),
            refresh_token_expires_at: now + chrono::Duration::days(30),
            last_refreshed_at: now,
        };
        let policy = RefreshPolicy {
            retry_base_delay: Duration::from_millis(1),
            ..RefreshPolicy::default()
        };
        CredentialManager::new(auth, policy, Some(credential))
    }

    fn static_auth() -> Arc<StaticAuth> {
        Arc::new(StaticAuth {
            refreshes: AtomicUsize::new(0),
        })
    }

    fn x1_cloud() -> CloudDeviceReport {
        CloudDeviceReport {
            dev_id: "X1".to_string(),
            name: "Workshop X1C".to_string(),
            online: false,
            ip: None,
            print_status: "IDLE".to_string(),
            dev_model_name: "BL-P001".to_string(),
            dev_product_name: "X1 Carbon".to_string(),
            dev_access_code: "12345678".to_string(),
            nozzle_diameter: 0.4,
        }
    }

    fn x1_local(ip: &str) -> LocalDeviceReport {
        LocalDeviceReport {
            dev_id: "X1".to_string(),
            ip: ip.to_string(),
            online: true,
            print_status: None,
            name: Some("X1C".to_string()),
            dev_model_name: Some("BL-P001".to_string()),
            dev_product_name: None,
            seen_at: Utc::now(),
        }
    }

    fn reconciler(
        auth: Arc<StaticAuth>,
        cloud: Arc<FakeCloud>,
        discovery: Arc<FakeDiscovery>,
        registry: Arc<DeviceRegistry>,
    ) -> Reconciler {
        Reconciler::new(
            credentials(auth, "access-1"),
            cloud,
            discovery,
            registry,
            ReconcilerOptions {
                poll_interval: Duration::from_millis(20),
                request_timeout: Duration::from_millis(200),
                discovery_timeout: Duration::from_millis(200),
                prune_after_cycles: 3,
            },
        )
    }

    #[tokio::test]
    async fn test_cycle_merges_both_sources() {
        let cloud = FakeCloud::new(vec![Ok(vec![x1_cloud()])]);
        let discovery = FakeDiscovery::new(vec![Ok(vec![x1_local("192.168.1.5")])]);
        let registry = Arc::new(DeviceRegistry::default());
        let reconciler = reconciler(static_auth(), cloud.clone(), discovery, registry.clone());

        let report = reconciler.run_cycle().await;
        assert!(report.is_fully_successful());
        assert_eq!(report.cloud, Ok(1));
        assert_eq!(report.local, Ok(1));

        let x1 = registry.get_device("X1").await.unwrap();
        assert_eq!(x1.name, "Workshop X1C");
        assert_eq!(x1.ip.as_deref(), Some("192.168.1.5"));
        assert!(x1.online);
        assert_eq!(x1.dev_access_code.as_deref(), Some("12345678"));
        assert_eq!(*cloud.tokens.lock().unwrap(), vec!["access-1".to_string()]);
    }

    #[tokio::test]
    async fn test_cloud_failure_keeps_discovered_device() {
        let registry = Arc::new(DeviceRegistry::default());
        registry.merge_cloud(vec![x1_cloud()]).await;

        let cloud = FakeCloud::new(vec![Err(CloudError::Transient("503".to_string()))]);
        let discovery = FakeDiscovery::new(vec![Ok(vec![x1_local("192.168.1.5")])]);
        let reconciler = reconciler(static_auth(), cloud, discovery, registry.clone());

        let report = reconciler.run_cycle().await;
        assert!(matches!(report.cloud, Err(FleetError::Transient(_))));
        assert_eq!(report.local, Ok(1));

        let x1 = registry.get_device("X1").await.unwrap();
        assert_eq!(x1.ip.as_deref(), Some("192.168.1.5"));
        assert!(x1.online);
        assert_eq!(x1.dev_access_code.as_deref(), Some("12345678"));
        assert_eq!(report.devices, vec![x1]);
    }

    #[tokio::test]
    async fn test_cloud_failure_with_unknown_device_has_no_access_code() {
        let cloud = FakeCloud::new(vec![Err(CloudError::Transient("offline".to_string()))]);
        let discovery = FakeDiscovery::new(vec![Ok(vec![x1_local("192.168.1.5")])]);
        let registry = Arc::new(DeviceRegistry::default());
        let reconciler = reconciler(static_auth(), cloud, discovery, registry.clone());

        reconciler.run_cycle().await;
        let x1 = registry.get_device("X1").await.unwrap();
        assert_eq!(x1.ip.as_deref(), Some("192.168.1.5"));
        assert_eq!(x1.dev_access_code, None);
    }

    #[tokio::test]
    async fn test_discovery_failure_still_merges_cloud() {
        let cloud = FakeCloud::new(vec![Ok(vec![x1_cloud()])]);
        let discovery = FakeDiscovery::new(vec![Err(FleetError::DiscoveryUnavailable(
            "no interface".to_string(),
        ))]);
        let registry = Arc::new(DeviceRegistry::default());
        let reconciler = reconciler(static_auth(), cloud, discovery, registry.clone());

        let report = reconciler.run_cycle().await;
        assert!(report.cloud.is_ok());
        assert!(matches!(report.local, Err(FleetError::DiscoveryUnavailable(_))));
        assert!(registry.get_device("X1").await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_device_list_refreshes_once() {
        let auth = static_auth();
        let cloud = FakeCloud::new(vec![
            Err(CloudError::Rejected("401".to_string())),
            Ok(vec![x1_cloud()]),
        ]);
        let discovery = FakeDiscovery::new(Vec::new());
        let registry = Arc::new(DeviceRegistry::default());
        let reconciler = reconciler(auth.clone(), cloud.clone(), discovery, registry);

        let report = reconciler.run_cycle().await;
        assert_eq!(report.cloud, Ok(1));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(
            *cloud.tokens.lock().unwrap(),
            vec!["access-1".to_string(), "refreshed".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_cloud_device_is_pruned_after_threshold() {
        let cloud = FakeCloud::new(vec![
            Ok(vec![x1_cloud()]),
            Ok(Vec::new()),
            Ok(Vec::new()),
            Ok(Vec::new()),
        ]);
        let discovery = FakeDiscovery::new(Vec::new());
        let registry = Arc::new(DeviceRegistry::default());
        let reconciler = reconciler(static_auth(), cloud, discovery, registry.clone());

        reconciler.run_cycle().await;
        reconciler.run_cycle().await;
        reconciler.run_cycle().await;
        assert_eq!(registry.get_device("X1").await.unwrap().cloud_missed_cycles, 2);

        let report = reconciler.run_cycle().await;
        assert_eq!(report.pruned, vec!["X1".to_string()]);
        assert!(registry.get_device("X1").await.is_err());
    }

    #[tokio::test]
    async fn test_failed_cloud_sync_does_not_count_as_miss() {
        let cloud = FakeCloud::new(vec![
            Ok(vec![x1_cloud()]),
            Err(CloudError::Transient("timeout".to_string())),
        ]);
        let discovery = FakeDiscovery::new(Vec::new());
        let registry = Arc::new(DeviceRegistry::default());
        let reconciler = reconciler(static_auth(), cloud, discovery, registry.clone());

        reconciler.run_cycle().await;
        reconciler.run_cycle().await;
        assert_eq!(registry.get_device("X1").await.unwrap().cloud_missed_cycles, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cloud = FakeCloud::new(Vec::new());
        let discovery = FakeDiscovery::new(Vec::new());
        let registry = Arc::new(DeviceRegistry::default());
        let reconciler = Arc::new(reconciler(static_auth(), cloud, discovery, registry));

        let shutdown = CancellationToken::new();
        let cycles = Arc::new(AtomicUsize::new(0));

        let handle = {
            let reconciler = reconciler.clone();
            let shutdown = shutdown.clone();
            let cycles = cycles.clone();
            tokio::spawn(async move {
                reconciler
                    .run(shutdown, move |_| {
                        cycles.fetch_add(1, Ordering::SeqCst);
                        async {}
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(70)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let ran = cycles.load(Ordering::SeqCst);
        assert!(ran >= 2, "expected several cycles, got {}", ran);
    }
}

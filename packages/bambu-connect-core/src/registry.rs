//! Canonical printer registry.
//!
//! Folds cloud and local-discovery reports into one record per `dev_id`.
//! Cloud owns identity and secrets (name, model, access code, nozzle).
//! Local discovery owns the live fields (ip, online) for every device it has
//! ever reported, and print status for the cycle in which it confirmed the
//! device. Cloud values fill in whatever the LAN has not told us.

use crate::error::{FleetError, FleetResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::{watch, RwLock};

/// One printer, reconciled from every source that has reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub dev_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dev_model_name: String,
    #[serde(default)]
    pub dev_product_name: String,
    /// LAN access code. Only ever populated from the cloud list.
    /// Stored as `""` when unknown, like the cloud reports it.
    #[serde(
        default,
        deserialize_with = "empty_string_as_none",
        serialize_with = "none_as_empty_string"
    )]
    pub dev_access_code: Option<String>,
    /// Stored as `0` when unknown.
    #[serde(
        default,
        deserialize_with = "zero_as_none",
        serialize_with = "none_as_zero"
    )]
    pub nozzle_diameter: Option<f64>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub print_status: String,
    /// Local discovery reported this device in the current cycle.
    #[serde(default)]
    pub confirmed_locally: bool,
    #[serde(default)]
    pub last_seen_locally: Option<DateTime<Utc>>,
    /// The cloud list has included this device at least once.
    #[serde(default)]
    pub seen_in_cloud: bool,
    /// Consecutive successful cloud syncs that did not list this device.
    #[serde(default)]
    pub cloud_missed_cycles: u32,
}

impl Device {
    fn empty(dev_id: &str) -> Self {
        Self {
            dev_id: dev_id.to_string(),
            name: String::new(),
            dev_model_name: String::new(),
            dev_product_name: String::new(),
            dev_access_code: None,
            nozzle_diameter: None,
            online: false,
            ip: None,
            print_status: String::new(),
            confirmed_locally: false,
            last_seen_locally: None,
            seen_in_cloud: false,
            cloud_missed_cycles: 0,
        }
    }

    /// Whether the printer can be driven over the LAN right now.
    pub fn locally_controllable(&self) -> bool {
        self.ip.is_some() && self.dev_access_code.is_some()
    }
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

fn none_as_empty_string<S>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(value.as_deref().unwrap_or_default())
}

fn zero_as_none<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<f64> = Option::deserialize(deserializer)?;
    Ok(value.filter(|d| *d > 0.0))
}

fn none_as_zero<S>(value: &Option<f64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(value.unwrap_or(0.0))
}

/// A device as listed by the cloud account (`/v1/iot-service/api/user/bind`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudDeviceReport {
    pub dev_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub print_status: String,
    #[serde(default)]
    pub dev_model_name: String,
    #[serde(default)]
    pub dev_product_name: String,
    #[serde(default)]
    pub dev_access_code: String,
    #[serde(default)]
    pub nozzle_diameter: f64,
}

/// A device heard on the LAN.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalDeviceReport {
    pub dev_id: String,
    pub ip: String,
    pub online: bool,
    pub print_status: Option<String>,
    pub name: Option<String>,
    pub dev_model_name: Option<String>,
    pub dev_product_name: Option<String>,
    pub seen_at: DateTime<Utc>,
}

/// A report from one of the two sources.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceReport {
    Cloud(CloudDeviceReport),
    Local(LocalDeviceReport),
}

impl DeviceReport {
    pub fn dev_id(&self) -> &str {
        match self {
            DeviceReport::Cloud(r) => &r.dev_id,
            DeviceReport::Local(r) => &r.dev_id,
        }
    }
}

impl From<CloudDeviceReport> for DeviceReport {
    fn from(r: CloudDeviceReport) -> Self {
        DeviceReport::Cloud(r)
    }
}

impl From<LocalDeviceReport> for DeviceReport {
    fn from(r: LocalDeviceReport) -> Self {
        DeviceReport::Local(r)
    }
}

/// The device map itself, without locking. Keeps insertion order.
#[derive(Debug, Clone, Default)]
pub struct DeviceMap {
    devices: HashMap<String, Device>,
    order: Vec<String>,
}

impl DeviceMap {
    pub fn from_devices(devices: Vec<Device>) -> Self {
        let mut map = Self::default();
        for device in devices {
            if device.dev_id.is_empty() {
                continue;
            }
            if !map.devices.contains_key(&device.dev_id) {
                map.order.push(device.dev_id.clone());
            }
            map.devices.insert(device.dev_id.clone(), device);
        }
        map
    }

    /// Fold one report into the map. Returns true if the device was new.
    pub fn apply(&mut self, report: &DeviceReport) -> bool {
        let dev_id = report.dev_id();
        if dev_id.is_empty() {
            tracing::debug!("Ignoring device report without dev_id");
            return false;
        }

        let created = !self.devices.contains_key(dev_id);
        if created {
            self.order.push(dev_id.to_string());
        }
        let device = self
            .devices
            .entry(dev_id.to_string())
            .or_insert_with(|| Device::empty(dev_id));

        match report {
            DeviceReport::Cloud(r) => apply_cloud(device, r),
            DeviceReport::Local(r) => apply_local(device, r, created),
        }
        created
    }

    pub fn merge<'a, I>(&mut self, reports: I) -> Vec<Device>
    where
        I: IntoIterator<Item = &'a DeviceReport>,
    {
        for report in reports {
            if self.apply(report) {
                tracing::info!("New device registered: {}", report.dev_id());
            }
        }
        self.list()
    }

    /// Start a new reconciliation cycle: nothing is locally confirmed yet.
    pub fn begin_cycle(&mut self) {
        for device in self.devices.values_mut() {
            device.confirmed_locally = false;
        }
    }

    /// Account for a successful cloud sync that listed exactly `present`.
    pub fn record_cloud_sync(&mut self, present: &HashSet<String>) {
        for device in self.devices.values_mut() {
            if present.contains(&device.dev_id) {
                device.cloud_missed_cycles = 0;
            } else if device.seen_in_cloud {
                device.cloud_missed_cycles = device.cloud_missed_cycles.saturating_add(1);
            }
        }
    }

    /// Drop devices the cloud has not listed for `threshold` consecutive syncs.
    /// A threshold of 0 disables pruning.
    pub fn prune_absent(&mut self, threshold: u32) -> Vec<String> {
        if threshold == 0 {
            return Vec::new();
        }
        let removed: Vec<String> = self
            .order
            .iter()
            .filter(|id| {
                self.devices
                    .get(*id)
                    .is_some_and(|d| d.seen_in_cloud && d.cloud_missed_cycles >= threshold)
            })
            .cloned()
            .collect();

        for id in &removed {
            self.devices.remove(id);
        }
        self.order.retain(|id| !removed.contains(id));
        removed
    }

    pub fn get(&self, dev_id: &str) -> Option<&Device> {
        self.devices.get(dev_id)
    }

    /// All devices in the order they were first reported.
    pub fn list(&self) -> Vec<Device> {
        self.order
            .iter()
            .filter_map(|id| self.devices.get(id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn apply_cloud(device: &mut Device, report: &CloudDeviceReport) {
    device.name = report.name.clone();
    device.dev_model_name = report.dev_model_name.clone();
    device.dev_product_name = report.dev_product_name.clone();
    if !report.dev_access_code.is_empty() {
        device.dev_access_code = Some(report.dev_access_code.clone());
    }
    if report.nozzle_diameter > 0.0 {
        device.nozzle_diameter = Some(report.nozzle_diameter);
    }
    device.seen_in_cloud = true;

    // Once the LAN has reported a device it owns ip/online; a missed probe
    // keeps the last values instead of taking the cloud's.
    if device.last_seen_locally.is_none() {
        device.online = report.online;
        if let Some(ip) = &report.ip {
            device.ip = Some(ip.clone());
        }
    }
    if !device.confirmed_locally {
        device.print_status = report.print_status.clone();
    }
}

fn apply_local(device: &mut Device, report: &LocalDeviceReport, created: bool) {
    device.ip = Some(report.ip.clone());
    device.online = report.online;
    if let Some(status) = &report.print_status {
        device.print_status = status.clone();
    }
    device.confirmed_locally = true;
    device.last_seen_locally = Some(report.seen_at);

    // Identity fields from the LAN only seed a record the cloud has never described.
    if created || !device.seen_in_cloud {
        if let Some(name) = &report.name {
            device.name = name.clone();
        }
        if let Some(model) = &report.dev_model_name {
            device.dev_model_name = model.clone();
        }
        if let Some(product) = &report.dev_product_name {
            device.dev_product_name = product.clone();
        }
    }
}

/// Shared, lock-guarded registry that publishes the canonical list.
pub struct DeviceRegistry {
    map: RwLock<DeviceMap>,
    published: watch::Sender<Vec<Device>>,
}

impl DeviceRegistry {
    pub fn new(initial: Vec<Device>) -> Self {
        let map = DeviceMap::from_devices(initial);
        let (published, _) = watch::channel(map.list());
        Self {
            map: RwLock::new(map),
            published,
        }
    }

    /// Replace the registry contents with a persisted snapshot and publish it.
    pub async fn restore(&self, devices: Vec<Device>) {
        let mut map = self.map.write().await;
        *map = DeviceMap::from_devices(devices);
        self.published.send_replace(map.list());
    }

    /// Fold reports into the registry and return the updated canonical list.
    pub async fn merge<I>(&self, reports: I) -> Vec<Device>
    where
        I: IntoIterator<Item = DeviceReport>,
    {
        let reports: Vec<DeviceReport> = reports.into_iter().collect();
        let mut map = self.map.write().await;
        map.merge(reports.iter())
    }

    pub async fn merge_cloud(&self, reports: Vec<CloudDeviceReport>) -> Vec<Device> {
        self.merge(reports.into_iter().map(DeviceReport::Cloud)).await
    }

    pub async fn merge_local(&self, reports: Vec<LocalDeviceReport>) -> Vec<Device> {
        self.merge(reports.into_iter().map(DeviceReport::Local)).await
    }

    pub async fn begin_cycle(&self) {
        self.map.write().await.begin_cycle();
    }

    /// Record a successful cloud sync and prune devices missing for
    /// `prune_threshold` consecutive syncs. Returns the pruned ids.
    pub async fn finish_cloud_sync(
        &self,
        present: &HashSet<String>,
        prune_threshold: u32,
    ) -> Vec<String> {
        let mut map = self.map.write().await;
        map.record_cloud_sync(present);
        let removed = map.prune_absent(prune_threshold);
        for id in &removed {
            tracing::info!(
                "Removed device {} (absent from cloud for {} syncs)",
                id,
                prune_threshold
            );
        }
        removed
    }

    pub async fn get_device(&self, dev_id: &str) -> FleetResult<Device> {
        self.map
            .read()
            .await
            .get(dev_id)
            .cloned()
            .ok_or_else(|| FleetError::DeviceNotFound(dev_id.to_string()))
    }

    pub async fn list_devices(&self) -> Vec<Device> {
        self.map.read().await.list()
    }

    /// Push the current list to subscribers and return it.
    pub async fn publish(&self) -> Vec<Device> {
        let devices = self.list_devices().await;
        self.published.send_replace(devices.clone());
        devices
    }

    /// Receive the canonical list each time a cycle publishes it.
    pub fn subscribe(&self) -> watch::Receiver<Vec<Device>> {
        self.published.subscribe()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cloud(dev_id: &str, nozzle: f64) -> CloudDeviceReport {
        CloudDeviceReport {
            dev_id: dev_id.to_string(),
            name: "Workshop P1S".to_string(),
            online: false,
            ip: None,
            print_status: "IDLE".to_string(),
            dev_model_name: "C12".to_string(),
            dev_product_name: "P1S".to_string(),
            dev_access_code: "12345678".to_string(),
            nozzle_diameter: nozzle,
        }
    }

    fn local(dev_id: &str, ip: &str) -> LocalDeviceReport {
        LocalDeviceReport {
            dev_id: dev_id.to_string(),
            ip: ip.to_string(),
            online: true,
            print_status: None,
            name: Some("lan-name".to_string()),
            dev_model_name: Some("C12".to_string()),
            dev_product_name: None,
            seen_at: DateTime::from_timestamp(1_760_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_cloud_merge_is_idempotent() {
        let report = DeviceReport::Cloud(cloud("01S00A000000001", 0.4));
        let mut map = DeviceMap::default();

        let once = map.merge([&report]);
        let twice = map.merge([&report]);

        assert_eq!(once, twice);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_local_merge_is_idempotent() {
        let report = DeviceReport::Local(local("X1", "192.168.1.5"));
        let mut map = DeviceMap::default();

        let once = map.merge([&report]);
        let twice = map.merge([&report]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_local_only_device_has_no_access_code() {
        let mut map = DeviceMap::default();
        map.apply(&local("X1", "192.168.1.5").into());

        let device = map.get("X1").unwrap();
        assert_eq!(device.dev_access_code, None);
        assert_eq!(device.ip.as_deref(), Some("192.168.1.5"));
        assert!(device.online);
        assert_eq!(device.name, "lan-name");
        assert!(!device.locally_controllable());
    }

    #[test]
    fn test_local_report_never_overwrites_cloud_fields() {
        let mut map = DeviceMap::default();
        map.apply(&cloud("X1", 0.4).into());
        map.apply(&local("X1", "192.168.1.5").into());

        let device = map.get("X1").unwrap();
        assert_eq!(device.name, "Workshop P1S");
        assert_eq!(device.dev_access_code.as_deref(), Some("12345678"));
        assert_eq!(device.nozzle_diameter, Some(0.4));
        assert_eq!(device.ip.as_deref(), Some("192.168.1.5"));
        assert!(device.online);
        assert!(device.locally_controllable());
    }

    #[test]
    fn test_local_fields_win_within_a_cycle() {
        let mut map = DeviceMap::default();
        map.begin_cycle();
        map.apply(&local("X1", "192.168.1.5").into());
        // Cloud says offline, but the LAN just heard from it.
        map.apply(&cloud("X1", 0.4).into());

        let device = map.get("X1").unwrap();
        assert!(device.online);
        assert_eq!(device.ip.as_deref(), Some("192.168.1.5"));
        assert_eq!(device.dev_access_code.as_deref(), Some("12345678"));
    }

    #[test]
    fn test_missed_discovery_keeps_last_known_ip() {
        let mut map = DeviceMap::default();
        map.begin_cycle();
        map.apply(&cloud("X1", 0.4).into());
        map.apply(&local("X1", "192.168.1.5").into());

        // Next cycle: discovery misses the printer and the cloud calls it offline.
        map.begin_cycle();
        let mut report = cloud("X1", 0.4);
        report.print_status = "RUNNING".to_string();
        map.apply(&report.into());

        let device = map.get("X1").unwrap();
        assert_eq!(device.ip.as_deref(), Some("192.168.1.5"));
        assert!(device.online);
        assert!(!device.confirmed_locally);
        assert_eq!(device.print_status, "RUNNING");
    }

    #[test]
    fn test_cloud_only_device_takes_cloud_live_fields() {
        let mut map = DeviceMap::default();
        let mut report = cloud("X1", 0.4);
        report.online = true;
        report.ip = Some("10.0.0.7".to_string());
        map.apply(&report.into());

        let mut report = cloud("X1", 0.4);
        report.online = false;
        map.apply(&report.into());

        let device = map.get("X1").unwrap();
        assert!(!device.online);
        assert_eq!(device.ip.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_missed_discovery_without_cloud_keeps_online() {
        let mut map = DeviceMap::default();
        map.begin_cycle();
        map.apply(&local("X1", "192.168.1.5").into());
        map.begin_cycle();

        let device = map.get("X1").unwrap();
        assert!(device.online);
        assert_eq!(device.ip.as_deref(), Some("192.168.1.5"));
        assert!(!device.confirmed_locally);
    }

    #[test]
    fn test_later_cloud_report_overwrites_nozzle() {
        let mut map = DeviceMap::default();
        map.begin_cycle();
        map.apply(&cloud("X1", 0.4).into());
        map.begin_cycle();
        map.apply(&cloud("X1", 0.6).into());

        assert_eq!(map.get("X1").unwrap().nozzle_diameter, Some(0.6));
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let mut map = DeviceMap::default();
        map.apply(&cloud("B", 0.4).into());
        map.apply(&local("A", "10.0.0.2").into());
        map.apply(&cloud("C", 0.4).into());
        map.apply(&cloud("A", 0.4).into());

        let ids: Vec<String> = map.list().into_iter().map(|d| d.dev_id).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
    }

    #[test]
    fn test_prune_after_consecutive_misses() {
        let mut map = DeviceMap::default();
        map.apply(&cloud("A", 0.4).into());
        map.apply(&cloud("B", 0.4).into());
        map.apply(&local("LAN", "10.0.0.9").into());

        let only_a: HashSet<String> = ["A".to_string()].into_iter().collect();
        map.record_cloud_sync(&only_a);
        map.record_cloud_sync(&only_a);
        assert!(map.prune_absent(3).is_empty());

        map.record_cloud_sync(&only_a);
        assert_eq!(map.prune_absent(3), vec!["B".to_string()]);
        // Never listed by the cloud, so never pruned by cloud absence.
        assert!(map.get("LAN").is_some());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_reappearing_device_resets_miss_counter() {
        let mut map = DeviceMap::default();
        map.apply(&cloud("A", 0.4).into());
        let empty = HashSet::new();
        map.record_cloud_sync(&empty);
        map.record_cloud_sync(&empty);

        let present: HashSet<String> = ["A".to_string()].into_iter().collect();
        map.record_cloud_sync(&present);
        map.record_cloud_sync(&empty);
        assert!(map.prune_absent(3).is_empty());
        assert_eq!(map.get("A").unwrap().cloud_missed_cycles, 1);
        assert!(map.prune_absent(0).is_empty());
    }

    #[test]
    fn test_empty_dev_id_is_ignored() {
        let mut map = DeviceMap::default();
        assert!(!map.apply(&cloud("", 0.4).into()));
        assert!(map.is_empty());
    }

    #[test]
    fn test_persisted_device_with_empty_access_code() {
        let json = r#"{
            "dev_id": "X1",
            "name": "Garage",
            "online": false,
            "ip": null,
            "print_status": "",
            "dev_model_name": "BL-P001",
            "dev_product_name": "X1 Carbon",
            "dev_access_code": "",
            "nozzle_diameter": 0.4
        }"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert_eq!(device.dev_access_code, None);
        assert_eq!(device.nozzle_diameter, Some(0.4));
        assert_eq!(device.cloud_missed_cycles, 0);
    }

    #[tokio::test]
    async fn test_registry_lookup_and_publish() {
        let registry = DeviceRegistry::default();
        let mut updates = registry.subscribe();

        registry.merge_cloud(vec![cloud("X1", 0.4)]).await;
        assert_eq!(
            registry.get_device("missing").await,
            Err(FleetError::DeviceNotFound("missing".to_string()))
        );
        assert_eq!(registry.get_device("X1").await.unwrap().name, "Workshop P1S");

        registry.publish().await;
        assert!(updates.has_changed().unwrap());
        assert_eq!(updates.borrow_and_update().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_replaces_and_publishes() {
        let registry = DeviceRegistry::default();
        registry.merge_cloud(vec![cloud("OLD", 0.4)]).await;
        let updates = registry.subscribe();

        let mut restored = registry.list_devices().await;
        restored[0].dev_id = "NEW".to_string();
        registry.restore(restored).await;

        assert!(registry.get_device("OLD").await.is_err());
        assert!(registry.get_device("NEW").await.is_ok());
        assert_eq!(updates.borrow()[0].dev_id, "NEW");
    }
}

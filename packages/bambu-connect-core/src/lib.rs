//! Bambu Connect Core Library
//!
//! This crate keeps a fleet of Bambu Lab printers in view:
//! - Cloud session management (single-flight token refresh and re-login)
//! - Device registry reconciling the cloud device list with LAN discovery
//! - Periodic reconciliation with per-source failure isolation
//! - Persistence of the session and device snapshot
//!
//! # Example
//!
//! ```no_run
//! use bambu_connect_core::{config, Fleet, FileConfigStore, ConfigStore, LoginCredentials};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = config::load_settings();
//!     let store = FileConfigStore::default_location()?;
//!     let fleet = Fleet::from_config(&store.load_config()?, &settings)?;
//!
//!     fleet.login(LoginCredentials::new("maker@example.com", "secret")).await?;
//!
//!     let report = fleet.run_cycle().await;
//!     for device in &report.devices {
//!         println!("{} {:?}", device.name, device.ip);
//!     }
//!
//!     store.save_config(&fleet.snapshot_config().await)?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cloud;
pub mod config;
pub mod discovery;
pub mod error;
pub mod fleet;
pub mod persistence;
pub mod reconciler;
pub mod registry;

// Re-export commonly used types
pub use auth::{Credential, CredentialManager, CredentialState, LoginCredentials, RefreshPolicy};
pub use cloud::{BambuCloudClient, CloudAuth, CloudDevices};
pub use config::{ConfigSource, FleetSettings};
pub use discovery::{LocalDiscovery, SsdpDiscovery};
pub use error::{CloudError, FleetError, FleetResult};
pub use fleet::Fleet;
pub use persistence::{Config, ConfigStore, FileConfigStore};
pub use reconciler::{CycleReport, Reconciler, ReconcilerOptions};
pub use registry::{CloudDeviceReport, Device, DeviceRegistry, DeviceReport, LocalDeviceReport};

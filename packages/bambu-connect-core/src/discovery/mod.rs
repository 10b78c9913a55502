//! Local network discovery of printers.

pub mod ssdp;

use crate::error::{FleetError, FleetResult};
use crate::registry::LocalDeviceReport;
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

pub use ssdp::{SsdpListener, SsdpMessage};

/// Default SSDP ports announced on by Bambu printers.
pub const DEFAULT_SSDP_PORTS: [u16; 2] = [1990, 2021];

/// Source of LAN sightings. One call is one bounded discovery pass.
#[async_trait]
pub trait LocalDiscovery: Send + Sync {
    async fn discover_local_devices(&self) -> FleetResult<Vec<LocalDeviceReport>>;
}

/// Listens for SSDP announcements on every configured port at once.
#[derive(Debug, Clone)]
pub struct SsdpDiscovery {
    ports: Vec<u16>,
    window: Duration,
}

impl SsdpDiscovery {
    pub fn new(ports: Vec<u16>, window: Duration) -> Self {
        Self { ports, window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for SsdpDiscovery {
    fn default() -> Self {
        Self::new(DEFAULT_SSDP_PORTS.to_vec(), Duration::from_secs(5))
    }
}

#[async_trait]
impl LocalDiscovery for SsdpDiscovery {
    async fn discover_local_devices(&self) -> FleetResult<Vec<LocalDeviceReport>> {
        let listens = self.ports.iter().map(|&port| async move {
            (port, SsdpListener::new(port).listen(self.window).await)
        });
        let results = futures::future::join_all(listens).await;

        let mut messages = Vec::new();
        let mut failures = Vec::new();
        for (port, result) in results {
            match result {
                Ok(mut received) => messages.append(&mut received),
                Err(e) => {
                    tracing::warn!("SSDP listener on port {} failed: {:#}", port, e);
                    failures.push(format!("port {}: {:#}", port, e));
                }
            }
        }

        if !self.ports.is_empty() && failures.len() == self.ports.len() {
            return Err(FleetError::DiscoveryUnavailable(failures.join("; ")));
        }

        let seen_at = Utc::now();
        let reports: Vec<LocalDeviceReport> = ssdp::dedupe_by_usn(messages)
            .iter()
            .filter_map(|message| message.to_report(seen_at))
            .collect();

        tracing::debug!("SSDP discovery found {} printer(s)", reports.len());
        Ok(reports)
    }
}

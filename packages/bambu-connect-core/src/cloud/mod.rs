//! Cloud access.
//!
//! The core talks to the Bambu cloud only through the [`CloudAuth`] and
//! [`CloudDevices`] traits, so the HTTP transport can be swapped for fakes.
//! [`BambuCloudClient`] is the reqwest implementation of both.

mod client;

use crate::auth::{LoginCredentials, TokenGrant};
use crate::error::CloudError;
use crate::registry::CloudDeviceReport;
use async_trait::async_trait;

pub use client::{BambuCloudClient, DEFAULT_API_URL};

/// Login and token refresh endpoints.
#[async_trait]
pub trait CloudAuth: Send + Sync {
    /// Exchange account credentials for a brand-new token pair.
    async fn login(&self, credentials: &LoginCredentials) -> Result<TokenGrant, CloudError>;

    /// Exchange a refresh token for a new token pair.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, CloudError>;
}

/// The account's registered device list.
#[async_trait]
pub trait CloudDevices: Send + Sync {
    async fn fetch_cloud_devices(
        &self,
        access_token: &str,
    ) -> Result<Vec<CloudDeviceReport>, CloudError>;
}

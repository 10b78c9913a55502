//! Persistence module for saving and loading the session and device snapshot.
//!
//! The on-disk layout is the JSON file Bambu Connect has always written to
//! `<config_dir>/BambuConnect/config.json`, so existing installs keep working.

use crate::auth::Credential;
use crate::registry::Device;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "BambuConnect";
const CONFIG_FILE: &str = "config.json";

/// Persisted cloud session. Timestamps are Unix seconds; an empty `jwt`
/// means "not logged in".
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BambuInfo {
    pub jwt: String,
    pub refresh_token: String,
    pub refresh_token_expires_at: i64,
    pub jwt_last_refresh: i64,
    pub jwt_expires_at: i64,
}

impl BambuInfo {
    pub fn from_credential(credential: &Credential) -> Self {
        Self {
            jwt: credential.access_token.clone(),
            refresh_token: credential.refresh_token.clone(),
            refresh_token_expires_at: credential.refresh_token_expires_at.timestamp(),
            jwt_last_refresh: credential.last_refreshed_at.timestamp(),
            jwt_expires_at: credential.access_token_expires_at.timestamp(),
        }
    }

    pub fn to_credential(&self) -> Option<Credential> {
        if self.jwt.is_empty() || self.refresh_token.is_empty() {
            return None;
        }
        Some(Credential {
            access_token: self.jwt.clone(),
            access_token_expires_at: from_unix(self.jwt_expires_at),
            refresh_token: self.refresh_token.clone(),
            refresh_token_expires_at: from_unix(self.refresh_token_expires_at),
            last_refreshed_at: from_unix(self.jwt_last_refresh),
        })
    }
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

/// Persisted application state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub is_first_run: bool,
    #[serde(default)]
    pub bambu_info: BambuInfo,
    #[serde(default)]
    pub bambu_devices: Vec<Device>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_first_run: true,
            bambu_info: BambuInfo::default(),
            bambu_devices: Vec::new(),
        }
    }
}

impl Config {
    pub fn credential(&self) -> Option<Credential> {
        self.bambu_info.to_credential()
    }
}

/// Where the host keeps [`Config`] between runs.
pub trait ConfigStore: Send + Sync {
    fn load_config(&self) -> Result<Config>;
    fn save_config(&self, config: &Config) -> Result<()>;
}

/// JSON file store, created with defaults on first load.
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<config_dir>/BambuConnect/config.json`.
    pub fn default_location() -> Result<Self> {
        let config_dir = dirs::config_dir().context("Could not find config directory")?;
        Ok(Self::new(config_dir.join(APP_DIR).join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the stored session and devices.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).context("Failed to delete config file")?;
            tracing::info!("Cleared persisted config file");
        }
        Ok(())
    }
}

impl ConfigStore for FileConfigStore {
    fn load_config(&self) -> Result<Config> {
        if !self.path.exists() {
            tracing::debug!("No config file at {:?}, creating defaults", self.path);
            let config = Config::default();
            self.save_config(&config)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&self.path).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config file")?;

        tracing::info!(
            "Loaded config: {} devices, logged in: {}",
            config.bambu_devices.len(),
            !config.bambu_info.jwt.is_empty()
        );

        Ok(config)
    }

    fn save_config(&self, config: &Config) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = serde_json::to_string_pretty(config).context("Failed to serialize config")?;
        write_private(&self.path, content.as_bytes()).context("Failed to write config file")?;

        tracing::debug!("Saved config: {} devices", config.bambu_devices.len());
        Ok(())
    }
}

/// The file holds tokens and access codes: owner read/write only.
#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    file.write_all(content)
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, content)
}

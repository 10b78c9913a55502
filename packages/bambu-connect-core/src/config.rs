use crate::auth::RefreshPolicy;
use crate::cloud::DEFAULT_API_URL;
use crate::discovery::DEFAULT_SSDP_PORTS;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable name for API URL override
const ENV_API_URL: &str = "BAMBU_CONNECT_API_URL";

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    cloud: Option<CloudSection>,
    sync: Option<SyncSection>,
    discovery: Option<DiscoverySection>,
}

#[derive(Debug, Deserialize, Default)]
struct CloudSection {
    /// API endpoint URL (e.g., "https://api.bambulab.cn")
    api_url: Option<String>,
    /// Absolute login endpoint, when it differs from the API host
    login_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SyncSection {
    poll_interval_secs: Option<u64>,
    refresh_margin_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    max_refresh_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    prune_after_cycles: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DiscoverySection {
    window_secs: Option<u64>,
    ports: Option<Vec<u16>>,
}

/// Runtime settings for the fleet core and its collaborators
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSettings {
    /// Base URL for Bambu cloud API calls
    pub api_url: String,
    /// Source of the API URL (for logging)
    pub source: ConfigSource,
    /// Login endpoint override; `None` logs in through `api_url`
    pub login_url: Option<String>,
    /// Time between reconciliation cycles
    pub poll_interval: Duration,
    /// Refresh the access token once it has less than this left
    pub refresh_margin: Duration,
    /// Upper bound on every cloud request
    pub request_timeout: Duration,
    pub max_refresh_attempts: u32,
    pub retry_base_delay: Duration,
    /// Cloud syncs a device may be missing from before it is dropped (0 = never)
    pub prune_after_cycles: u32,
    /// How long each discovery pass listens
    pub discovery_window: Duration,
    pub discovery_ports: Vec<u16>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            source: ConfigSource::Default,
            login_url: None,
            poll_interval: Duration::from_secs(300),
            refresh_margin: Duration::from_secs(300),
            request_timeout: Duration::from_secs(10),
            max_refresh_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            prune_after_cycles: 3,
            discovery_window: Duration::from_secs(5),
            discovery_ports: DEFAULT_SSDP_PORTS.to_vec(),
        }
    }
}

impl FleetSettings {
    /// Refresh behaviour for the credential manager.
    pub fn refresh_policy(&self) -> RefreshPolicy {
        RefreshPolicy {
            refresh_margin: self.refresh_margin,
            request_timeout: self.request_timeout,
            max_attempts: self.max_refresh_attempts.max(1),
            retry_base_delay: self.retry_base_delay,
            ..RefreshPolicy::default()
        }
    }
}

/// Where the API URL came from
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// Using default hardcoded values
    Default,
    /// Loaded from environment variable
    Environment,
    /// Loaded from config file
    ConfigFile,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::Environment => write!(f, "environment variable"),
            ConfigSource::ConfigFile => write!(f, "config file"),
        }
    }
}

/// Get the path to the settings file
fn get_config_file_path() -> Option<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .map(|p| p.join("bambu-connect").join("config.toml"))
}

/// Load the settings file, warning (not failing) on unreadable content
fn load_settings_file(path: &Path) -> Option<SettingsFile> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(file) => {
                tracing::debug!("Loaded settings from {:?}", path);
                Some(file)
            }
            Err(e) => {
                tracing::warn!("Failed to parse settings file {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read settings file {:?}: {}", path, e);
            None
        }
    }
}

/// Load settings with priority:
/// 1. Environment variable (BAMBU_CONNECT_API_URL), API URL only
/// 2. Settings file (~/.config/bambu-connect/config.toml)
/// 3. Default values
pub fn load_settings() -> FleetSettings {
    let file = get_config_file_path().and_then(|p| load_settings_file(&p));
    resolve_settings(std::env::var(ENV_API_URL).ok(), file)
}

/// Load settings from an explicit file, still honouring the environment.
pub fn load_settings_from(path: &Path) -> FleetSettings {
    resolve_settings(std::env::var(ENV_API_URL).ok(), load_settings_file(path))
}

fn resolve_settings(env_url: Option<String>, file: Option<SettingsFile>) -> FleetSettings {
    let mut settings = FleetSettings::default();
    let file = file.unwrap_or_default();

    if let Some(sync) = file.sync {
        if let Some(secs) = sync.poll_interval_secs.filter(|s| *s > 0) {
            settings.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = sync.refresh_margin_secs {
            settings.refresh_margin = Duration::from_secs(secs);
        }
        if let Some(secs) = sync.request_timeout_secs.filter(|s| *s > 0) {
            settings.request_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = sync.max_refresh_attempts {
            settings.max_refresh_attempts = attempts.max(1);
        }
        if let Some(ms) = sync.retry_base_delay_ms {
            settings.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(cycles) = sync.prune_after_cycles {
            settings.prune_after_cycles = cycles;
        }
    }

    if let Some(discovery) = file.discovery {
        if let Some(secs) = discovery.window_secs.filter(|s| *s > 0) {
            settings.discovery_window = Duration::from_secs(secs);
        }
        if let Some(ports) = discovery.ports {
            settings.discovery_ports = ports;
        }
    }

    let cloud = file.cloud.unwrap_or_default();
    settings.login_url = cloud
        .login_url
        .as_deref()
        .map(normalize_url)
        .filter(|u| !u.is_empty());

    // Priority 1: Environment variable
    if let Some(url) = env_url.as_deref().map(normalize_url).filter(|u| !u.is_empty()) {
        tracing::info!("Using Bambu API URL from environment variable: {}", url);
        settings.api_url = url;
        settings.source = ConfigSource::Environment;
        return settings;
    }

    // Priority 2: Config file
    if let Some(url) = cloud
        .api_url
        .map(|u| normalize_url(&u))
        .filter(|u| !u.is_empty())
    {
        tracing::info!("Using Bambu API URL from config file: {}", url);
        settings.api_url = url;
        settings.source = ConfigSource::ConfigFile;
        return settings;
    }

    // Priority 3: Default values
    tracing::debug!("Using default Bambu API URL: {}", settings.api_url);
    settings
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Get the path to the settings file for documentation purposes
pub fn get_config_file_path_string() -> String {
    get_config_file_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "~/.config/bambu-connect/config.toml".to_string())
}

/// Generate example settings file content
pub fn generate_example_config() -> String {
    r#"# Bambu Connect Configuration
# Place this file at: ~/.config/bambu-connect/config.toml

[cloud]
# Bambu cloud API endpoint (use https://api.bambulab.cn for China accounts)
# Default: https://api.bambulab.com
# api_url = "https://api.bambulab.com"
# Log in through a different endpoint, e.g. the web sign-in form
# login_url = "https://bambulab.com/api/sign-in/form"

[sync]
# Seconds between reconciliation cycles in daemon mode
# poll_interval_secs = 300
# Refresh the access token when less than this many seconds remain
# refresh_margin_secs = 300
# request_timeout_secs = 10
# max_refresh_attempts = 3
# retry_base_delay_ms = 500
# Drop a device after this many cloud syncs without it (0 = never)
# prune_after_cycles = 3

[discovery]
# How long each SSDP discovery pass listens
# window_secs = 5
# ports = [1990, 2021]
"#
    .to_string()
}

//! Bambu Connect CLI - headless access to a Bambu Lab printer fleet
//!
//! This binary can:
//! - Log in to the Bambu cloud and keep the session refreshed
//! - Reconcile the cloud device list with printers discovered on the LAN
//! - Show devices with their LAN address and access code
//! - Run as a background daemon (for systemd integration)

mod daemon;

use anyhow::{Context, Result};
use bambu_connect_core::{
    config, ConfigStore, CycleReport, Device, FileConfigStore, Fleet, FleetError, FleetSettings,
    LoginCredentials,
};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "bambu-connect")]
#[command(author = "BambuConnect Contributors")]
#[command(version)]
#[command(about = "Keep a Bambu Lab printer fleet in view from the command line")]
#[command(long_about = "
Bambu Connect merges the printers registered to your Bambu cloud account
with the printers announcing themselves on your LAN, so every printer is
listed with its current IP address and LAN access code.

Quick start:
  1. Log in:           bambu-connect login
  2. List printers:    bambu-connect devices --sync
  3. Start daemon:     bambu-connect daemon

For systemd integration, see: bambu-connect daemon --help
")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for scripting
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in to the Bambu cloud (password from BAMBU_PASSWORD or prompt)
    Login {
        /// Account email or phone number (defaults to BAMBU_ACCOUNT)
        account: Option<String>,
    },

    /// Show session status
    Status,

    /// List known printers
    Devices {
        /// Run a reconciliation cycle before listing
        #[arg(short, long)]
        sync: bool,
    },

    /// Show one printer
    Device {
        /// Printer serial number
        dev_id: String,
    },

    /// Refresh the session now and reconcile the device list
    Refresh,

    /// Run as a background reconciliation daemon
    Daemon {
        /// Seconds between cycles (overrides the configured poll interval)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Forget the session and all known printers
    Logout,

    /// Show configuration paths and settings
    Config,
}

const ENV_ACCOUNT: &str = "BAMBU_ACCOUNT";
const ENV_PASSWORD: &str = "BAMBU_PASSWORD";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("bambu_connect={},bambu_connect_core={}", log_level, log_level).into()
            }),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Login { account } => cmd_login(&cli, account.clone()).await,
        Commands::Status => cmd_status(&cli).await,
        Commands::Devices { sync } => cmd_devices(&cli, *sync).await,
        Commands::Device { dev_id } => cmd_device(&cli, dev_id).await,
        Commands::Refresh => cmd_refresh(&cli).await,
        Commands::Daemon { interval } => daemon::run_daemon(*interval).await,
        Commands::Logout => cmd_logout(&cli).await,
        Commands::Config => cmd_config(&cli).await,
    }
}

/// Settings, store and a fleet restored from the stored snapshot.
pub(crate) fn open_fleet() -> Result<(FleetSettings, FileConfigStore, Fleet)> {
    let settings = config::load_settings();
    let store = FileConfigStore::default_location()?;
    let snapshot = store.load_config().context("Failed to load saved state")?;
    let fleet = Fleet::from_config(&snapshot, &settings)?;
    Ok((settings, store, fleet))
}

pub(crate) async fn save_snapshot(store: &FileConfigStore, fleet: &Fleet) -> Result<()> {
    store
        .save_config(&fleet.snapshot_config().await)
        .context("Failed to save state")
}

async fn cmd_login(cli: &Cli, account: Option<String>) -> Result<()> {
    let account = match account.or_else(|| std::env::var(ENV_ACCOUNT).ok()) {
        Some(account) if !account.trim().is_empty() => account.trim().to_string(),
        _ => anyhow::bail!("No account given. Pass it as an argument or set {}.", ENV_ACCOUNT),
    };
    let password = match std::env::var(ENV_PASSWORD) {
        Ok(password) if !password.is_empty() => password,
        _ => rpassword::prompt_password(format!("Password for {}: ", account))
            .context("Failed to read password")?,
    };

    let (_, store, fleet) = open_fleet()?;

    match cli.format {
        OutputFormat::Text => println!("Logging in..."),
        OutputFormat::Json => {}
    }

    let credential = match fleet.login(LoginCredentials::new(account.clone(), password)).await {
        Ok(credential) => credential,
        Err(FleetError::AuthRejected(reason)) => {
            match cli.format {
                OutputFormat::Text => eprintln!("Login rejected: {}", reason),
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({
                        "status": "rejected",
                        "reason": reason,
                    }));
                }
            }
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    };

    let report = fleet.run_cycle().await;
    save_snapshot(&store, &fleet).await?;

    match cli.format {
        OutputFormat::Text => {
            println!("Logged in as {}", account);
            println!("Session valid until {}", credential.access_token_expires_at.to_rfc3339());
            println!();
            println!("Found {} printer(s). List them with: bambu-connect devices", report.devices.len());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "logged_in",
                "account": account,
                "access_token_expires_at": credential.access_token_expires_at,
                "refresh_token_expires_at": credential.refresh_token_expires_at,
                "devices": report.devices.len(),
            }));
        }
    }

    Ok(())
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let (_, store, fleet) = open_fleet()?;
    let state = fleet.credential_state().await;
    let credential = fleet.credential().await;
    let devices = fleet.list_devices().await;

    match cli.format {
        OutputFormat::Text => {
            println!("Session: {}", state);
            if let Some(credential) = &credential {
                println!("Access token expires:  {}", credential.access_token_expires_at.to_rfc3339());
                println!("Refresh token expires: {}", credential.refresh_token_expires_at.to_rfc3339());
                println!("Last refreshed:        {}", credential.last_refreshed_at.to_rfc3339());
            } else {
                println!();
                println!("Run 'bambu-connect login' to authenticate.");
            }
            println!();
            println!("Known printers: {}", devices.len());
            println!("State file:     {}", store.path().display());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "state": state,
                "access_token_expires_at": credential.as_ref().map(|c| c.access_token_expires_at),
                "refresh_token_expires_at": credential.as_ref().map(|c| c.refresh_token_expires_at),
                "last_refreshed_at": credential.as_ref().map(|c| c.last_refreshed_at),
                "devices": devices.len(),
                "state_file": store.path().display().to_string(),
            }));
        }
    }

    Ok(())
}

async fn cmd_devices(cli: &Cli, sync: bool) -> Result<()> {
    let (_, store, fleet) = open_fleet()?;

    let devices = if sync {
        match cli.format {
            OutputFormat::Text => println!("Reconciling cloud and LAN..."),
            OutputFormat::Json => {}
        }
        let report = fleet.run_cycle().await;
        if let OutputFormat::Text = cli.format {
            print_source_errors(&report);
        }
        save_snapshot(&store, &fleet).await?;
        report.devices
    } else {
        fleet.list_devices().await
    };

    match cli.format {
        OutputFormat::Text => {
            println!();
            println!("{} printer(s):", devices.len());
            println!();
            for device in &devices {
                print_device_line(device);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "devices": devices }));
        }
    }

    Ok(())
}

async fn cmd_device(cli: &Cli, dev_id: &str) -> Result<()> {
    let (_, _, fleet) = open_fleet()?;
    let device = fleet.get_device(dev_id).await?;

    match cli.format {
        OutputFormat::Text => {
            println!("Name:          {}", display_or_dash(&device.name));
            println!("Serial:        {}", device.dev_id);
            println!("Model:         {} ({})", display_or_dash(&device.dev_product_name), display_or_dash(&device.dev_model_name));
            println!("Online:        {}", if device.online { "yes" } else { "no" });
            println!("IP address:    {}", device.ip.as_deref().unwrap_or("-"));
            println!("Print status:  {}", display_or_dash(&device.print_status));
            println!("Access code:   {}", device.dev_access_code.as_deref().unwrap_or("-"));
            println!(
                "Nozzle:        {}",
                device.nozzle_diameter.map(|d| format!("{} mm", d)).unwrap_or_else(|| "-".to_string())
            );
            println!(
                "Last on LAN:   {}",
                device.last_seen_locally.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
            );
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&device)?);
        }
    }

    Ok(())
}

async fn cmd_refresh(cli: &Cli) -> Result<()> {
    let (_, store, fleet) = open_fleet()?;

    let (refreshed, report) = fleet.force_refresh().await;
    save_snapshot(&store, &fleet).await?;

    let credential = fleet.credential().await;
    match cli.format {
        OutputFormat::Text => {
            match &refreshed {
                Ok(()) => {
                    println!("Session refreshed.");
                    if let Some(credential) = &credential {
                        println!("Access token expires: {}", credential.access_token_expires_at.to_rfc3339());
                    }
                }
                Err(e) => println!("Session refresh failed: {}", e),
            }
            print_source_errors(&report);
            println!("{} printer(s) known.", report.devices.len());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": if refreshed.is_ok() { "refreshed" } else { "refresh_failed" },
                "refresh_error": refreshed.as_ref().err().map(|e| e.to_string()),
                "access_token_expires_at": credential.as_ref().map(|c| c.access_token_expires_at),
                "cloud_error": report.cloud.as_ref().err().map(|e| e.to_string()),
                "local_error": report.local.as_ref().err().map(|e| e.to_string()),
                "devices": report.devices,
            }));
        }
    }

    if let Err(FleetError::ReauthenticationRequired) = refreshed {
        anyhow::bail!("Cloud session lost. Run 'bambu-connect login' to reconnect.");
    }
    Ok(())
}

async fn cmd_logout(cli: &Cli) -> Result<()> {
    let (_, store, fleet) = open_fleet()?;

    if fleet.credential().await.is_none() {
        match cli.format {
            OutputFormat::Text => println!("Not logged in."),
            OutputFormat::Json => {
                println!("{}", serde_json::json!({
                    "status": "not_logged_in",
                }));
            }
        }
        return Ok(());
    }

    fleet.logout().await;
    save_snapshot(&store, &fleet).await?;

    match cli.format {
        OutputFormat::Text => println!("Logged out."),
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "status": "logged_out",
            }));
        }
    }

    Ok(())
}

async fn cmd_config(cli: &Cli) -> Result<()> {
    let settings = config::load_settings();
    let config_path = config::get_config_file_path_string();
    let state_path = FileConfigStore::default_location()
        .map(|s| s.path().display().to_string())
        .unwrap_or_else(|_| "-".to_string());

    match cli.format {
        OutputFormat::Text => {
            println!("Configuration");
            println!("=============");
            println!();
            println!("Config file:      {}", config_path);
            println!("State file:       {}", state_path);
            println!("API endpoint:     {} (from {})", settings.api_url, settings.source);
            if let Some(login_url) = &settings.login_url {
                println!("Login endpoint:   {}", login_url);
            }
            println!("Poll interval:    {}s", settings.poll_interval.as_secs());
            println!("Discovery ports:  {:?}", settings.discovery_ports);
            println!();
            println!("Environment variables:");
            println!("  BAMBU_CONNECT_API_URL - Override API endpoint");
            println!("  BAMBU_ACCOUNT         - Account used by 'login'");
            println!("  BAMBU_PASSWORD        - Password used by 'login' and the daemon");
            println!();
            println!("Example config.toml:");
            println!();
            println!("{}", config::generate_example_config());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({
                "config_file": config_path,
                "state_file": state_path,
                "api_url": settings.api_url,
                "api_source": format!("{}", settings.source),
                "login_url": settings.login_url,
                "poll_interval_secs": settings.poll_interval.as_secs(),
                "discovery_ports": settings.discovery_ports,
            }));
        }
    }

    Ok(())
}

fn print_device_line(device: &Device) {
    let status = if device.online { "online" } else { "offline" };
    println!(
        "  {:18} {:24} {:12} {:15} {:8} {}",
        device.dev_id,
        display_or_dash(&device.name),
        display_or_dash(&device.dev_product_name),
        device.ip.as_deref().unwrap_or("-"),
        status,
        display_or_dash(&device.print_status)
    );
}

fn print_source_errors(report: &CycleReport) {
    if let Err(e) = &report.cloud {
        eprintln!("Cloud sync failed: {}", e);
        if matches!(e, FleetError::ReauthenticationRequired) {
            eprintln!("Run 'bambu-connect login' to sign in again.");
        }
    }
    if let Err(e) = &report.local {
        eprintln!("LAN discovery failed: {}", e);
    }
}

fn display_or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

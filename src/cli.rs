//! Command-line interface definitions.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::dfu::UsbDfuConnector;
use crate::error::UpdateError;
use crate::serial::UsbSerialConnector;
use crate::settings::{SettingsManager, UpdaterSettings};
use crate::traits::ReqwestHttpClient;
use crate::update::{UpdateOrchestrator, UpdateOutcome, UpdateStage};

/// Settings file written by `init-config` when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "crow-updater.json";

/// Command-line arguments.
#[derive(Parser)]
#[command(name = "crow-updater", version)]
#[command(about = "Firmware updater for monome crow")]
pub struct Cli {
    /// Settings file (JSON). Built-in defaults are used without one.
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Update crow to the latest release (default)
    Update {
        /// Version manifest URL
        #[arg(long, value_name = "URL")]
        manifest_url: Option<String>,

        /// Where to store the downloaded image
        #[arg(long, value_name = "FILE")]
        cache: Option<PathBuf>,

        /// Program without erasing pages first
        #[arg(long)]
        no_erase: bool,
    },

    /// Compare the installed and latest versions without updating.
    /// Only `^^v` is sent, so a running script keeps running.
    Check {
        /// Version manifest URL
        #[arg(long, value_name = "URL")]
        manifest_url: Option<String>,
    },

    /// Write a settings file with every default filled in
    InitConfig {
        /// Output file
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
}

pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}

/// Execute the parsed CLI command.
pub fn run(cli: Cli) -> Result<()> {
    let command = cli.command.unwrap_or(Commands::Update {
        manifest_url: None,
        cache: None,
        no_erase: false,
    });

    match command {
        Commands::Update {
            manifest_url,
            cache,
            no_erase,
        } => {
            let mut settings = load_settings(cli.config.as_deref())?;
            if let Some(url) = manifest_url {
                settings.manifest_url = url;
            }
            if let Some(path) = cache {
                settings.cache_path = path;
            }
            if no_erase {
                settings.dfu.erase_first = false;
            }
            update(&settings)
        }
        Commands::Check { manifest_url } => {
            let mut settings = load_settings(cli.config.as_deref())?;
            if let Some(url) = manifest_url {
                settings.manifest_url = url;
            }
            check(&settings)
        }
        Commands::InitConfig { file } => {
            let path = file
                .or(cli.config)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            init_config(&path)
        }
    }
}

fn load_settings(path: Option<&Path>) -> Result<UpdaterSettings> {
    match path {
        Some(path) => {
            let manager = SettingsManager::new(path);
            let settings = manager.load()?;
            info!(path = %manager.settings_path().display(), "loaded settings");
            Ok(settings)
        }
        None => Ok(UpdaterSettings::default()),
    }
}

fn update(settings: &UpdaterSettings) -> Result<()> {
    let http = ReqwestHttpClient::new().map_err(anyhow::Error::msg)?;
    let serial = UsbSerialConnector::new(settings.serial.clone());
    let usb = UsbDfuConnector::new(settings.dfu.clone());

    let mut bar: Option<ProgressBar> = None;
    let outcome = UpdateOrchestrator::new(settings, &http, &serial, &usb).run(|stage| {
        match stage {
            UpdateStage::Writing { written, total } => {
                let pb = bar.get_or_insert_with(|| flash_bar(total));
                pb.set_position(written as u64);
            }
            other => {
                if let Some(pb) = bar.take() {
                    pb.finish();
                }
                println!("[{:>3.0}%] {}", other.percent(), other.message());
            }
        }
    });
    if let Some(pb) = bar {
        pb.abandon();
    }

    match outcome? {
        UpdateOutcome::UpToDate { local, .. } => println!("Up to date ({}).", local),
        UpdateOutcome::Updated {
            from,
            to,
            bytes_written,
            exit,
        } => {
            println!("Updated {} -> {} ({} bytes written).", from, to, bytes_written);
            if !exit.is_confirmed() {
                println!("crow did not confirm the restart. Power-cycle it if it stays silent.");
            }
        }
        UpdateOutcome::NothingToFlash { to, .. } => {
            println!("Firmware image for {} had nothing to write.", to)
        }
    }
    Ok(())
}

fn flash_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb
}

fn check(settings: &UpdaterSettings) -> Result<()> {
    let http = ReqwestHttpClient::new().map_err(anyhow::Error::msg)?;
    let serial = UsbSerialConnector::new(settings.serial.clone());
    let usb = UsbDfuConnector::new(settings.dfu.clone());

    let report = UpdateOrchestrator::new(settings, &http, &serial, &usb).check()?;

    println!("Latest version: {}", report.remote.version);
    match &report.local {
        Some(local) => println!("Local version:  {}", local),
        None => println!("Local version:  no crow found (it may be in bootloader mode)"),
    }
    if report.update_needed() {
        println!("Update available: {}", report.remote.download_url);
    } else {
        println!("Up to date.");
    }
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, not overwriting it", path.display());
    }
    SettingsManager::new(path).save(&UpdaterSettings::default())?;
    println!("Wrote default settings to {}", path.display());
    Ok(())
}

/// Print a fatal error for the user.
pub fn report_error(err: &anyhow::Error) {
    match err.downcast_ref::<UpdateError>() {
        Some(update_err) => {
            eprintln!("error [{}]: {}", update_err.error_code(), update_err);
            if update_err.is_destructive() {
                eprintln!();
                eprintln!("WARNING: flashing stopped part way. crow may not boot.");
                eprintln!("Leave it connected and run the update again; the bootloader");
                eprintln!("stays reachable and will take a complete image.");
            }
        }
        None => eprintln!("error: {:#}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::temp::TestContext;

    #[test]
    fn test_no_subcommand_means_update() {
        let cli = Cli::try_parse_from(["crow-updater"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_update_overrides_parse() {
        let cli = Cli::try_parse_from([
            "crow-updater",
            "--json-logs",
            "update",
            "--manifest-url",
            "https://example/version.txt",
            "--cache",
            "/tmp/fw.dfu",
            "--no-erase",
        ])
        .unwrap();

        assert!(cli.json_logs);
        match cli.command {
            Some(Commands::Update {
                manifest_url,
                cache,
                no_erase,
            }) => {
                assert_eq!(manifest_url.as_deref(), Some("https://example/version.txt"));
                assert_eq!(cache, Some(PathBuf::from("/tmp/fw.dfu")));
                assert!(no_erase);
            }
            _ => panic!("expected update"),
        }
    }

    #[test]
    fn test_init_config_writes_defaults() {
        let ctx = TestContext::new();
        let path = ctx.path("conf/crow-updater.json");

        init_config(&path).unwrap();

        let loaded = SettingsManager::new(&path).load().unwrap();
        assert_eq!(loaded, UpdaterSettings::default());
    }

    #[test]
    fn test_init_config_refuses_to_overwrite() {
        let ctx = TestContext::new();
        let path = ctx.create_file("crow-updater.json", b"{\"cachePath\": \"mine.dfu\"}");

        assert!(init_config(&path).is_err());
        assert_eq!(ctx.read_file("crow-updater.json"), b"{\"cachePath\": \"mine.dfu\"}");
    }

    #[test]
    fn test_load_settings_without_file_uses_defaults() {
        assert_eq!(load_settings(None).unwrap(), UpdaterSettings::default());
    }
}

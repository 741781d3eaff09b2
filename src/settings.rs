//! Updater settings with JSON persistence.
//!
//! This module provides:
//! - `UpdaterSettings` with every knob of the update flow
//! - `CommandTimings`, the fixed wait after each crow command
//! - Persistence to a JSON file chosen on the command line
//!
//! Every field carries `#[serde(default)]`, so a settings file only has to
//! name the values it changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};

/// Where crow publishes its current release.
pub const DEFAULT_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/monome/crow/main/version.txt";

/// Local file the firmware image is downloaded to.
pub const DEFAULT_CACHE_PATH: &str = "crow.dfu";

/// Wait after each crow command before reading whatever it printed.
///
/// The crow command channel has no acknowledgement, so these delays are
/// the protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandTimings {
    /// Wait after `^^p`.
    #[serde(default = "default_print_wait_ms")]
    pub print_script_ms: u64,
    /// Wait after `^^c`.
    #[serde(default = "default_clear_wait_ms")]
    pub clear_script_ms: u64,
    /// Wait after `^^v`.
    #[serde(default = "default_version_wait_ms")]
    pub version_ms: u64,
    /// Wait after `^^b`, covers the device reset.
    #[serde(default = "default_bootloader_wait_ms")]
    pub bootloader_ms: u64,
}

fn default_print_wait_ms() -> u64 {
    300
}

fn default_clear_wait_ms() -> u64 {
    1000
}

fn default_version_wait_ms() -> u64 {
    100
}

fn default_bootloader_wait_ms() -> u64 {
    1000
}

impl Default for CommandTimings {
    fn default() -> Self {
        Self {
            print_script_ms: default_print_wait_ms(),
            clear_script_ms: default_clear_wait_ms(),
            version_ms: default_version_wait_ms(),
            bootloader_ms: default_bootloader_wait_ms(),
        }
    }
}

#[cfg(test)]
impl CommandTimings {
    /// All waits set to zero, for scripted links.
    pub fn immediate() -> Self {
        Self {
            print_script_ms: 0,
            clear_script_ms: 0,
            version_ms: 0,
            bootloader_ms: 0,
        }
    }
}

/// USB serial endpoint of crow in application mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerialSettings {
    #[serde(default = "default_serial_vid")]
    pub vid: u16,
    #[serde(default = "default_serial_pid")]
    pub pid: u16,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_serial_vid() -> u16 {
    0x0483
}

fn default_serial_pid() -> u16 {
    0x5740
}

fn default_baud_rate() -> u32 {
    115_200
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            vid: default_serial_vid(),
            pid: default_serial_pid(),
            baud_rate: default_baud_rate(),
        }
    }
}

/// STM32 system bootloader as seen once crow is in DFU mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DfuSettings {
    #[serde(default = "default_dfu_vid")]
    pub vid: u16,
    #[serde(default = "default_dfu_pid")]
    pub pid: u16,
    /// Timeout for every USB control transfer.
    #[serde(default = "default_usb_timeout_ms")]
    pub usb_timeout_ms: u64,
    /// Erase each target page before programming it.
    #[serde(default = "default_erase_first")]
    pub erase_first: bool,
}

fn default_dfu_vid() -> u16 {
    0x0483
}

fn default_dfu_pid() -> u16 {
    0xDF11
}

fn default_usb_timeout_ms() -> u64 {
    4000
}

fn default_erase_first() -> bool {
    true
}

impl Default for DfuSettings {
    fn default() -> Self {
        Self {
            vid: default_dfu_vid(),
            pid: default_dfu_pid(),
            usb_timeout_ms: default_usb_timeout_ms(),
            erase_first: default_erase_first(),
        }
    }
}

impl DfuSettings {
    pub fn usb_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_timeout_ms)
    }
}

/// Everything the update flow can be told from the outside.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdaterSettings {
    #[serde(default = "default_manifest_url")]
    pub manifest_url: String,

    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    #[serde(default)]
    pub serial: SerialSettings,

    #[serde(default)]
    pub dfu: DfuSettings,

    #[serde(default)]
    pub timings: CommandTimings,
}

fn default_manifest_url() -> String {
    DEFAULT_MANIFEST_URL.to_string()
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(DEFAULT_CACHE_PATH)
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            manifest_url: default_manifest_url(),
            cache_path: default_cache_path(),
            serial: SerialSettings::default(),
            dfu: DfuSettings::default(),
            timings: CommandTimings::default(),
        }
    }
}

/// Manages persistence of updater settings to a JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a settings manager for the given file.
    pub fn new(settings_file: &Path) -> Self {
        Self {
            settings_file_path: settings_file.to_path_buf(),
        }
    }

    /// Load settings from disk, returning defaults if the file doesn't exist.
    pub fn load(&self) -> UpdateResult<UpdaterSettings> {
        if !self.settings_file_path.exists() {
            return Ok(UpdaterSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path).map_err(|e| {
            UpdateError::Settings {
                reason: format!(
                    "failed to read {}: {}",
                    self.settings_file_path.display(),
                    e
                ),
            }
        })?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(UpdaterSettings::default());
        }

        Ok(serde_json::from_str(&contents)?)
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &UpdaterSettings) -> UpdateResult<()> {
        if let Some(parent) = self.settings_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;

        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}

//! Error types for the crow update flow.

use thiserror::Error;

/// Result type alias for update operations.
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Errors that can occur while updating a crow.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB error from the rusb crate.
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while reading or writing the settings file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Settings file could not be used.
    #[error("Settings error: {reason}")]
    Settings { reason: String },

    /// No crow on the serial bus, or the port is claimed by someone else.
    #[error("Could not connect to crow: {reason}")]
    Connection { reason: String },

    /// Remote version manifest could not be fetched.
    #[error("Failed to fetch version manifest from {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    /// Remote version manifest is malformed.
    #[error("Invalid version manifest: {reason}")]
    ManifestParse { reason: String },

    /// The device answered `^^v` with something that has no quoted version.
    #[error("Could not parse version reported by crow: {response:?}")]
    VersionParse { response: String },

    /// Firmware image could not be downloaded or stored.
    #[error("Failed to download firmware from {url}: {reason}")]
    Download { url: String, reason: String },

    /// No DFU interface was found after bootloader entry.
    #[error("crow not found in bootloader mode: {reason}")]
    DeviceNotFound { reason: String },

    /// Firmware container is corrupt.
    #[error("Invalid DFU container: {reason}")]
    ContainerFormat { reason: String },

    /// Flash write failed part way. The device state is undefined.
    #[error("Flash write failed at 0x{address:08X}: {reason}")]
    FlashWrite { address: u32, reason: String },

    /// A DFU request got an unexpected answer from the bootloader.
    #[error("DFU {operation} failed: {reason}")]
    DfuProtocol { operation: String, reason: String },
}

impl UpdateError {
    /// Whether this failure may have left the device without bootable firmware.
    pub fn is_destructive(&self) -> bool {
        matches!(self, UpdateError::FlashWrite { .. })
    }

    /// Get a user-friendly error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            UpdateError::Serial(_) => "UPD-001",
            UpdateError::Usb(_) => "UPD-002",
            UpdateError::Io(_) => "UPD-003",
            UpdateError::Json(_) => "UPD-004",
            UpdateError::Settings { .. } => "UPD-005",
            UpdateError::Connection { .. } => "UPD-010",
            UpdateError::ManifestFetch { .. } => "UPD-020",
            UpdateError::ManifestParse { .. } => "UPD-021",
            UpdateError::VersionParse { .. } => "UPD-030",
            UpdateError::Download { .. } => "UPD-040",
            UpdateError::DeviceNotFound { .. } => "UPD-050",
            UpdateError::ContainerFormat { .. } => "UPD-060",
            UpdateError::FlashWrite { .. } => "UPD-070",
            UpdateError::DfuProtocol { .. } => "UPD-071",
        }
    }
}

/// Outcome of a step whose failure does not fail the update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort {
    /// The device confirmed the step.
    Confirmed,
    /// The request went out but the device gave no confirmation.
    Unconfirmed,
    /// The request itself failed.
    Failed(String),
}

impl BestEffort {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, BestEffort::Confirmed)
    }
}

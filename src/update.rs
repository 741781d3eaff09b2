//! End-to-end crow update.
//!
//! Resolve versions, decide whether to update, reset crow into its
//! bootloader, then flash the downloaded DfuSe image over USB.

use std::fmt;

use tracing::{debug, info, warn};

use crate::cache::{CachedImage, FirmwareFetcher};
use crate::dfu::{DfuConnector, DfuProgrammer, DfuSeImage, MemoryElement};
use crate::error::{BestEffort, UpdateError, UpdateResult};
use crate::serial::{CrowCommand, DeviceConnector, DeviceSession};
use crate::settings::UpdaterSettings;
use crate::traits::HttpClient;
use crate::version::{is_up_to_date, FirmwareManifest, VersionResolver, VersionString};

/// Where a run currently is. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    VersionChecked,
    UpToDate,
    BootloaderEntered,
    Flashing,
    Done,
    Failed,
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::UpToDate | UpdateState::Done | UpdateState::Failed
        )
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_advance_to(&self, next: UpdateState) -> bool {
        use UpdateState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Idle, VersionChecked) => true,
            (VersionChecked, UpToDate | BootloaderEntered) => true,
            // An empty image finishes without flashing.
            (BootloaderEntered, Flashing | Done) => true,
            (Flashing, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Progress events for the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStage {
    CheckingForUpdates,
    RemoteVersion { version: String },
    LocalVersion { version: String },
    Downloading { url: String },
    EnteringBootloader,
    ConnectingDfu,
    /// Flash is about to be erased and rewritten.
    ProgrammingStarted { total: usize },
    Writing { written: usize, total: usize },
    ExitingDfu,
    Complete,
}

impl UpdateStage {
    /// Get a percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            UpdateStage::CheckingForUpdates => 0.0,
            UpdateStage::RemoteVersion { .. } => 5.0,
            UpdateStage::LocalVersion { .. } => 10.0,
            UpdateStage::Downloading { .. } => 15.0,
            UpdateStage::EnteringBootloader => 25.0,
            UpdateStage::ConnectingDfu => 30.0,
            UpdateStage::ProgrammingStarted { .. } => 33.0,
            UpdateStage::Writing { written, total } => {
                if *total == 0 {
                    35.0
                } else {
                    35.0 + (*written as f32 / *total as f32) * 60.0
                }
            }
            UpdateStage::ExitingDfu => 97.0,
            UpdateStage::Complete => 100.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            UpdateStage::CheckingForUpdates => "Checking for updates...".into(),
            UpdateStage::RemoteVersion { version } => format!("Latest version: {}", version),
            UpdateStage::LocalVersion { version } => format!("Local version: {}", version),
            UpdateStage::Downloading { url } => format!("Downloading {}...", url),
            UpdateStage::EnteringBootloader => "Entering bootloader...".into(),
            UpdateStage::ConnectingDfu => "Connecting to bootloader...".into(),
            UpdateStage::ProgrammingStarted { total } => format!(
                "Writing {} bytes. Do not disconnect crow or interrupt the updater until writing completes.",
                total
            ),
            UpdateStage::Writing { written, total } => {
                let percent = if *total == 0 {
                    0
                } else {
                    (written * 100) / total
                };
                format!("Writing memory... {}%", percent)
            }
            UpdateStage::ExitingDfu => "Exiting DFU...".into(),
            UpdateStage::Complete => "Update complete.".into(),
        }
    }
}

/// How a successful run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    UpToDate {
        local: VersionString,
        remote: VersionString,
    },
    Updated {
        from: VersionString,
        to: VersionString,
        bytes_written: usize,
        exit: BestEffort,
    },
    /// The image held no elements; DFU was left without writing.
    NothingToFlash { from: VersionString, to: VersionString },
}

/// Result of a version check without updating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReport {
    pub remote: FirmwareManifest,
    /// `None` when no crow answered on the serial bus.
    pub local: Option<VersionString>,
}

impl VersionReport {
    pub fn update_needed(&self) -> bool {
        match &self.local {
            Some(local) if !local.is_sentinel() => !is_up_to_date(local, &self.remote.version),
            _ => true,
        }
    }
}

/// Drives one update run against injected collaborators.
pub struct UpdateOrchestrator<'a> {
    settings: &'a UpdaterSettings,
    http: &'a dyn HttpClient,
    serial: &'a dyn DeviceConnector,
    usb: &'a dyn DfuConnector,
    state: UpdateState,
}

impl<'a> UpdateOrchestrator<'a> {
    pub fn new(
        settings: &'a UpdaterSettings,
        http: &'a dyn HttpClient,
        serial: &'a dyn DeviceConnector,
        usb: &'a dyn DfuConnector,
    ) -> Self {
        Self {
            settings,
            http,
            serial,
            usb,
            state: UpdateState::Idle,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Report remote and local versions. Touches neither the cache nor the
    /// bootloader, and leaves a running script alone.
    pub fn check(&self) -> UpdateResult<VersionReport> {
        let remote = VersionResolver::new(self.http).resolve_remote(&self.settings.manifest_url)?;
        let local = match self.open_session()? {
            Some(mut session) => Some(VersionResolver::query_version(&mut session)?),
            None => None,
        };
        Ok(VersionReport { remote, local })
    }

    /// Run the whole update. Every error is terminal and leaves the
    /// orchestrator in [`UpdateState::Failed`]. Each call starts from
    /// [`UpdateState::Idle`].
    ///
    /// Errors are returned, not logged above debug; reporting them is the
    /// caller's job.
    pub fn run<F>(&mut self, mut on_progress: F) -> UpdateResult<UpdateOutcome>
    where
        F: FnMut(UpdateStage),
    {
        self.state = UpdateState::Idle;
        match self.execute(&mut on_progress) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                debug!(
                    code = e.error_code(),
                    destructive = e.is_destructive(),
                    error = %e,
                    "update failed"
                );
                self.advance(UpdateState::Failed);
                Err(e)
            }
        }
    }

    fn advance(&mut self, next: UpdateState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        info!(from = %self.state, to = %next, "update state");
        self.state = next;
    }

    fn execute<F>(&mut self, on_progress: &mut F) -> UpdateResult<UpdateOutcome>
    where
        F: FnMut(UpdateStage),
    {
        on_progress(UpdateStage::CheckingForUpdates);
        let manifest =
            VersionResolver::new(self.http).resolve_remote(&self.settings.manifest_url)?;
        on_progress(UpdateStage::RemoteVersion {
            version: manifest.version.to_string(),
        });
        self.advance(UpdateState::VersionChecked);

        let mut session = self.open_session()?;
        let local = match session.as_mut() {
            Some(session) => VersionResolver::read_local_version(session)?,
            None => VersionString::sentinel(),
        };
        on_progress(UpdateStage::LocalVersion {
            version: local.to_string(),
        });

        if !local.is_sentinel() && is_up_to_date(&local, &manifest.version) {
            info!(local = %local, remote = %manifest.version, "crow is up to date");
            self.advance(UpdateState::UpToDate);
            return Ok(UpdateOutcome::UpToDate {
                local,
                remote: manifest.version,
            });
        }

        let fetcher = FirmwareFetcher::new(self.http, &self.settings.cache_path);
        fetcher.ensure_cache_cleared()?;
        on_progress(UpdateStage::Downloading {
            url: manifest.download_url.clone(),
        });
        let image = fetcher.download(&manifest.download_url)?;

        on_progress(UpdateStage::EnteringBootloader);
        match session {
            Some(session) => match self.enter_bootloader(session) {
                BestEffort::Failed(reason) => {
                    warn!(reason = %reason, "could not send bootloader command, trying DFU anyway")
                }
                _ => info!("crow bootloader enabled"),
            },
            None => info!("no crow on serial, assuming it is already in bootloader mode"),
        }
        self.advance(UpdateState::BootloaderEntered);

        on_progress(UpdateStage::ConnectingDfu);
        let transport = self.usb.open()?;
        let mut programmer = DfuProgrammer::init(transport)?;

        let container = DfuSeImage::parse(image.bytes())?;
        if !container
            .suffix
            .matches(self.settings.dfu.vid, self.settings.dfu.pid)
        {
            warn!(
                vendor = format_args!("0x{:04X}", container.suffix.vendor),
                product = format_args!("0x{:04X}", container.suffix.product),
                "firmware image is targeted at a different USB device"
            );
        }
        let elements = container.into_elements();
        debug!(sha256 = %image.sha256(), elements = elements.len(), "firmware image parsed");

        if elements.is_empty() {
            info!("firmware image has nothing to program");
            on_progress(UpdateStage::ExitingDfu);
            self.report_exit(programmer.exit_dfu());
            self.discard(image);
            self.advance(UpdateState::Done);
            on_progress(UpdateStage::Complete);
            return Ok(UpdateOutcome::NothingToFlash {
                from: local,
                to: manifest.version,
            });
        }

        self.advance(UpdateState::Flashing);
        let total: usize = elements.iter().map(MemoryElement::len).sum();
        info!(
            elements = elements.len(),
            bytes = total,
            erase_first = self.settings.dfu.erase_first,
            "writing memory"
        );
        on_progress(UpdateStage::ProgrammingStarted { total });
        let bytes_written =
            programmer.write_elements(&elements, self.settings.dfu.erase_first, |written, total| {
                on_progress(UpdateStage::Writing { written, total })
            })?;

        on_progress(UpdateStage::ExitingDfu);
        let exit = programmer.exit_dfu();
        self.report_exit(exit.clone());

        self.discard(image);
        self.advance(UpdateState::Done);
        on_progress(UpdateStage::Complete);

        Ok(UpdateOutcome::Updated {
            from: local,
            to: manifest.version,
            bytes_written,
            exit,
        })
    }

    /// `None` when no crow is on the serial bus. It may already be in its
    /// bootloader, so this is not an error.
    fn open_session(&self) -> UpdateResult<Option<DeviceSession>> {
        match DeviceSession::connect(self.serial, self.settings.timings.clone()) {
            Ok(session) => Ok(Some(session)),
            Err(UpdateError::Connection { reason }) => {
                warn!(reason = %reason, "no crow found, or it might be in bootloader mode already");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send `^^b` and give the device time to re-enumerate.
    ///
    /// Crow resets instead of answering, so success is never confirmed.
    fn enter_bootloader(&self, mut session: DeviceSession) -> BestEffort {
        let sent = session.write(CrowCommand::Bootloader);
        session.close();

        if let Err(e) = sent {
            return BestEffort::Failed(e.to_string());
        }

        let wait = CrowCommand::Bootloader.wait(&self.settings.timings);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
        BestEffort::Unconfirmed
    }

    fn report_exit(&self, exit: BestEffort) {
        match exit {
            BestEffort::Confirmed => info!("crow left DFU mode"),
            BestEffort::Unconfirmed => {
                warn!("crow did not confirm leaving DFU mode, power-cycle it if it does not restart")
            }
            BestEffort::Failed(reason) => {
                warn!(reason = %reason, "could not leave DFU mode, power-cycle crow to start the new firmware")
            }
        }
    }

    fn discard(&self, image: CachedImage) {
        let path = image.path().display().to_string();
        if let Err(e) = image.discard() {
            warn!(path = %path, error = %e, "could not remove cached firmware");
        }
    }
}

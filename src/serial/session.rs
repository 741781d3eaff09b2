//! Exclusive session with a crow over its serial command channel.

use tracing::{debug, info};

use super::config::CrowCommand;
use super::transport::{DeviceConnector, SerialLink};
use crate::error::UpdateResult;
use crate::settings::CommandTimings;

/// An open connection to exactly one crow.
///
/// The port is released when the session is closed or dropped, so every
/// exit path of the caller gives it back.
pub struct DeviceSession {
    link: Box<dyn SerialLink>,
    timings: CommandTimings,
}

impl DeviceSession {
    /// Open the device's serial endpoint.
    pub fn connect(connector: &dyn DeviceConnector, timings: CommandTimings) -> UpdateResult<Self> {
        let link = connector.connect()?;
        info!(port = %link.port_name(), "connected to crow");
        Ok(Self::from_link(link, timings))
    }

    /// Wrap an already open link.
    pub fn from_link(link: Box<dyn SerialLink>, timings: CommandTimings) -> Self {
        Self { link, timings }
    }

    /// Send a command. Nothing is acknowledged.
    pub fn write(&mut self, command: CrowCommand) -> UpdateResult<()> {
        debug!(command = command.as_str(), "-> crow");
        self.link.write(command.as_str().as_bytes())
    }

    /// Read up to `max_bytes` of whatever the device has printed so far.
    pub fn read(&mut self, max_bytes: usize) -> UpdateResult<String> {
        let bytes = self.link.read_available(max_bytes)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if !text.is_empty() {
            debug!(response = %text, "<- crow");
        }
        Ok(text)
    }

    /// Send a command, sit out its fixed wait, then read what is buffered.
    pub fn send_and_wait(&mut self, command: CrowCommand, max_bytes: usize) -> UpdateResult<String> {
        self.write(command)?;

        let wait = command.wait(&self.timings);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }

        self.read(max_bytes)
    }

    /// Release the port.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        debug!(port = %self.link.port_name(), "closing crow serial port");
    }
}

//! Serial transport for the crow command channel.
//!
//! Provides a trait-based abstraction over the USB serial port,
//! enabling both real hardware and scripted links in tests.

use std::io::{Read, Write};

#[cfg(test)]
use mockall::automock;
use serialport::{available_ports, SerialPort, SerialPortType};
use tracing::debug;

use super::config::SERIAL_READ_TIMEOUT;
use crate::error::{UpdateError, UpdateResult};
use crate::settings::SerialSettings;

/// Byte stream to a crow in application mode.
pub trait SerialLink: Send {
    /// Write all bytes to the device.
    fn write(&mut self, data: &[u8]) -> UpdateResult<()>;

    /// Read up to `max` bytes that are already buffered.
    ///
    /// Never waits for more data to arrive; returns an empty vector when
    /// nothing is pending.
    fn read_available(&mut self, max: usize) -> UpdateResult<Vec<u8>>;

    /// Name of the underlying port, for logging.
    fn port_name(&self) -> String;
}

/// Opens a [`SerialLink`] to the device.
#[cfg_attr(test, automock)]
pub trait DeviceConnector {
    /// Fails with [`UpdateError::Connection`] when no crow is present or the
    /// port is already claimed.
    fn connect(&self) -> UpdateResult<Box<dyn SerialLink>>;
}

/// Serial port transport implementation.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open a serial port at the given baud rate.
    pub fn open(port_name: &str, baud_rate: u32) -> UpdateResult<Self> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(SERIAL_READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| {
                let reason = match e.kind() {
                    serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                        format!("permission denied for port '{}'", port_name)
                    }
                    serialport::ErrorKind::NoDevice => {
                        format!("port '{}' disappeared", port_name)
                    }
                    _ => format!("port '{}' is busy or unusable: {}", port_name, e),
                };
                UpdateError::Connection { reason }
            })?;

        Ok(Self {
            port,
            name: port_name.to_string(),
        })
    }
}

impl SerialLink for SerialTransport {
    fn write(&mut self, data: &[u8]) -> UpdateResult<()> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_available(&mut self, max: usize) -> UpdateResult<Vec<u8>> {
        let pending = self.port.bytes_to_read()? as usize;
        let wanted = pending.min(max);
        let mut buffer = vec![0u8; wanted];
        let mut filled = 0;

        while filled < wanted {
            match self.port.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(UpdateError::Io(e)),
            }
        }

        buffer.truncate(filled);
        Ok(buffer)
    }

    fn port_name(&self) -> String {
        self.name.clone()
    }
}

/// Find the serial port of a crow by USB VID/PID.
///
/// On macOS, `tty.*` ports are skipped in favour of the `cu.*` twin
/// that doesn't block waiting for DCD.
pub fn find_crow_port(vid: u16, pid: u16) -> Option<String> {
    let ports = available_ports().ok()?;

    ports.into_iter().find_map(|port| {
        #[cfg(target_os = "macos")]
        if port.port_name.contains("/dev/tty.") {
            return None;
        }

        match port.port_type {
            SerialPortType::UsbPort(info) if info.vid == vid && info.pid == pid => {
                Some(port.port_name)
            }
            _ => None,
        }
    })
}

/// Connects to the first crow found on the USB serial bus.
pub struct UsbSerialConnector {
    settings: SerialSettings,
}

impl UsbSerialConnector {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

impl DeviceConnector for UsbSerialConnector {
    fn connect(&self) -> UpdateResult<Box<dyn SerialLink>> {
        let port_name = find_crow_port(self.settings.vid, self.settings.pid).ok_or_else(|| {
            UpdateError::Connection {
                reason: format!(
                    "no serial port with USB VID:PID={:04X}:{:04X}",
                    self.settings.vid, self.settings.pid
                ),
            }
        })?;

        debug!(port = %port_name, "opening crow serial port");
        let transport = SerialTransport::open(&port_name, self.settings.baud_rate)?;
        Ok(Box::new(transport))
    }
}

//! USB transport for the DfuSe bootloader.
//!
//! Provides a trait-based abstraction over DFU class control transfers,
//! enabling both real hardware and a simulated target in tests.

use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use rusb::{DeviceHandle, GlobalContext, InterfaceDescriptor};
use tracing::{debug, info, warn};

use super::config::{
    DfuRequest, DEFAULT_TRANSFER_SIZE, DFU_FUNCTIONAL_DESCRIPTOR, DFU_INTERFACE,
    DFU_INTERFACE_CLASS, DFU_INTERFACE_SUBCLASS, REQUEST_TYPE_IN, REQUEST_TYPE_OUT,
};
use crate::error::{UpdateError, UpdateResult};
use crate::settings::DfuSettings;

/// Control-transfer access to a claimed DFU interface.
pub trait DfuTransport: Send {
    /// Host-to-device class request. Returns bytes sent.
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> UpdateResult<usize>;

    /// Device-to-host class request. Returns bytes received.
    fn control_in(&mut self, request: DfuRequest, value: u16, buf: &mut [u8])
        -> UpdateResult<usize>;

    /// Largest DNLOAD payload the device accepts.
    fn transfer_size(&self) -> u16;

    /// The interface string describing the flash layout.
    fn memory_layout(&mut self) -> UpdateResult<String>;

    /// Give the interface back to the OS.
    fn release(&mut self) -> UpdateResult<()>;
}

/// Finds and claims the DFU interface.
#[cfg_attr(test, automock)]
pub trait DfuConnector {
    /// Fails with [`UpdateError::DeviceNotFound`] when no single DFU
    /// device with the configured VID/PID is attached.
    fn open(&self) -> UpdateResult<Box<dyn DfuTransport>>;
}

/// DFU interface of a real device, driven through libusb.
pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    transfer_size: u16,
    layout: Option<String>,
    timeout: Duration,
    claimed: bool,
}

impl UsbTransport {
    /// Open the only attached device matching `vid:pid` and claim its DFU interface.
    pub fn open(vid: u16, pid: u16, timeout: Duration) -> UpdateResult<Self> {
        let mut matches = Vec::new();
        for device in rusb::devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(error = %e, "skipping USB device without descriptor");
                    continue;
                }
            };
            if descriptor.vendor_id() == vid && descriptor.product_id() == pid {
                matches.push(device);
            }
        }

        let device = match matches.len() {
            0 => {
                return Err(UpdateError::DeviceNotFound {
                    reason: format!("no USB device with VID:PID={:04X}:{:04X}", vid, pid),
                })
            }
            1 => matches.remove(0),
            n => {
                return Err(UpdateError::DeviceNotFound {
                    reason: format!(
                        "ambiguous: {} devices with VID:PID={:04X}:{:04X}, unplug all but one",
                        n, vid, pid
                    ),
                })
            }
        };

        let handle = device.open()?;
        handle.set_auto_detach_kernel_driver(true).ok();
        // Already configured on most hosts.
        handle.set_active_configuration(1).ok();

        let config = device.active_config_descriptor()?;
        let dfu_interface = config
            .interfaces()
            .flat_map(|interface| interface.descriptors())
            .find(|desc| {
                desc.interface_number() == DFU_INTERFACE
                    && desc.setting_number() == 0
                    && desc.class_code() == DFU_INTERFACE_CLASS
                    && desc.sub_class_code() == DFU_INTERFACE_SUBCLASS
            })
            .ok_or_else(|| UpdateError::DeviceNotFound {
                reason: format!(
                    "device {:04X}:{:04X} has no DFU interface {}",
                    vid, pid, DFU_INTERFACE
                ),
            })?;

        let transfer_size = transfer_size_from(dfu_interface.extra()).unwrap_or_else(|| {
            warn!(
                default = DEFAULT_TRANSFER_SIZE,
                "no DFU functional descriptor, using default transfer size"
            );
            DEFAULT_TRANSFER_SIZE
        });
        let layout = read_interface_name(&handle, &dfu_interface, timeout);

        handle.claim_interface(DFU_INTERFACE)?;
        info!(
            bus = device.bus_number(),
            address = device.address(),
            transfer_size,
            "claimed DFU interface"
        );

        Ok(Self {
            handle,
            interface: DFU_INTERFACE,
            transfer_size,
            layout,
            timeout,
            claimed: true,
        })
    }
}

impl DfuTransport for UsbTransport {
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> UpdateResult<usize> {
        let sent = self.handle.write_control(
            REQUEST_TYPE_OUT,
            request as u8,
            value,
            self.interface as u16,
            data,
            self.timeout,
        )?;
        Ok(sent)
    }

    fn control_in(
        &mut self,
        request: DfuRequest,
        value: u16,
        buf: &mut [u8],
    ) -> UpdateResult<usize> {
        let received = self.handle.read_control(
            REQUEST_TYPE_IN,
            request as u8,
            value,
            self.interface as u16,
            buf,
            self.timeout,
        )?;
        Ok(received)
    }

    fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    fn memory_layout(&mut self) -> UpdateResult<String> {
        self.layout.clone().ok_or_else(|| UpdateError::DfuProtocol {
            operation: "read memory layout".to_string(),
            reason: "DFU interface has no name string".to_string(),
        })
    }

    fn release(&mut self) -> UpdateResult<()> {
        if self.claimed {
            self.claimed = false;
            self.handle.release_interface(self.interface)?;
            debug!("released DFU interface");
        }
        Ok(())
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            debug!(error = %e, "DFU interface already gone");
        }
    }
}

/// Pull `wTransferSize` out of the class-specific descriptors trailing an
/// interface descriptor.
pub fn transfer_size_from(extra: &[u8]) -> Option<u16> {
    let mut rest = extra;
    while rest.len() >= 2 {
        let length = rest[0] as usize;
        if length < 2 || length > rest.len() {
            return None;
        }
        if rest[1] == DFU_FUNCTIONAL_DESCRIPTOR && length >= 7 {
            return Some(u16::from_le_bytes([rest[5], rest[6]]));
        }
        rest = &rest[length..];
    }
    None
}

fn read_interface_name(
    handle: &DeviceHandle<GlobalContext>,
    interface: &InterfaceDescriptor<'_>,
    timeout: Duration,
) -> Option<String> {
    let language = match handle.read_languages(timeout) {
        Ok(languages) => *languages.first()?,
        Err(e) => {
            warn!(error = %e, "could not read USB string languages");
            return None;
        }
    };

    match handle.read_interface_string(language, interface, timeout) {
        Ok(name) => {
            debug!(name = %name, "DFU interface string");
            Some(name)
        }
        Err(e) => {
            warn!(error = %e, "could not read DFU interface string");
            None
        }
    }
}

/// Opens the crow bootloader over libusb.
pub struct UsbDfuConnector {
    settings: DfuSettings,
}

impl UsbDfuConnector {
    pub fn new(settings: DfuSettings) -> Self {
        Self { settings }
    }
}

impl DfuConnector for UsbDfuConnector {
    fn open(&self) -> UpdateResult<Box<dyn DfuTransport>> {
        let transport = UsbTransport::open(
            self.settings.vid,
            self.settings.pid,
            self.settings.usb_timeout(),
        )?;
        Ok(Box::new(transport))
    }
}

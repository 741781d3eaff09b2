//! Serial side of crow: discovery, the command table and the session.

pub mod config;
pub mod session;
pub mod transport;

pub use config::{CrowCommand, READ_ALL, VERSION_READ_LIMIT};
pub use session::DeviceSession;
pub use transport::{DeviceConnector, UsbSerialConnector};

#[cfg(test)]
pub use transport::MockDeviceConnector;

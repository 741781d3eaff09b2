//! USB DFU flashing for the STM32 bootloader crow resets into.
//!
//! # Flow Overview
//!
//! 1. **Container** - Parse the DfuSe file into ordered memory elements
//! 2. **Transport** - Find the bootloader by VID/PID and claim interface 0
//! 3. **Programmer** - Normalise to dfuIDLE, erase and write each element
//! 4. **Exit** - Point at the application and leave DFU mode
//!
//! # Example
//!
//! ```ignore
//! use dfu::{DfuConnector, DfuProgrammer, DfuSeImage, UsbDfuConnector};
//!
//! let elements = DfuSeImage::parse(&bytes)?.into_elements();
//! let transport = UsbDfuConnector::new(settings.dfu.clone()).open()?;
//! let mut programmer = DfuProgrammer::init(transport)?;
//! programmer.write_elements(&elements, true, |written, total| {
//!     println!("{}/{} bytes", written, total)
//! })?;
//! programmer.exit_dfu();
//! ```

pub mod config;
pub mod container;
pub mod memory;
pub mod programmer;
pub mod transport;

pub use container::{DfuSeImage, MemoryElement};
pub use programmer::DfuProgrammer;
pub use transport::{DfuConnector, UsbDfuConnector};

#[cfg(test)]
pub use transport::MockDfuConnector;

//! The crow command channel.
//!
//! Four two-caret commands, no framing, no checksum. Each one is followed
//! by a fixed wait before whatever the device printed is read back.

use std::time::Duration;

use crate::settings::CommandTimings;

/// Read limit used when draining a command's full output.
pub const READ_ALL: usize = 1_000_000;

/// Read limit for the `^^v` reply.
pub const VERSION_READ_LIMIT: usize = 100;

/// Serial read timeout for a single `read` call on the port.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Commands understood by crow firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrowCommand {
    /// `^^p`: print the current script. The updater never sends it.
    #[allow(dead_code)]
    PrintScript,
    /// `^^c`: clear the running script.
    ClearScript,
    /// `^^v`: report the firmware version as a quoted token.
    Version,
    /// `^^b`: reset into the STM32 DFU bootloader.
    Bootloader,
}

impl CrowCommand {
    /// Wire text of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            CrowCommand::PrintScript => "^^p",
            CrowCommand::ClearScript => "^^c",
            CrowCommand::Version => "^^v",
            CrowCommand::Bootloader => "^^b",
        }
    }

    /// How long the device needs before its answer is in the buffer.
    pub fn wait(&self, timings: &CommandTimings) -> Duration {
        let ms = match self {
            CrowCommand::PrintScript => timings.print_script_ms,
            CrowCommand::ClearScript => timings.clear_script_ms,
            CrowCommand::Version => timings.version_ms,
            CrowCommand::Bootloader => timings.bootloader_ms,
        };
        Duration::from_millis(ms)
    }
}

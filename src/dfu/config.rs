//! Constants for the USB DFU class protocol with ST's DfuSe extensions.

// Full request and state tables; not every entry is used by this tool.
#![allow(dead_code)]

use std::fmt;

// ============================================================================
// USB
// ============================================================================

/// DFU mode interface number.
pub const DFU_INTERFACE: u8 = 0;

/// bmRequestType for host-to-device class requests to an interface.
pub const REQUEST_TYPE_OUT: u8 = 0x21;

/// bmRequestType for device-to-host class requests to an interface.
pub const REQUEST_TYPE_IN: u8 = 0xA1;

/// Interface class code of a DFU interface.
pub const DFU_INTERFACE_CLASS: u8 = 0xFE;

/// Interface subclass code of a DFU interface.
pub const DFU_INTERFACE_SUBCLASS: u8 = 0x01;

/// Descriptor type of the DFU functional descriptor.
pub const DFU_FUNCTIONAL_DESCRIPTOR: u8 = 0x21;

/// Transfer size used when the functional descriptor can't be found.
pub const DEFAULT_TRANSFER_SIZE: u16 = 2048;

/// Length of a GETSTATUS reply.
pub const STATUS_LENGTH: usize = 6;

/// GETSTATUS probes spent bringing a fresh device to dfuIDLE.
pub const IDLE_PROBES: usize = 4;

// ============================================================================
// DfuSe
// ============================================================================

/// Block number carrying DfuSe commands.
pub const COMMAND_BLOCK: u16 = 0;

/// Block number of the first data block at the address pointer.
pub const DATA_BLOCK: u16 = 2;

/// DfuSe "Set Address Pointer" command byte.
pub const CMD_SET_ADDRESS: u8 = 0x21;

/// DfuSe "Erase" command byte.
pub const CMD_ERASE: u8 = 0x41;

/// Where the application starts; jumped to when leaving DFU.
pub const APPLICATION_ADDRESS: u32 = 0x0800_0000;

/// DFU class requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0,
    Dnload = 1,
    Upload = 2,
    GetStatus = 3,
    ClrStatus = 4,
    GetState = 5,
    Abort = 6,
}

/// bState values reported by GETSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0,
    AppDetach = 1,
    DfuIdle = 2,
    DnloadSync = 3,
    DnBusy = 4,
    DnloadIdle = 5,
    ManifestSync = 6,
    Manifest = 7,
    ManifestWaitReset = 8,
    UploadIdle = 9,
    Error = 10,
}

impl DfuState {
    /// Parse a state from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DfuState::AppIdle),
            1 => Some(DfuState::AppDetach),
            2 => Some(DfuState::DfuIdle),
            3 => Some(DfuState::DnloadSync),
            4 => Some(DfuState::DnBusy),
            5 => Some(DfuState::DnloadIdle),
            6 => Some(DfuState::ManifestSync),
            7 => Some(DfuState::Manifest),
            8 => Some(DfuState::ManifestWaitReset),
            9 => Some(DfuState::UploadIdle),
            10 => Some(DfuState::Error),
            _ => None,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DfuState::AppIdle => "appIDLE",
            DfuState::AppDetach => "appDETACH",
            DfuState::DfuIdle => "dfuIDLE",
            DfuState::DnloadSync => "dfuDNLOAD-SYNC",
            DfuState::DnBusy => "dfuDNBUSY",
            DfuState::DnloadIdle => "dfuDNLOAD-IDLE",
            DfuState::ManifestSync => "dfuMANIFEST-SYNC",
            DfuState::Manifest => "dfuMANIFEST",
            DfuState::ManifestWaitReset => "dfuMANIFEST-WAIT-RESET",
            DfuState::UploadIdle => "dfuUPLOAD-IDLE",
            DfuState::Error => "dfuERROR",
        };
        f.write_str(name)
    }
}

/// Get a human-readable description of a bStatus code.
pub fn status_description(status: u8) -> &'static str {
    match status {
        0x00 => "OK",
        0x01 => "errTARGET: file is not targeted for this device",
        0x02 => "errFILE: file fails a vendor-specific check",
        0x03 => "errWRITE: device is unable to write memory",
        0x04 => "errERASE: memory erase failed",
        0x05 => "errCHECK_ERASED: memory erase check failed",
        0x06 => "errPROG: program memory failed",
        0x07 => "errVERIFY: programmed memory failed verification",
        0x08 => "errADDRESS: address out of range",
        0x09 => "errNOTDONE: unexpected end of data",
        0x0A => "errFIRMWARE: firmware is corrupt",
        0x0B => "errVENDOR: vendor-specific error",
        0x0C => "errUSBR: unexpected USB reset",
        0x0D => "errPOR: unexpected power on reset",
        0x0E => "errUNKNOWN",
        0x0F => "errSTALLEDPKT: unexpected request",
        _ => "unrecognised status",
    }
}

/// Decoded GETSTATUS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: u8,
    pub poll_timeout_ms: u32,
    pub state: DfuState,
}

impl DfuStatus {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < STATUS_LENGTH {
            return None;
        }
        let poll_timeout_ms = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], 0]);
        let state = DfuState::from_byte(bytes[4])?;
        Some(Self {
            status: bytes[0],
            poll_timeout_ms,
            state,
        })
    }
}

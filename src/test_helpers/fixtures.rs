use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::dfu::config::{DfuRequest, DfuState, CMD_ERASE, CMD_SET_ADDRESS, STATUS_LENGTH};
use crate::dfu::container::{checksum, MemoryElement, TARGET_NAME_LEN};
use crate::dfu::memory::{parse_memory_layout, segment_for, MemorySegment};
use crate::dfu::transport::DfuTransport;
use crate::error::{UpdateError, UpdateResult};
use crate::serial::transport::SerialLink;

/// Serial link that answers each command with canned text.
pub struct ScriptedLink {
    replies: HashMap<String, String>,
    failing: HashSet<String>,
    buffer: Vec<u8>,
    sent: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            failing: HashSet::new(),
            buffer: Vec::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Buffer `text` whenever `command` is written.
    pub fn reply(mut self, command: &str, text: &str) -> Self {
        self.replies.insert(command.to_string(), text.to_string());
        self
    }

    /// Make writing `command` fail like an unplugged port.
    pub fn fail_on(mut self, command: &str) -> Self {
        self.failing.insert(command.to_string());
        self
    }

    /// Everything written so far, shared with the test.
    pub fn sent(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent)
    }
}

impl Default for ScriptedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink for ScriptedLink {
    fn write(&mut self, data: &[u8]) -> UpdateResult<()> {
        let command = String::from_utf8_lossy(data).into_owned();
        if self.failing.contains(&command) {
            return Err(UpdateError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "device went away",
            )));
        }
        if let Some(reply) = self.replies.get(&command) {
            self.buffer.extend_from_slice(reply.as_bytes());
        }
        self.sent.lock().unwrap().push(command);
        Ok(())
    }

    fn read_available(&mut self, max: usize) -> UpdateResult<Vec<u8>> {
        let take = max.min(self.buffer.len());
        Ok(self.buffer.drain(..take).collect())
    }

    fn port_name(&self) -> String {
        "scripted".to_string()
    }
}

/// Builder for DfuSe container bytes.
pub struct DfuSeBuilder {
    targets: Vec<(u8, String, Vec<MemoryElement>)>,
    vendor: u16,
    product: u16,
}

impl DfuSeBuilder {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            vendor: 0x0483,
            product: 0xDF11,
        }
    }

    /// Add a target. An empty name makes it unnamed.
    pub fn target(mut self, alt_setting: u8, name: &str, elements: Vec<MemoryElement>) -> Self {
        self.targets.push((alt_setting, name.to_string(), elements));
        self
    }

    pub fn ids(mut self, vendor: u16, product: u16) -> Self {
        self.vendor = vendor;
        self.product = product;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"DfuSe");
        out.push(1);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.push(self.targets.len() as u8);

        for (alt_setting, name, elements) in &self.targets {
            let mut image = Vec::new();
            for element in elements {
                image.extend_from_slice(&element.address.to_le_bytes());
                image.extend_from_slice(&(element.data.len() as u32).to_le_bytes());
                image.extend_from_slice(&element.data);
            }

            let mut raw_name = [0u8; TARGET_NAME_LEN];
            raw_name[..name.len()].copy_from_slice(name.as_bytes());

            out.extend_from_slice(b"Target");
            out.push(*alt_setting);
            out.extend_from_slice(&u32::from(!name.is_empty()).to_le_bytes());
            out.extend_from_slice(&raw_name);
            out.extend_from_slice(&(image.len() as u32).to_le_bytes());
            out.extend_from_slice(&(elements.len() as u32).to_le_bytes());
            out.extend_from_slice(&image);
        }

        let size = out.len() as u32;
        out[6..10].copy_from_slice(&size.to_le_bytes());

        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.product.to_le_bytes());
        out.extend_from_slice(&self.vendor.to_le_bytes());
        out.extend_from_slice(&0x011Au16.to_le_bytes());
        out.extend_from_slice(b"UFD");
        out.push(16);
        out.extend_from_slice(&[0; 4]);
        reseal(out)
    }
}

impl Default for DfuSeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompute the suffix CRC after editing container bytes.
pub fn reseal(mut bytes: Vec<u8>) -> Vec<u8> {
    let at = bytes.len() - 4;
    let crc = checksum(&bytes[..at]);
    bytes[at..].copy_from_slice(&crc.to_le_bytes());
    bytes
}

/// Flash layout of the simulated bootloader: 1K pages, then 16K pages.
pub const SIMULATED_LAYOUT: &str = "@Internal Flash  /0x08000000/16*001Kg,04*016Kg";

enum Pending {
    SetAddress(u32),
    Erase(u32),
    Write(u32, Vec<u8>),
    Leave,
    Stall,
}

struct TargetState {
    state: DfuState,
    status: u8,
    pending: Option<Pending>,
    pointer: u32,
    memory: BTreeMap<u32, u8>,
    layout: Vec<MemorySegment>,
    transfer_size: u16,
    erased: Vec<u32>,
    erased_set: BTreeSet<u32>,
    require_erase: bool,
    fail_write_at: Option<u32>,
    silent_on_leave: bool,
    left: bool,
    released: bool,
    write_addresses: Vec<u32>,
}

impl TargetState {
    fn execute(&mut self, op: Pending) -> Result<(), u8> {
        match op {
            Pending::SetAddress(address) => {
                self.pointer = address;
                Ok(())
            }
            Pending::Erase(address) => {
                let segment = *segment_for(&self.layout, address).ok_or(0x08u8)?;
                let page = segment.page_start(address);
                let end = page + segment.page_size;
                let programmed: Vec<u32> = self.memory.range(page..end).map(|(a, _)| *a).collect();
                for a in programmed {
                    self.memory.remove(&a);
                }
                self.erased.push(page);
                self.erased_set.insert(page);
                Ok(())
            }
            Pending::Write(address, data) => {
                self.write_addresses.push(address);
                let end = address as u64 + data.len() as u64;
                if let Some(fail) = self.fail_write_at {
                    if (address as u64..end).contains(&(fail as u64)) {
                        return Err(0x03);
                    }
                }
                for (i, byte) in data.into_iter().enumerate() {
                    let at = address + i as u32;
                    if self.require_erase {
                        let page = segment_for(&self.layout, at)
                            .map(|segment| segment.page_start(at))
                            .ok_or(0x08u8)?;
                        if !self.erased_set.contains(&page) || self.memory.contains_key(&at) {
                            return Err(0x06);
                        }
                    }
                    self.memory.insert(at, byte);
                }
                Ok(())
            }
            Pending::Leave => {
                self.left = true;
                Ok(())
            }
            Pending::Stall => Err(0x0F),
        }
    }
}

/// In-memory DfuSe bootloader.
///
/// Clones share the same device, so a test keeps one to inspect flash
/// after handing another to the code under test.
#[derive(Clone)]
pub struct SimulatedTarget {
    inner: Arc<Mutex<TargetState>>,
}

impl SimulatedTarget {
    pub fn new() -> Self {
        let layout = parse_memory_layout(SIMULATED_LAYOUT).expect("valid simulated layout");
        Self {
            inner: Arc::new(Mutex::new(TargetState {
                state: DfuState::DfuIdle,
                status: 0,
                pending: None,
                pointer: 0,
                memory: BTreeMap::new(),
                layout,
                transfer_size: 256,
                erased: Vec::new(),
                erased_set: BTreeSet::new(),
                require_erase: false,
                fail_write_at: None,
                silent_on_leave: false,
                left: false,
                released: false,
                write_addresses: Vec::new(),
            })),
        }
    }

    pub fn starting_in(self, state: DfuState) -> Self {
        self.inner.lock().unwrap().state = state;
        self
    }

    /// Reject writes to pages that were not erased in this session.
    pub fn require_erase(self) -> Self {
        self.inner.lock().unwrap().require_erase = true;
        self
    }

    /// Report errWRITE for the block covering `address`.
    pub fn fail_write_at(self, address: u32) -> Self {
        self.inner.lock().unwrap().fail_write_at = Some(address);
        self
    }

    /// Drop off the bus instead of answering the leave request.
    pub fn silent_on_leave(self) -> Self {
        self.inner.lock().unwrap().silent_on_leave = true;
        self
    }

    pub fn state(&self) -> DfuState {
        self.inner.lock().unwrap().state
    }

    /// Flash contents; unprogrammed bytes read as 0xFF.
    pub fn read(&self, address: u32, len: usize) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        (0..len as u32)
            .map(|i| *inner.memory.get(&(address + i)).unwrap_or(&0xFF))
            .collect()
    }

    /// Erased page addresses in erase order.
    pub fn erased_pages(&self) -> Vec<u32> {
        self.inner.lock().unwrap().erased.clone()
    }

    /// Start address of every data block received, in order.
    pub fn write_addresses(&self) -> Vec<u32> {
        self.inner.lock().unwrap().write_addresses.clone()
    }

    pub fn left_dfu(&self) -> bool {
        self.inner.lock().unwrap().left
    }

    pub fn released(&self) -> bool {
        self.inner.lock().unwrap().released
    }
}

impl Default for SimulatedTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl DfuTransport for SimulatedTarget {
    fn control_out(&mut self, request: DfuRequest, value: u16, data: &[u8]) -> UpdateResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        match request {
            DfuRequest::Dnload => {
                if inner.state == DfuState::Error || inner.left {
                    return Err(UpdateError::Usb(rusb::Error::Pipe));
                }
                let op = if value == 0 {
                    match data {
                        [] => Pending::Leave,
                        [CMD_SET_ADDRESS, a @ ..] if a.len() == 4 => {
                            Pending::SetAddress(u32::from_le_bytes([a[0], a[1], a[2], a[3]]))
                        }
                        [CMD_ERASE, a @ ..] if a.len() == 4 => {
                            Pending::Erase(u32::from_le_bytes([a[0], a[1], a[2], a[3]]))
                        }
                        _ => Pending::Stall,
                    }
                } else {
                    let offset = (value as u32).saturating_sub(2) * inner.transfer_size as u32;
                    Pending::Write(inner.pointer + offset, data.to_vec())
                };
                inner.pending = Some(op);
                inner.state = DfuState::DnloadSync;
                Ok(data.len())
            }
            DfuRequest::ClrStatus | DfuRequest::Abort => {
                inner.pending = None;
                inner.status = 0;
                inner.state = DfuState::DfuIdle;
                Ok(0)
            }
            _ => Ok(0),
        }
    }

    fn control_in(&mut self, request: DfuRequest, _value: u16, buf: &mut [u8]) -> UpdateResult<usize> {
        let mut inner = self.inner.lock().unwrap();
        if request != DfuRequest::GetStatus || buf.len() < STATUS_LENGTH {
            return Err(UpdateError::Usb(rusb::Error::Pipe));
        }

        if let Some(op) = inner.pending.take() {
            let leaving = matches!(op, Pending::Leave);
            match inner.execute(op) {
                Ok(()) if leaving => inner.state = DfuState::Manifest,
                Ok(()) => inner.state = DfuState::DnBusy,
                Err(status) => {
                    inner.status = status;
                    inner.state = DfuState::Error;
                }
            }
        } else if inner.state == DfuState::DnBusy {
            inner.state = DfuState::DnloadIdle;
        }

        if inner.left && inner.silent_on_leave {
            return Err(UpdateError::Usb(rusb::Error::NoDevice));
        }

        buf[..STATUS_LENGTH].copy_from_slice(&[inner.status, 0, 0, 0, inner.state as u8, 0]);
        Ok(STATUS_LENGTH)
    }

    fn transfer_size(&self) -> u16 {
        self.inner.lock().unwrap().transfer_size
    }

    fn memory_layout(&mut self) -> UpdateResult<String> {
        Ok(SIMULATED_LAYOUT.to_string())
    }

    fn release(&mut self) -> UpdateResult<()> {
        self.inner.lock().unwrap().released = true;
        Ok(())
    }
}

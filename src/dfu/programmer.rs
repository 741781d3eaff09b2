//! DfuSe programming sequence on top of a [`DfuTransport`].
//!
//! Orchestrates one flash session:
//! 1. Normalise the bootloader to dfuIDLE
//! 2. Per element: erase each touched page once, then write it in
//!    transfer-size blocks at an explicit address pointer
//! 3. Leave DFU by jumping to the application

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::config::{
    status_description, DfuRequest, DfuState, DfuStatus, APPLICATION_ADDRESS, CMD_ERASE,
    CMD_SET_ADDRESS, COMMAND_BLOCK, DATA_BLOCK, IDLE_PROBES, STATUS_LENGTH,
};
use super::container::MemoryElement;
use super::memory::{parse_memory_layout, segment_for, MemorySegment};
use super::transport::DfuTransport;
use crate::error::{BestEffort, UpdateError, UpdateResult};

/// An initialised DFU session with the bootloader.
pub struct DfuProgrammer {
    transport: Box<dyn DfuTransport>,
    layout: Vec<MemorySegment>,
}

impl DfuProgrammer {
    /// Bring a freshly claimed interface to dfuIDLE and read its memory map.
    pub fn init(transport: Box<dyn DfuTransport>) -> UpdateResult<Self> {
        let mut programmer = Self {
            transport,
            layout: Vec::new(),
        };
        programmer.enter_idle()?;

        let descriptor = programmer.transport.memory_layout()?;
        programmer.layout = parse_memory_layout(&descriptor)?;
        info!(
            layout = %descriptor,
            transfer_size = programmer.transport.transfer_size(),
            "DFU session ready"
        );

        Ok(programmer)
    }

    #[cfg(test)]
    pub fn layout(&self) -> &[MemorySegment] {
        &self.layout
    }

    fn enter_idle(&mut self) -> UpdateResult<()> {
        for _ in 0..IDLE_PROBES {
            let status = self.get_status()?;
            match status.state {
                DfuState::DfuIdle => return Ok(()),
                DfuState::DnloadIdle | DfuState::UploadIdle => {
                    debug!(state = %status.state, "aborting pending transfer");
                    self.abort()?;
                }
                _ => {
                    debug!(state = %status.state, "clearing bootloader status");
                    self.clr_status()?;
                }
            }
        }

        let status = self.get_status()?;
        if status.state == DfuState::DfuIdle {
            Ok(())
        } else {
            Err(protocol_error(
                "init",
                format!("bootloader stuck in {}", status.state),
            ))
        }
    }

    /// GETSTATUS, honouring the poll timeout the device asks for while busy.
    pub fn get_status(&mut self) -> UpdateResult<DfuStatus> {
        let mut buf = [0u8; STATUS_LENGTH];
        let received = self.transport.control_in(DfuRequest::GetStatus, 0, &mut buf)?;
        let status = DfuStatus::parse(&buf[..received]).ok_or_else(|| {
            protocol_error("get status", format!("malformed reply {:02X?}", &buf[..received]))
        })?;

        if status.state == DfuState::DnBusy && status.poll_timeout_ms > 0 {
            std::thread::sleep(Duration::from_millis(status.poll_timeout_ms as u64));
        }
        Ok(status)
    }

    pub fn clr_status(&mut self) -> UpdateResult<()> {
        self.transport.control_out(DfuRequest::ClrStatus, 0, &[])?;
        Ok(())
    }

    pub fn abort(&mut self) -> UpdateResult<()> {
        self.transport.control_out(DfuRequest::Abort, 0, &[])?;
        Ok(())
    }

    /// Point subsequent data blocks at `address`.
    pub fn set_address(&mut self, address: u32) -> UpdateResult<()> {
        self.command(CMD_SET_ADDRESS, address, "set address")
    }

    /// Erase the flash page starting at `address`.
    pub fn page_erase(&mut self, address: u32) -> UpdateResult<()> {
        debug!(address = format_args!("0x{:08X}", address), "erasing page");
        self.command(CMD_ERASE, address, "page erase")
    }

    fn command(&mut self, opcode: u8, address: u32, operation: &str) -> UpdateResult<()> {
        let mut payload = [0u8; 5];
        payload[0] = opcode;
        payload[1..].copy_from_slice(&address.to_le_bytes());

        self.transport
            .control_out(DfuRequest::Dnload, COMMAND_BLOCK, &payload)?;
        self.expect_state(DfuState::DnBusy, operation)?;
        self.expect_state(DfuState::DnloadIdle, operation)
    }

    /// Write `data` at `address` in transfer-size blocks. Does not erase.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> UpdateResult<()> {
        let block = self.transport.transfer_size().max(1) as usize;
        let mut offset = 0;

        while offset < data.len() {
            let chunk = block.min(data.len() - offset);
            let block_address = u32::try_from(offset)
                .ok()
                .and_then(|offset| address.checked_add(offset))
                .ok_or_else(|| {
                    protocol_error("write memory", "address past 0xFFFFFFFF".to_string())
                })?;
            self.set_address(block_address)?;
            self.transport.control_out(
                DfuRequest::Dnload,
                DATA_BLOCK,
                &data[offset..offset + chunk],
            )?;
            self.expect_state(DfuState::DnBusy, "write memory")?;
            self.expect_state(DfuState::DnloadIdle, "write memory")?;
            offset += chunk;
        }

        Ok(())
    }

    fn expect_state(&mut self, expected: DfuState, operation: &str) -> UpdateResult<()> {
        let status = self.get_status()?;
        if status.state == expected {
            return Ok(());
        }
        Err(protocol_error(
            operation,
            format!(
                "expected {}, device is in {} ({})",
                expected,
                status.state,
                status_description(status.status)
            ),
        ))
    }

    /// Program `elements` in order.
    ///
    /// `progress` gets the cumulative and total payload bytes after each
    /// element. Returns the number of bytes written. Any failure is a
    /// [`UpdateError::FlashWrite`] at the address being programmed.
    pub fn write_elements<F>(
        &mut self,
        elements: &[MemoryElement],
        erase_first: bool,
        mut progress: F,
    ) -> UpdateResult<usize>
    where
        F: FnMut(usize, usize),
    {
        let total: usize = elements.iter().map(MemoryElement::len).sum();
        let mut written = 0;
        let mut erased = BTreeSet::new();

        for element in elements {
            info!(
                address = format_args!("0x{:08X}", element.address),
                size = element.len(),
                "writing element"
            );
            self.write_element(element, erase_first, &mut erased)?;

            written += element.len();
            progress(written, total);
        }

        Ok(written)
    }

    fn write_element(
        &mut self,
        element: &MemoryElement,
        erase_first: bool,
        erased: &mut BTreeSet<u32>,
    ) -> UpdateResult<()> {
        let mut offset = 0;

        while offset < element.len() {
            let remaining = element.len() - offset;
            let address = u32::try_from(offset)
                .ok()
                .and_then(|offset| element.address.checked_add(offset))
                .ok_or_else(|| UpdateError::FlashWrite {
                    address: element.address,
                    reason: "element runs past the end of the address space".to_string(),
                })?;
            let flash_error = |e: UpdateError| UpdateError::FlashWrite {
                address,
                reason: e.to_string(),
            };

            let mut size = remaining;
            if erase_first {
                match segment_for(&self.layout, address).copied() {
                    Some(segment) => {
                        let page = segment.page_start(address);
                        let page_end = page as u64 + segment.page_size as u64;
                        size = remaining.min((page_end - address as u64) as usize);
                        // Pages shared with an earlier element keep that element's data.
                        if erased.insert(page) {
                            self.page_erase(page).map_err(flash_error)?;
                        }
                    }
                    None => warn!(
                        address = format_args!("0x{:08X}", address),
                        "address outside the advertised flash, writing without erase"
                    ),
                }
            }

            self.write_memory(address, &element.data[offset..offset + size])
                .map_err(flash_error)?;
            offset += size;
        }

        Ok(())
    }

    /// Jump to the application and release the interface.
    ///
    /// The device resets as it leaves, so a missing answer is expected
    /// rather than alarming.
    pub fn exit_dfu(mut self) -> BestEffort {
        let outcome = self.leave();
        if let Err(e) = self.transport.release() {
            debug!(error = %e, "could not release DFU interface");
        }
        outcome
    }

    fn leave(&mut self) -> BestEffort {
        if let Err(e) = self.set_address(APPLICATION_ADDRESS) {
            return BestEffort::Failed(e.to_string());
        }
        if let Err(e) = self.transport.control_out(DfuRequest::Dnload, COMMAND_BLOCK, &[]) {
            return BestEffort::Failed(e.to_string());
        }

        match self.get_status() {
            Ok(status) if status.state == DfuState::Manifest => BestEffort::Confirmed,
            Ok(status) => {
                debug!(state = %status.state, "device did not report dfuMANIFEST");
                BestEffort::Unconfirmed
            }
            Err(e) => {
                debug!(error = %e, "no status after leave request");
                BestEffort::Unconfirmed
            }
        }
    }
}

fn protocol_error(operation: &str, reason: String) -> UpdateError {
    UpdateError::DfuProtocol {
        operation: operation.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures::SimulatedTarget;

    fn programmer(target: &SimulatedTarget) -> DfuProgrammer {
        DfuProgrammer::init(Box::new(target.clone())).unwrap()
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_init_reads_layout() {
        let target = SimulatedTarget::new();
        let programmer = programmer(&target);

        assert_eq!(programmer.layout()[0].addr, 0x0800_0000);
        assert_eq!(programmer.layout()[0].page_size, 1024);
    }

    #[test]
    fn test_init_normalises_error_and_download_states() {
        for start in [DfuState::Error, DfuState::DnloadIdle, DfuState::UploadIdle] {
            let target = SimulatedTarget::new().starting_in(start);
            let _ = programmer(&target);
            assert_eq!(target.state(), DfuState::DfuIdle, "from {}", start);
        }
    }

    #[test]
    fn test_write_then_read_back() {
        let target = SimulatedTarget::new();
        let elements = vec![
            MemoryElement::new(0x0800_0000, pattern(3000, 1)),
            MemoryElement::new(0x0800_1000, pattern(700, 2)),
            MemoryElement::new(0x0800_2100, pattern(9000, 3)),
        ];

        let written = programmer(&target)
            .write_elements(&elements, true, |_, _| {})
            .unwrap();

        assert_eq!(written, 12_700);
        for element in &elements {
            assert_eq!(target.read(element.address, element.len()), element.data);
        }
    }

    #[test]
    fn test_pages_are_erased_before_programming() {
        let target = SimulatedTarget::new().require_erase();
        let element = MemoryElement::new(0x0800_0200, pattern(2000, 7));

        programmer(&target)
            .write_elements(std::slice::from_ref(&element), true, |_, _| {})
            .unwrap();

        // 0x200..0x9D0 touches the first three 1K pages.
        assert_eq!(target.erased_pages(), vec![0x0800_0000, 0x0800_0400, 0x0800_0800]);
        assert_eq!(target.read(element.address, element.len()), element.data);
    }

    #[test]
    fn test_shared_page_is_erased_once() {
        let target = SimulatedTarget::new().require_erase();
        let elements = vec![
            MemoryElement::new(0x0800_0000, vec![0xAA; 16]),
            MemoryElement::new(0x0800_0010, vec![0xBB; 16]),
        ];

        programmer(&target)
            .write_elements(&elements, true, |_, _| {})
            .unwrap();

        assert_eq!(target.erased_pages(), vec![0x0800_0000]);
        assert_eq!(target.read(0x0800_0000, 16), vec![0xAA; 16]);
        assert_eq!(target.read(0x0800_0010, 16), vec![0xBB; 16]);
    }

    #[test]
    fn test_unerased_flash_rejects_writes() {
        let target = SimulatedTarget::new().require_erase();
        let element = MemoryElement::new(0x0800_0000, vec![1, 2, 3]);

        let result = programmer(&target).write_elements(&[element], false, |_, _| {});

        assert!(matches!(result, Err(UpdateError::FlashWrite { .. })));
        assert!(target.erased_pages().is_empty());
    }

    #[test]
    fn test_progress_is_cumulative_per_element() {
        let target = SimulatedTarget::new();
        let elements = vec![
            MemoryElement::new(0x0800_0000, vec![1; 100]),
            MemoryElement::new(0x0800_4000, vec![2; 50]),
        ];
        let mut calls = Vec::new();

        programmer(&target)
            .write_elements(&elements, true, |written, total| calls.push((written, total)))
            .unwrap();

        assert_eq!(calls, vec![(100, 150), (150, 150)]);
    }

    #[test]
    fn test_elements_are_written_in_order() {
        let target = SimulatedTarget::new();
        let elements = vec![
            MemoryElement::new(0x0800_4000, vec![1; 8]),
            MemoryElement::new(0x0800_0000, vec![2; 8]),
        ];

        programmer(&target)
            .write_elements(&elements, false, |_, _| {})
            .unwrap();

        assert_eq!(target.write_addresses(), vec![0x0800_4000, 0x0800_0000]);
    }

    #[test]
    fn test_write_failure_is_flash_write_at_failing_block() {
        let target = SimulatedTarget::new().fail_write_at(0x0800_0800);
        let elements = vec![
            MemoryElement::new(0x0800_0000, pattern(4096, 9)),
            MemoryElement::new(0x0800_2000, pattern(16, 9)),
        ];
        let mut calls = 0;

        let result = programmer(&target).write_elements(&elements, true, |_, _| calls += 1);

        match result {
            Err(UpdateError::FlashWrite { address, reason }) => {
                assert_eq!(address, 0x0800_0800);
                assert!(reason.contains("errWRITE"), "{}", reason);
            }
            other => panic!("expected FlashWrite, got {:?}", other),
        }
        assert_eq!(calls, 0);
        assert!(!target.write_addresses().contains(&0x0800_2000));
    }

    #[test]
    fn test_exit_dfu_confirmed_and_released() {
        let target = SimulatedTarget::new();

        let outcome = programmer(&target).exit_dfu();

        assert_eq!(outcome, BestEffort::Confirmed);
        assert!(target.left_dfu());
        assert!(target.released());
    }

    #[test]
    fn test_exit_dfu_without_manifest_is_unconfirmed() {
        let target = SimulatedTarget::new().silent_on_leave();

        let outcome = programmer(&target).exit_dfu();

        assert_eq!(outcome, BestEffort::Unconfirmed);
        assert!(target.released());
    }
}

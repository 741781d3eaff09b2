//! Flash memory map advertised in the DfuSe interface string.
//!
//! The string looks like `@Internal Flash  /0x08000000/04*016Kg,01*064Kg`:
//! a name, a start address, then runs of `count*size<multiplier><type>`.

use crate::error::{UpdateError, UpdateResult};

/// A run of equally sized flash pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySegment {
    pub addr: u32,
    pub last_addr: u32,
    pub size: u32,
    pub num_pages: u32,
    pub page_size: u32,
}

impl MemorySegment {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.addr && addr <= self.last_addr
    }

    /// Start of the page holding `addr`.
    pub fn page_start(&self, addr: u32) -> u32 {
        self.addr + (addr - self.addr) / self.page_size * self.page_size
    }
}

/// Find the segment that holds `addr`.
pub fn segment_for(layout: &[MemorySegment], addr: u32) -> Option<&MemorySegment> {
    layout.iter().find(|segment| segment.contains(addr))
}

/// Parse a DfuSe memory layout string into consecutive segments.
pub fn parse_memory_layout(descriptor: &str) -> UpdateResult<Vec<MemorySegment>> {
    let mut fields = descriptor.split('/');
    let _name = fields.next();
    let start = fields
        .next()
        .ok_or_else(|| layout_error(descriptor, "no start address"))?;
    let runs = fields
        .next()
        .ok_or_else(|| layout_error(descriptor, "no sector list"))?;

    let mut addr = parse_address(start.trim())
        .ok_or_else(|| layout_error(descriptor, "bad start address"))?;

    let mut layout = Vec::new();
    for run in runs.split(',') {
        let (num_pages, page_size) =
            parse_run(run.trim()).ok_or_else(|| layout_error(descriptor, "bad sector run"))?;
        let size = num_pages
            .checked_mul(page_size)
            .filter(|size| *size > 0)
            .ok_or_else(|| layout_error(descriptor, "sector run has no size"))?;
        let last_addr = addr
            .checked_add(size - 1)
            .ok_or_else(|| layout_error(descriptor, "sector run overflows the address space"))?;

        layout.push(MemorySegment {
            addr,
            last_addr,
            size,
            num_pages,
            page_size,
        });
        addr = last_addr.wrapping_add(1);
    }

    Ok(layout)
}

fn parse_address(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

/// `04*016Kg` -> (4, 16384). The trailing type letter is ignored.
fn parse_run(run: &str) -> Option<(u32, u32)> {
    let (count, rest) = run.split_once('*')?;
    let num_pages = count.parse().ok()?;

    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let base: u32 = rest[..digits].parse().ok()?;
    let multiplier = match rest[digits..].chars().next() {
        Some('K') => 1024,
        Some('M') => 1024 * 1024,
        _ => 1,
    };

    Some((num_pages, base.checked_mul(multiplier)?))
}

fn layout_error(descriptor: &str, reason: &str) -> UpdateError {
    UpdateError::DfuProtocol {
        operation: "read memory layout".to_string(),
        reason: format!("{} in {:?}", reason, descriptor),
    }
}

//! DfuSe firmware container reader.
//!
//! Layout (all little-endian):
//! - prefix: `"DfuSe"`, version, image size without suffix, target count
//! - per target: `"Target"`, alt setting, named flag, 255-byte name,
//!   target size, element count, then `{address, size, payload}` elements
//! - suffix: bcdDevice, idProduct, idVendor, bcdDFU, `"UFD"`, length, CRC32

use crc::{Crc, CRC_32_JAMCRC};

use crate::error::{UpdateError, UpdateResult};

/// CRC-32 without the final inversion, as stored in the DFU suffix.
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

pub const PREFIX_SIGNATURE: &[u8; 5] = b"DfuSe";
pub const TARGET_SIGNATURE: &[u8; 6] = b"Target";
pub const SUFFIX_SIGNATURE: &[u8; 3] = b"UFD";

pub const PREFIX_LEN: usize = 11;
pub const TARGET_NAME_LEN: usize = 255;
pub const TARGET_PREFIX_LEN: usize = 6 + 1 + 4 + TARGET_NAME_LEN + 4 + 4;
pub const ELEMENT_HEADER_LEN: usize = 8;
pub const SUFFIX_LEN: usize = 16;

/// One contiguous run of bytes to program at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryElement {
    pub address: u32,
    pub data: Vec<u8>,
}

impl MemoryElement {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One alternate setting's worth of elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuSeTarget {
    pub alt_setting: u8,
    pub name: Option<String>,
    pub elements: Vec<MemoryElement>,
}

/// The standard DFU file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuSuffix {
    pub device: u16,
    pub product: u16,
    pub vendor: u16,
    pub dfu_version: u16,
}

impl DfuSuffix {
    /// 0xFFFF in either field means "any device".
    pub fn matches(&self, vendor: u16, product: u16) -> bool {
        (self.vendor == 0xFFFF || self.vendor == vendor)
            && (self.product == 0xFFFF || self.product == product)
    }
}

/// A parsed DfuSe container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuSeImage {
    pub version: u8,
    pub targets: Vec<DfuSeTarget>,
    pub suffix: DfuSuffix,
}

impl DfuSeImage {
    /// Parse and validate a complete container.
    pub fn parse(bytes: &[u8]) -> UpdateResult<Self> {
        if bytes.len() < PREFIX_SIGNATURE.len() || &bytes[..PREFIX_SIGNATURE.len()] != PREFIX_SIGNATURE
        {
            return Err(format_error("missing DfuSe signature"));
        }
        if bytes.len() < PREFIX_LEN + SUFFIX_LEN {
            return Err(format_error(format!(
                "file is {} bytes, too short for prefix and suffix",
                bytes.len()
            )));
        }

        let (body, suffix_bytes) = bytes.split_at(bytes.len() - SUFFIX_LEN);
        let suffix = parse_suffix(suffix_bytes)?;

        let stored_crc = u32::from_le_bytes([
            suffix_bytes[12],
            suffix_bytes[13],
            suffix_bytes[14],
            suffix_bytes[15],
        ]);
        let computed_crc = checksum(&bytes[..bytes.len() - 4]);
        if stored_crc != computed_crc {
            return Err(format_error(format!(
                "CRC mismatch: file says 0x{:08X}, computed 0x{:08X}",
                stored_crc, computed_crc
            )));
        }

        let mut reader = Reader::new(body);
        reader.take(PREFIX_SIGNATURE.len(), "prefix signature")?;
        let version = reader.u8("prefix version")?;
        let declared_size = reader.u32("prefix size")? as usize;
        let target_count = reader.u8("target count")?;

        if declared_size != body.len() {
            return Err(format_error(format!(
                "prefix declares {} bytes but image holds {}",
                declared_size,
                body.len()
            )));
        }

        if target_count as usize * TARGET_PREFIX_LEN > reader.remaining() {
            return Err(format_error(format!(
                "{} targets declared but only {} bytes follow the prefix",
                target_count,
                reader.remaining()
            )));
        }

        let mut targets = Vec::with_capacity(target_count as usize);
        for index in 0..target_count {
            targets.push(parse_target(&mut reader, index)?);
        }

        if !reader.is_empty() {
            return Err(format_error(format!(
                "{} unexpected bytes after the last target",
                reader.remaining()
            )));
        }

        Ok(Self {
            version,
            targets,
            suffix,
        })
    }

    /// All elements in file order. Empty when there is nothing to program.
    pub fn into_elements(self) -> Vec<MemoryElement> {
        self.targets
            .into_iter()
            .flat_map(|target| target.elements)
            .collect()
    }
}

/// Suffix checksum over `data`.
pub fn checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

fn parse_suffix(bytes: &[u8]) -> UpdateResult<DfuSuffix> {
    let mut reader = Reader::new(bytes);
    let device = reader.u16("suffix bcdDevice")?;
    let product = reader.u16("suffix idProduct")?;
    let vendor = reader.u16("suffix idVendor")?;
    let dfu_version = reader.u16("suffix bcdDFU")?;

    if reader.take(SUFFIX_SIGNATURE.len(), "suffix signature")? != SUFFIX_SIGNATURE {
        return Err(format_error("missing UFD suffix signature"));
    }
    let length = reader.u8("suffix length")?;
    if length as usize != SUFFIX_LEN {
        return Err(format_error(format!("suffix length is {}, expected 16", length)));
    }

    Ok(DfuSuffix {
        device,
        product,
        vendor,
        dfu_version,
    })
}

fn parse_target(reader: &mut Reader<'_>, index: u8) -> UpdateResult<DfuSeTarget> {
    if reader.take(TARGET_SIGNATURE.len(), "target signature")? != TARGET_SIGNATURE {
        return Err(format_error(format!("target {} has no Target signature", index)));
    }
    let alt_setting = reader.u8("target alt setting")?;
    let named = reader.u32("target named flag")? != 0;
    let raw_name = reader.take(TARGET_NAME_LEN, "target name")?;
    let size = reader.u32("target size")? as usize;
    let element_count = reader.u32("element count")?;

    let name = named.then(|| {
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        String::from_utf8_lossy(&raw_name[..end]).into_owned()
    });

    let mut image = Reader::new(reader.take(size, "target image")?);
    if element_count as usize > size / ELEMENT_HEADER_LEN {
        return Err(format_error(format!(
            "target {} declares {} elements in {} bytes",
            index, element_count, size
        )));
    }
    let mut elements = Vec::with_capacity(element_count as usize);
    for _ in 0..element_count {
        let address = image.u32("element address")?;
        let length = image.u32("element size")? as usize;
        let data = image.take(length, "element payload")?.to_vec();
        elements.push(MemoryElement { address, data });
    }

    if !image.is_empty() {
        return Err(format_error(format!(
            "target {} has {} bytes beyond its {} elements",
            index,
            image.remaining(),
            element_count
        )));
    }

    Ok(DfuSeTarget {
        alt_setting,
        name,
        elements,
    })
}

fn format_error(reason: impl Into<String>) -> UpdateError {
    UpdateError::ContainerFormat {
        reason: reason.into(),
    }
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize, what: &str) -> UpdateResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(format_error(format!(
                "truncated reading {}: need {} bytes, {} left",
                what,
                len,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> UpdateResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> UpdateResult<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> UpdateResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

//! Wire-format primitives for the call-path profile binary format.
//!
//! This crate knows nothing about calling-context trees or correlation; it
//! only knows how to decode the bytes of a `.csprof` file into raw records.
//! The `xcsprof` crate's `reader` module turns those records into a CCT.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{self, Read};
use thiserror::Error;

/// Virtual memory address, as it appears in a profile or a load module.
pub type Vma = u64;

pub const MAGIC: [u8; 4] = *b"CSPR";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("I/O error reading profile data")]
    Io(#[from] io::Error),
    #[error("bad magic number: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported format version {0} (expected {FORMAT_VERSION})")]
    UnsupportedVersion(u32),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, FormatError>;

/// Decodes an operation pointer (`opIP`) into an instruction pointer and an
/// intra-instruction operation index. Most instruction sets address single
/// operations directly (`opIdx` is always 0); wide-instruction-word ISAs
/// (e.g. IA-64 bundles) pack several operations per instruction word and use
/// the low bits of the pointer to select one.
pub trait InstructionSetArch {
    fn decode_op_ip(&self, op_ip: Vma) -> (Vma, u16);
}

/// The common case: the operation pointer already identifies a single
/// instruction, so the decoded instruction pointer is the input unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlatIsa;

impl InstructionSetArch for FlatIsa {
    fn decode_op_ip(&self, op_ip: Vma) -> (Vma, u16) {
        (op_ip, 0)
    }
}

/// Wide-instruction-word ISAs that pack several operations into one bundle
/// and use the low two bits of the pointer (values 0, 1, 2) to select one.
#[derive(Debug, Default, Clone, Copy)]
pub struct WideWordIsa;

impl InstructionSetArch for WideWordIsa {
    fn decode_op_ip(&self, op_ip: Vma) -> (Vma, u16) {
        let op_idx = (op_ip & 0x3) as u16;
        (op_ip - op_idx as u64, op_idx)
    }
}

#[derive(Debug, Clone)]
pub struct HeaderRaw {
    pub version: u32,
    pub num_metrics: u32,
    pub num_epochs: u32,
}

#[derive(Debug, Clone)]
pub struct MetricDescRaw {
    pub name: String,
    pub flags: u32,
    pub period: u64,
}

#[derive(Debug, Clone)]
pub struct LoadModuleRaw {
    pub name: String,
    /// Declared (link-time) base address.
    pub vaddr: Vma,
    pub mapaddr: Vma,
}

/// One entry in the epoch table: the load modules active at the time of
/// sampling, sorted by `mapaddr` ascending.
#[derive(Debug, Clone, Default)]
pub struct EpochRaw {
    pub load_modules: Vec<LoadModuleRaw>,
}

#[derive(Debug, Clone)]
pub struct NodeHeaderRaw {
    pub node_id: u32,
    pub parent_id: u32,
    pub op_ip: Vma,
    pub lush_assoc: u8,
    pub lush_lip: u64,
}

pub fn read_len_prefixed_string<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

pub fn read_header<R: Read>(r: &mut R) -> Result<HeaderRaw> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(FormatError::BadMagic {
            expected: MAGIC,
            found: magic,
        });
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != FORMAT_VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }
    let num_metrics = r.read_u32::<LittleEndian>()?;
    let num_epochs = r.read_u32::<LittleEndian>()?;
    Ok(HeaderRaw {
        version,
        num_metrics,
        num_epochs,
    })
}

pub fn read_metric_descs<R: Read>(r: &mut R, count: u32) -> Result<Vec<MetricDescRaw>> {
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_len_prefixed_string(r)?;
        let flags = r.read_u32::<LittleEndian>()?;
        let period = r.read_u64::<LittleEndian>()?;
        out.push(MetricDescRaw {
            name,
            flags,
            period,
        });
    }
    Ok(out)
}

pub fn read_epoch<R: Read>(r: &mut R) -> Result<EpochRaw> {
    let num_lm = r.read_u32::<LittleEndian>()?;
    let mut load_modules = Vec::with_capacity(num_lm as usize);
    for _ in 0..num_lm {
        let name = read_len_prefixed_string(r)?;
        let vaddr = r.read_u64::<LittleEndian>()?;
        let mapaddr = r.read_u64::<LittleEndian>()?;
        load_modules.push(LoadModuleRaw { name, vaddr, mapaddr });
    }
    Ok(EpochRaw { load_modules })
}

pub fn read_node_header<R: Read>(r: &mut R) -> Result<NodeHeaderRaw> {
    let node_id = r.read_u32::<LittleEndian>()?;
    let parent_id = r.read_u32::<LittleEndian>()?;
    let op_ip = r.read_u64::<LittleEndian>()?;
    let lush_assoc = r.read_u8()?;
    let lush_lip = r.read_u64::<LittleEndian>()?;
    Ok(NodeHeaderRaw {
        node_id,
        parent_id,
        op_ip,
        lush_assoc,
        lush_lip,
    })
}

pub fn read_metric_values<R: Read>(r: &mut R, count: u32) -> Result<Vec<f64>> {
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(r.read_f64::<LittleEndian>()?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_word_isa_masks_low_bits() {
        let isa = WideWordIsa;
        assert_eq!(isa.decode_op_ip(0x1000), (0x1000, 0));
        assert_eq!(isa.decode_op_ip(0x1001), (0x1000, 1));
        assert_eq!(isa.decode_op_ip(0x1002), (0x1000, 2));
    }

    #[test]
    fn flat_isa_is_identity() {
        let isa = FlatIsa;
        assert_eq!(isa.decode_op_ip(0x1001), (0x1001, 0));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let bytes = [b'X', b'X', b'X', b'X', 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut cursor = &bytes[..];
        match read_header(&mut cursor) {
            Err(FormatError::BadMagic { .. }) => {}
            other => panic!("expected BadMagic, got {other:?}"),
        }
    }

    #[test]
    fn round_trips_epoch_table() {
        let mut buf = Vec::new();
        {
            use byteorder::WriteBytesExt;
            buf.write_u32::<LittleEndian>(2).unwrap();
            for (name, vaddr, addr) in [
                ("libc.so.6", 0u64, 0x7f0000u64),
                ("a.out", 0x400000u64, 0x400000u64),
            ] {
                buf.write_u32::<LittleEndian>(name.len() as u32).unwrap();
                buf.extend_from_slice(name.as_bytes());
                buf.write_u64::<LittleEndian>(vaddr).unwrap();
                buf.write_u64::<LittleEndian>(addr).unwrap();
            }
        }
        let mut cursor = &buf[..];
        let epoch = read_epoch(&mut cursor).unwrap();
        assert_eq!(epoch.load_modules.len(), 2);
        assert_eq!(epoch.load_modules[0].name, "libc.so.6");
        assert_eq!(epoch.load_modules[1].mapaddr, 0x400000);
    }
}

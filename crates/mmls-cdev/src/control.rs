//! Control command encoding and diagnostic sinks.
//!
//! Commands use the Linux `_IOC` layout so the numbers line up with what a C client would build
//! with `_IOR`/`_IOW`. Range arguments travel as a 16-byte little-endian descriptor.

use crate::{CdevError, Result};

const IOC_NRBITS: u32 = 8;
const IOC_TYPEBITS: u32 = 8;
const IOC_SIZEBITS: u32 = 14;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = IOC_NRSHIFT + IOC_NRBITS;
const IOC_SIZESHIFT: u32 = IOC_TYPESHIFT + IOC_TYPEBITS;
const IOC_DIRSHIFT: u32 = IOC_SIZESHIFT + IOC_SIZEBITS;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

pub const MMLS_IOC_MAGIC: u8 = b'M';

/// Writes the device size as a little-endian `u64` into the argument.
pub const MMLS_IOC_SIZE: u32 = ioc(IOC_READ, MMLS_IOC_MAGIC, 1, 8);
/// Flushes the cache lines covering an [`MmlsRange`].
pub const MMLS_IOC_FLUSH_RANGE: u32 = ioc(IOC_WRITE, MMLS_IOC_MAGIC, 2, MmlsRange::WIRE_SIZE);
/// Dumps the bytes of an [`MmlsRange`] to the diagnostic sink.
pub const MMLS_IOC_DUMP_MEM: u32 = ioc(IOC_WRITE, MMLS_IOC_MAGIC, 3, MmlsRange::WIRE_SIZE);

/// A byte range of the device, as passed to flush and dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MmlsRange {
    pub offset: u64,
    pub size: u64,
}

impl MmlsRange {
    pub const WIRE_SIZE: usize = 16;

    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; Self::WIRE_SIZE] = bytes
            .try_into()
            .map_err(|_| CdevError::InvalidArgument("range descriptor must be 16 bytes"))?;
        let mut offset = [0u8; 8];
        let mut size = [0u8; 8];
        offset.copy_from_slice(&bytes[..8]);
        size.copy_from_slice(&bytes[8..]);
        Ok(Self {
            offset: u64::from_le_bytes(offset),
            size: u64::from_le_bytes(size),
        })
    }

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Receives the bytes of a dump, one at a time.
pub trait DumpSink {
    /// `offset` is the device offset of `value`.
    fn emit(&mut self, offset: u64, value: u8);
}

impl DumpSink for Vec<(u64, u8)> {
    fn emit(&mut self, offset: u64, value: u8) {
        self.push((offset, value));
    }
}

/// Logs each byte at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDumpSink {
    pub device: usize,
}

impl DumpSink for TracingDumpSink {
    fn emit(&mut self, offset: u64, value: u8) {
        tracing::info!(
            target: "mmls_cdev::dump",
            device = self.device,
            "mmls_iomem[{offset}]=0x{value:02X}"
        );
    }
}

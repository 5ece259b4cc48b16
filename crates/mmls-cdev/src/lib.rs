//! Character device over an MMLS physical memory region.
//!
//! Each device exposes a byte-addressable range `[0, size)` backed either by a discovered physical
//! region or, when discovery finds nothing, by a fixed static buffer. The crate provides:
//!
//! - a bounds-checked data path ([`MmlsDevice::read`] / [`MmlsDevice::write`]) serialized by a
//!   per-device sleeping lock, clipping over-long requests to the device size;
//! - control commands ([`control`]) for the size query, cache flushes, and diagnostic dumps;
//! - direct mappings of the physical region ([`mmap`]) with a configurable cache policy. Mappings
//!   bypass the lock and are only weakly ordered with the data path.
//!
//! The command layer underneath (region discovery and sector transfers) is abstracted by
//! [`MmlsBackend`]; [`RamDiskBackend`] is an in-memory implementation.

pub mod backing;
pub mod cache;
pub mod config;
pub mod control;
pub mod device;
pub mod driver;
pub mod error;
pub mod file;
mod iomem;
pub mod mmap;
pub mod notify;
pub mod sync;
pub mod user;

#[cfg(all(test, not(target_arch = "wasm32")))]
mod proptests;

pub use backing::{MmlsBackend, MmlsIoData, RamDiskBackend, SectorRequest, SECTOR_SIZE};
pub use cache::{CacheMaintenance, CpuCache};
pub use config::{CdevConfig, ConfigError, OverrunPolicy, SeekEnd};
pub use control::{DumpSink, MmlsRange, TracingDumpSink};
pub use device::{BackingMode, DeviceStats, MmlsDevice, STATIC_BUFFER_SIZE};
pub use driver::MmlsCdev;
pub use error::{CdevError, MapFault, Result};
pub use file::DeviceHandle;
pub use iomem::IoMem;
pub use mmap::{
    AddressSpace, CachePolicy, Mapping, PageEntry, SoftAddressSpace, VmFlags, PAGE_SIZE,
};
pub use notify::{NotifyEvent, Subscription};
pub use sync::Interrupt;
pub use user::{UserBuffer, UserBufferMut, UserFault};

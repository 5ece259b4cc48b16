//! Mapping the physical backing range into a caller's address space.
//!
//! A mapping is established eagerly: every page table entry is installed up front, pinned, and
//! tagged with one cache policy chosen at subsystem startup. After that the caller touches the
//! backing directly through the returned [`Mapping`] and the device lock plays no part. Accesses
//! through a mapping and locked read/write calls are not ordered with respect to each other; a
//! caller mixing both must order them itself and call `flush_range` when it needs durability.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;

use crate::{CdevError, IoMem, MapFault, Result};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Cache attribute applied to a whole mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Normal cached memory. Fastest for mixed access; durability needs `flush_range`.
    #[default]
    WriteBack,
    /// Stores are buffered and combined. Suited to bulk sequential writes.
    WriteCombining,
    /// Every access goes to the medium.
    Uncached,
}

impl CachePolicy {
    /// Decodes the numeric mapping type knob. Unknown values select write-back.
    pub fn from_mmap_type(value: u32) -> Self {
        match value {
            1 => Self::WriteCombining,
            2 => Self::Uncached,
            _ => Self::WriteBack,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WriteBack => "wb",
            Self::WriteCombining => "wc",
            Self::Uncached => "uc",
        }
    }
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CachePolicy {
    type Err = CdevError;

    fn from_str(s: &str) -> Result<Self> {
        if let Ok(value) = s.parse::<u32>() {
            return Ok(Self::from_mmap_type(value));
        }
        match s.to_ascii_lowercase().as_str() {
            "wb" | "write-back" | "writeback" => Ok(Self::WriteBack),
            "wc" | "write-combining" | "writecombining" => Ok(Self::WriteCombining),
            "uc" | "uncached" => Ok(Self::Uncached),
            _ => Err(CdevError::InvalidArgument("unknown cache policy")),
        }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const SHARED = 1 << 3;
        /// Excluded from swap and reclaim.
        const LOCKED = 1 << 13;
        /// Maps device memory rather than RAM.
        const IO = 1 << 14;
        /// Backed by raw page frame numbers, not `struct page`s.
        const PFNMAP = 1 << 10;
        const DONTEXPAND = 1 << 18;
        const DONTDUMP = 1 << 26;
    }
}

impl VmFlags {
    /// Flags carried by every page of an MMLS mapping.
    pub const PINNED_IO: VmFlags = VmFlags::LOCKED
        .union(VmFlags::IO)
        .union(VmFlags::PFNMAP)
        .union(VmFlags::DONTEXPAND)
        .union(VmFlags::DONTDUMP);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    pub vaddr: u64,
    pub pfn: u64,
    pub policy: CachePolicy,
    pub flags: VmFlags,
}

/// The generic memory-mapping front end the device plugs into.
pub trait AddressSpace: Send + Sync {
    /// Picks a free, page-aligned virtual range of `len` bytes.
    fn reserve(&self, len: u64) -> Result<u64>;

    /// Installs all entries or none of them.
    fn install(&self, entries: &[PageEntry]) -> Result<()>;

    /// Removes `pages` entries starting at `vaddr`.
    fn remove(&self, vaddr: u64, pages: u64);
}

/// An in-memory page table.
pub struct SoftAddressSpace {
    next_vaddr: Mutex<u64>,
    entries: Mutex<BTreeMap<u64, PageEntry>>,
}

impl SoftAddressSpace {
    pub const BASE: u64 = 0x7f00_0000_0000;

    pub fn new() -> Self {
        Self {
            next_vaddr: Mutex::new(Self::BASE),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, vaddr: u64) -> Option<PageEntry> {
        let page = vaddr & !(PAGE_SIZE - 1);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&page)
            .copied()
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for SoftAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for SoftAddressSpace {
    fn reserve(&self, len: u64) -> Result<u64> {
        let mut next = self.next_vaddr.lock().unwrap_or_else(PoisonError::into_inner);
        let vaddr = *next;
        // Leave a guard page between consecutive reservations.
        *next = len
            .checked_next_multiple_of(PAGE_SIZE)
            .and_then(|len| vaddr.checked_add(len + PAGE_SIZE))
            .ok_or_else(|| CdevError::MapFailed("virtual address space exhausted".into()))?;
        Ok(vaddr)
    }

    fn install(&self, entries: &[PageEntry]) -> Result<()> {
        let mut table = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(busy) = entries.iter().find(|e| table.contains_key(&e.vaddr)) {
            return Err(CdevError::MapFailed(format!(
                "page 0x{:x} is already mapped",
                busy.vaddr
            )));
        }
        table.extend(entries.iter().map(|e| (e.vaddr, *e)));
        Ok(())
    }

    fn remove(&self, vaddr: u64, pages: u64) {
        let mut table = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for page in 0..pages {
            table.remove(&(vaddr + page * PAGE_SIZE));
        }
    }
}

/// Validates a mapping request against the device and builds the mapping.
pub(crate) fn establish(
    space: Arc<dyn AddressSpace>,
    window: &Arc<IoMem>,
    phys_start: u64,
    size: u64,
    offset: u64,
    len: u64,
    policy: CachePolicy,
) -> Result<Mapping> {
    if offset % PAGE_SIZE != 0 {
        return Err(CdevError::InvalidArgument("mapping offset is not page aligned"));
    }
    if len == 0 {
        return Err(CdevError::InvalidArgument("mapping length is zero"));
    }
    if offset >= size {
        return Err(CdevError::OutOfRange { offset, len, size });
    }
    let map_len = len
        .checked_next_multiple_of(PAGE_SIZE)
        .ok_or(CdevError::OutOfRange { offset, len, size })?;
    if map_len > size - offset {
        tracing::error!(offset, len, size, "requested mapping exceeds device size");
        return Err(CdevError::OutOfRange { offset, len, size });
    }

    let physical = phys_start + offset;
    let pages = map_len / PAGE_SIZE;
    let vaddr = space.reserve(map_len)?;
    let first_pfn = physical >> PAGE_SHIFT;
    let entries: Vec<PageEntry> = (0..pages)
        .map(|page| PageEntry {
            vaddr: vaddr + page * PAGE_SIZE,
            pfn: first_pfn + page,
            policy,
            flags: VmFlags::READ | VmFlags::WRITE | VmFlags::SHARED | VmFlags::PINNED_IO,
        })
        .collect();
    space.install(&entries)?;

    tracing::debug!(
        vaddr = format_args!("0x{vaddr:x}"),
        physical = format_args!("0x{physical:x}"),
        pages,
        %policy,
        "physical range remapped into caller address space"
    );

    Ok(Mapping {
        space,
        window: window.clone(),
        vaddr,
        offset,
        len: map_len,
        physical,
        policy,
        mapped: true,
    })
}

/// Ownership of one installed mapping.
///
/// There is exactly one owner. Dropping it, or calling [`Mapping::unmap`], removes the page table
/// entries. Neither flushes caches.
pub struct Mapping {
    space: Arc<dyn AddressSpace>,
    window: Arc<IoMem>,
    vaddr: u64,
    offset: u64,
    len: u64,
    physical: u64,
    policy: CachePolicy,
    mapped: bool,
}

impl Mapping {
    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// Mapped length in bytes, a whole number of pages.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device offset of the first mapped byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn phys_addr(&self) -> u64 {
        self.physical
    }

    pub fn pfn(&self) -> u64 {
        self.physical >> PAGE_SHIFT
    }

    pub fn pages(&self) -> u64 {
        self.len / PAGE_SIZE
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn resolve(&self, at: u64, len: usize) -> std::result::Result<usize, MapFault> {
        let addr = self.vaddr.wrapping_add(at);
        let end = at.checked_add(len as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(MapFault::Outside { addr });
        }
        if self.window.is_revoked() {
            return Err(MapFault::Revoked { addr });
        }
        Ok((self.offset + at) as usize)
    }

    /// Loads `dst.len()` bytes at mapping offset `at`.
    pub fn read(&self, at: u64, dst: &mut [u8]) -> std::result::Result<(), MapFault> {
        let start = self.resolve(at, dst.len())?;
        if self.policy == CachePolicy::Uncached {
            fence(Ordering::SeqCst);
        }
        self.window.load(start, dst);
        Ok(())
    }

    /// Stores `src` at mapping offset `at`.
    pub fn write(&self, at: u64, src: &[u8]) -> std::result::Result<(), MapFault> {
        let start = self.resolve(at, src.len())?;
        self.window.store(start, src);
        if self.policy == CachePolicy::Uncached {
            fence(Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn read_u8(&self, at: u64) -> std::result::Result<u8, MapFault> {
        let mut byte = [0u8; 1];
        self.read(at, &mut byte)?;
        Ok(byte[0])
    }

    pub fn write_u8(&self, at: u64, value: u8) -> std::result::Result<(), MapFault> {
        self.write(at, &[value])
    }

    /// Fills the whole mapping with `value`.
    pub fn fill(&self, value: u8) -> std::result::Result<(), MapFault> {
        let chunk = [value; PAGE_SIZE as usize];
        for page in 0..self.pages() {
            self.write(page * PAGE_SIZE, &chunk)?;
        }
        Ok(())
    }

    pub fn unmap(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if !self.mapped {
            return;
        }
        self.mapped = false;
        self.space.remove(self.vaddr, self.pages());
        tracing::debug!(vaddr = format_args!("0x{:x}", self.vaddr), "mapping removed");
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("vaddr", &format_args!("0x{:x}", self.vaddr))
            .field("len", &self.len)
            .field("physical", &format_args!("0x{:x}", self.physical))
            .field("policy", &self.policy)
            .finish()
    }
}

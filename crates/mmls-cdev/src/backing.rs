//! The command layer underneath the device.
//!
//! Discovery of the backing region and the medium-level sector transfers are owned by a lower
//! driver. The device only needs the contract in [`MmlsBackend`]; [`RamDiskBackend`] implements
//! it in memory for tests and for hosts without MMLS hardware.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{CdevError, IoMem, Result};

pub const SECTOR_SIZE: u64 = 512;

/// What discovery reports for one device.
#[derive(Debug, Clone)]
pub struct MmlsIoData {
    /// Usable bytes in the region.
    pub size: u64,
    /// Physical address of byte 0.
    pub phys_start: u64,
    /// Driver-side window onto the region.
    pub iomem: Arc<IoMem>,
}

/// A medium-level transfer, in whole sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRequest {
    pub start: u64,
    pub count: u64,
    /// Virtual address of the window the transfer targets.
    pub target: u64,
}

impl SectorRequest {
    /// Smallest sector run covering the byte range `[offset, offset + len)`.
    pub fn covering(offset: u64, len: u64, target: u64) -> Self {
        let start = offset / SECTOR_SIZE;
        let end = (offset + len).div_ceil(SECTOR_SIZE);
        Self {
            start,
            count: end - start,
            target,
        }
    }

    pub fn byte_range(&self) -> (u64, u64) {
        (self.start * SECTOR_SIZE, (self.start + self.count) * SECTOR_SIZE)
    }
}

pub trait MmlsBackend: Send + Sync {
    /// Reports the region backing device `index`, or `None` if there is no hardware for it.
    ///
    /// Called once per device, during initialization only.
    fn discover(&self, index: usize) -> Option<MmlsIoData>;

    /// Makes the medium's current contents for `req` resident in `iomem`.
    fn read_sectors(&self, req: SectorRequest, iomem: &IoMem) -> Result<()>;

    /// Commits `req` from `iomem` to the medium.
    fn write_sectors(&self, req: SectorRequest, iomem: &IoMem) -> Result<()>;

    /// Drops the backing reference taken by [`MmlsBackend::discover`].
    fn release(&self, _index: usize) {}
}

/// An in-memory MMLS: a "medium" byte store plus a separate driver-side window.
///
/// Read commands copy medium → window and write commands copy window → medium, so tests can tell
/// committed data apart from data that only reached the window.
pub struct RamDiskBackend {
    region: Option<RamRegion>,
    read_commands: AtomicU64,
    write_commands: AtomicU64,
    last_request: Mutex<Option<SectorRequest>>,
    released: AtomicBool,
    fail_commands: AtomicBool,
}

struct RamRegion {
    phys_start: u64,
    size: u64,
    medium: IoMem,
    window: Arc<IoMem>,
}

impl RamDiskBackend {
    /// Physical base reported when none is given; page aligned.
    pub const DEFAULT_PHYS_START: u64 = 0x1_0000_0000;

    pub fn new(size: u64) -> Result<Self> {
        Self::with_phys_start(size, Self::DEFAULT_PHYS_START)
    }

    pub fn with_phys_start(size: u64, phys_start: u64) -> Result<Self> {
        let len = usize::try_from(size)
            .map_err(|_| CdevError::Fatal(format!("ram disk size {size} exceeds usize")))?;
        Ok(Self::from_region(Some(RamRegion {
            phys_start,
            size,
            medium: IoMem::zeroed(len)?,
            window: Arc::new(IoMem::zeroed(len)?),
        })))
    }

    /// A backend whose discovery never finds hardware.
    pub fn absent() -> Self {
        Self::from_region(None)
    }

    fn from_region(region: Option<RamRegion>) -> Self {
        Self {
            region,
            read_commands: AtomicU64::new(0),
            write_commands: AtomicU64::new(0),
            last_request: Mutex::new(None),
            released: AtomicBool::new(false),
            fail_commands: AtomicBool::new(false),
        }
    }

    /// Copies committed medium contents out, bypassing the window.
    pub fn read_medium(&self, offset: usize, dst: &mut [u8]) {
        if let Some(region) = &self.region {
            region.medium.load(offset, dst);
        }
    }

    /// Writes the medium directly, as if another agent updated the hardware.
    pub fn write_medium(&self, offset: usize, src: &[u8]) {
        if let Some(region) = &self.region {
            region.medium.store(offset, src);
        }
    }

    pub fn read_commands(&self) -> u64 {
        self.read_commands.load(Ordering::Relaxed)
    }

    pub fn write_commands(&self) -> u64 {
        self.write_commands.load(Ordering::Relaxed)
    }

    pub fn last_request(&self) -> Option<SectorRequest> {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Makes every subsequent command fail, to exercise error propagation.
    pub fn set_fail_commands(&self, fail: bool) {
        self.fail_commands.store(fail, Ordering::Relaxed);
    }

    /// Records `req` and returns the region it applies to.
    fn begin(&self, op: &'static str, req: SectorRequest) -> Result<&RamRegion> {
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(req);

        if self.fail_commands.load(Ordering::Relaxed) {
            return Err(CdevError::Command {
                op,
                reason: "injected failure".into(),
            });
        }

        self.region.as_ref().ok_or_else(|| CdevError::Command {
            op,
            reason: "no ram disk region".into(),
        })
    }
}

impl RamRegion {
    fn copy_sectors(&self, req: SectorRequest, from: &IoMem, to: &IoMem) {
        let (start, end) = req.byte_range();
        let end = end.min(self.size);
        if start < end {
            IoMem::copy_within(from, start as usize, to, start as usize, (end - start) as usize);
        }
    }
}

impl MmlsBackend for RamDiskBackend {
    fn discover(&self, index: usize) -> Option<MmlsIoData> {
        let region = self.region.as_ref().filter(|_| index == 0)?;
        Some(MmlsIoData {
            size: region.size,
            phys_start: region.phys_start,
            iomem: region.window.clone(),
        })
    }

    fn read_sectors(&self, req: SectorRequest, iomem: &IoMem) -> Result<()> {
        self.read_commands.fetch_add(1, Ordering::Relaxed);
        let region = self.begin("read", req)?;
        region.copy_sectors(req, &region.medium, iomem);
        Ok(())
    }

    fn write_sectors(&self, req: SectorRequest, iomem: &IoMem) -> Result<()> {
        self.write_commands.fetch_add(1, Ordering::Relaxed);
        let region = self.begin("write", req)?;
        region.copy_sectors(req, iomem, &region.medium);
        Ok(())
    }

    fn release(&self, index: usize) {
        if index == 0 {
            self.released.store(true, Ordering::Release);
        }
    }
}

//! Per-device state and the locked data path.
//!
//! A device exposes the byte range `[0, size)` over one of two backings fixed at initialization:
//! the discovered physical region, or a static in-memory buffer used when nothing was discovered.
//! Read, write, flush and dump serialize on the device lock; mappings do not (see [`crate::mmap`]).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backing::{MmlsBackend, SectorRequest, SECTOR_SIZE};
use crate::cache::{lines_covering, CacheMaintenance};
use crate::config::{CdevConfig, OverrunPolicy};
use crate::control::{DumpSink, MmlsRange};
use crate::mmap::{self, AddressSpace, CachePolicy, Mapping};
use crate::notify::{NotifyEvent, NotifyRegistry, Subscription};
use crate::sync::{Interrupt, SleepLock, SleepLockGuard};
use crate::user::{UserBuffer, UserBufferMut};
use crate::{CdevError, IoMem, Result};

/// Capacity of the fallback buffer, independent of any discovered size.
pub const STATIC_BUFFER_SIZE: usize = 4096 * 8;

/// Bytes moved between caller memory and the backing per step.
const COPY_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingMode {
    /// Degraded fallback: nothing was discovered, data lives in a fixed in-memory buffer.
    StaticBuffer,
    PhysicalRegion,
}

enum Backing {
    Static {
        buffer: IoMem,
    },
    Physical {
        phys_start: u64,
        iomem: Arc<IoMem>,
        sector_count: u64,
    },
}

/// Counters kept under the device lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub flushes: u64,
    pub dumps: u64,
    /// Requests shortened to fit the device.
    pub clipped: u64,
}

pub struct MmlsDevice {
    index: usize,
    size: u64,
    backing: Backing,
    backend: Arc<dyn MmlsBackend>,
    cache: Arc<dyn CacheMaintenance>,
    lock: SleepLock<DeviceStats>,
    notify: NotifyRegistry,
    mmap_policy: CachePolicy,
    overrun: OverrunPolicy,
    torn_down: AtomicBool,
}

/// A request range after bounds checking, in window offsets.
#[derive(Debug, Clone, Copy)]
struct Clipped {
    start: usize,
    len: usize,
    clipped: bool,
}

impl MmlsDevice {
    /// Builds device `index` from whatever `backend` discovers for it.
    ///
    /// Either a fully usable device is returned or nothing is: a region whose window is shorter
    /// than its reported size, or no region at all with the static fallback disabled, is
    /// [`CdevError::Fatal`].
    pub fn init(
        index: usize,
        config: &CdevConfig,
        backend: Arc<dyn MmlsBackend>,
        cache: Arc<dyn CacheMaintenance>,
    ) -> Result<Self> {
        let discovered = backend.discover(index).filter(|io| io.size > 0);

        let (size, backing) = match discovered {
            Some(io) => {
                if (io.iomem.len() as u64) < io.size {
                    backend.release(index);
                    return Err(CdevError::Fatal(format!(
                        "device {index}: window of {} bytes cannot cover reported size {}",
                        io.iomem.len(),
                        io.size
                    )));
                }
                let sector_count = io.size / SECTOR_SIZE;
                tracing::info!(
                    device = index,
                    size = io.size,
                    phys_start = format_args!("0x{:x}", io.phys_start),
                    iomem = format_args!("0x{:x}", io.iomem.virt_base()),
                    sector_count,
                    "found mmls region"
                );
                (
                    io.size,
                    Backing::Physical {
                        phys_start: io.phys_start,
                        iomem: io.iomem,
                        sector_count,
                    },
                )
            }
            None if config.static_fallback => {
                tracing::warn!(device = index, "no mmls region found; using static buffer");
                let buffer = IoMem::zeroed(STATIC_BUFFER_SIZE)?;
                (STATIC_BUFFER_SIZE as u64, Backing::Static { buffer })
            }
            None => {
                return Err(CdevError::Fatal(format!(
                    "device {index}: no mmls region found and static fallback is disabled"
                )));
            }
        };

        Ok(Self {
            index,
            size,
            backing,
            backend,
            cache,
            lock: SleepLock::new(DeviceStats::default()),
            notify: NotifyRegistry::new(),
            mmap_policy: config.mmap_policy,
            overrun: config.overrun,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Total addressable bytes. Immutable, so no lock is taken.
    pub fn query_size(&self) -> u64 {
        self.size
    }

    pub fn mode(&self) -> BackingMode {
        match self.backing {
            Backing::Static { .. } => BackingMode::StaticBuffer,
            Backing::Physical { .. } => BackingMode::PhysicalRegion,
        }
    }

    pub fn phys_start(&self) -> Option<u64> {
        match self.backing {
            Backing::Static { .. } => None,
            Backing::Physical { phys_start, .. } => Some(phys_start),
        }
    }

    /// Size in whole sectors; zero for the static buffer, which has no medium.
    pub fn sector_count(&self) -> u64 {
        match self.backing {
            Backing::Static { .. } => 0,
            Backing::Physical { sector_count, .. } => sector_count,
        }
    }

    /// Driver-side virtual address of offset 0.
    pub fn virt_base(&self) -> u64 {
        self.window().virt_base()
    }

    pub fn mmap_policy(&self) -> CachePolicy {
        self.mmap_policy
    }

    pub fn stats(&self) -> DeviceStats {
        *self.lock.lock()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    fn window(&self) -> &IoMem {
        match &self.backing {
            Backing::Static { buffer } => buffer,
            Backing::Physical { iomem, .. } => iomem,
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_torn_down() {
            return Err(CdevError::NoDevice);
        }
        Ok(())
    }

    /// Takes the device lock, then re-checks liveness: a teardown may have run while we waited.
    fn lock_live(&self, intr: &Interrupt) -> Result<SleepLockGuard<'_, DeviceStats>> {
        let guard = self.lock.lock_interruptible(intr)?;
        self.ensure_live()?;
        Ok(guard)
    }

    fn clip(&self, offset: u64, len: u64) -> Result<Clipped> {
        if offset >= self.size {
            tracing::error!(
                device = self.index,
                offset,
                len,
                size = self.size,
                "offset exceeds device size"
            );
            return Err(CdevError::OutOfRange {
                offset,
                len,
                size: self.size,
            });
        }

        let remaining = self.size - offset;
        let clipped = len > remaining;
        if clipped && self.overrun == OverrunPolicy::Reject {
            return Err(CdevError::OutOfRange {
                offset,
                len,
                size: self.size,
            });
        }

        // Both values are below `size`, which is the length of an in-memory window.
        Ok(Clipped {
            start: offset as usize,
            len: len.min(remaining) as usize,
            clipped,
        })
    }

    /// Reads up to `buf.len()` bytes at `offset` into `buf` and returns how many were read.
    ///
    /// A request running past the end is shortened rather than failed. On a physical region the
    /// medium is asked to refresh the window before the copy.
    pub fn read<B: UserBufferMut + ?Sized>(
        &self,
        offset: u64,
        buf: &mut B,
        intr: &Interrupt,
    ) -> Result<usize> {
        self.ensure_live()?;
        tracing::debug!(device = self.index, offset, count = buf.len(), size = self.size, "read");

        let mut stats = self.lock_live(intr)?;
        let range = self.clip(offset, buf.len() as u64)?;
        if range.clipped {
            stats.clipped += 1;
        }

        if let Backing::Physical { iomem, .. } = &self.backing {
            if range.len > 0 {
                let req = SectorRequest::covering(offset, range.len as u64, iomem.virt_base());
                self.backend.read_sectors(req, iomem)?;
            }
        }
        copy_to_caller(self.window(), range, buf)?;

        stats.reads += 1;
        stats.bytes_read += range.len as u64;
        Ok(range.len)
    }

    /// Writes `buf` at `offset` and returns how many bytes were written.
    ///
    /// Data is stored into the backing and flushed out of the CPU cache line by line, then on a
    /// physical region committed to the medium. A caller fault stops the copy; chunks already
    /// stored stay stored and nothing is committed.
    pub fn write<B: UserBuffer + ?Sized>(
        &self,
        offset: u64,
        buf: &B,
        intr: &Interrupt,
    ) -> Result<usize> {
        self.ensure_live()?;
        tracing::debug!(device = self.index, offset, count = buf.len(), size = self.size, "write");

        let mut stats = self.lock_live(intr)?;
        let range = self.clip(offset, buf.len() as u64)?;
        if range.clipped {
            stats.clipped += 1;
        }

        copy_from_caller(self.window(), range, buf, self.cache.as_ref())?;
        if let Backing::Physical { iomem, .. } = &self.backing {
            if range.len > 0 {
                let req = SectorRequest::covering(offset, range.len as u64, iomem.virt_base());
                self.backend.write_sectors(req, iomem)?;
            }
        }

        stats.writes += 1;
        stats.bytes_written += range.len as u64;
        Ok(range.len)
    }

    /// Flushes the CPU cache lines covering `range`, clipped to the device.
    ///
    /// Returns the range actually flushed.
    pub fn flush_range(&self, range: MmlsRange, intr: &Interrupt) -> Result<MmlsRange> {
        self.ensure_live()?;
        let clipped = self.clip(range.offset, range.size)?;

        let mut stats = self.lock_live(intr)?;
        self.cache
            .flush_range(self.window(), clipped.start, clipped.len);
        stats.flushes += 1;

        tracing::debug!(
            device = self.index,
            offset = range.offset,
            len = clipped.len,
            lines = lines_covering(clipped.start, clipped.len),
            "flushed range"
        );
        Ok(MmlsRange::new(range.offset, clipped.len as u64))
    }

    /// Emits every byte of `range`, clipped to the device, to `sink`.
    ///
    /// Byte at a time; meant for small diagnostic ranges only.
    pub fn dump_range(
        &self,
        range: MmlsRange,
        sink: &mut dyn DumpSink,
        intr: &Interrupt,
    ) -> Result<MmlsRange> {
        self.ensure_live()?;
        let clipped = self.clip(range.offset, range.size)?;
        tracing::debug!(
            device = self.index,
            iomem = format_args!("0x{:x}", self.virt_base()),
            offset = range.offset,
            len = clipped.len,
            "dump"
        );

        let mut stats = self.lock_live(intr)?;
        let window = self.window();
        for at in clipped.start..clipped.start + clipped.len {
            sink.emit(at as u64, window.load_u8(at));
        }
        stats.dumps += 1;

        Ok(MmlsRange::new(range.offset, clipped.len as u64))
    }

    /// Maps `[offset, offset + len)` of the physical region into `space`.
    ///
    /// The lock is not taken: once this returns the caller accesses the region directly and this
    /// device no longer mediates or orders those accesses.
    pub fn map_region(
        &self,
        space: Arc<dyn AddressSpace>,
        offset: u64,
        len: u64,
    ) -> Result<Mapping> {
        self.ensure_live()?;
        tracing::info!(device = self.index, offset, len, policy = %self.mmap_policy, "mmap");

        match &self.backing {
            Backing::Static { .. } => Err(CdevError::Unsupported(
                "mapping a device backed by the static buffer",
            )),
            Backing::Physical {
                phys_start, iomem, ..
            } => mmap::establish(
                space,
                iomem,
                *phys_start,
                self.size,
                offset,
                len,
                self.mmap_policy,
            ),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.notify.subscribe()
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.notify.unsubscribe(id)
    }

    /// Signals every subscriber. Used by the command layer; the data path never calls it.
    pub fn notify(&self, event: NotifyEvent) -> usize {
        self.notify.notify(event)
    }

    /// Tears the device down. Idempotent.
    ///
    /// Waits for any operation holding the lock, invalidates outstanding mappings, releases the
    /// backing reference and tells subscribers the device is gone. Later operations fail with
    /// [`CdevError::NoDevice`]. Caches are not flushed.
    pub fn shutdown(&self) {
        let guard = self.lock.lock();
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Backing::Physical { iomem, .. } = &self.backing {
            iomem.revoke();
            self.backend.release(self.index);
        }
        drop(guard);

        self.notify.notify(NotifyEvent::Hangup);
        tracing::info!(device = self.index, "device torn down");
    }
}

impl Drop for MmlsDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn copy_to_caller<B: UserBufferMut + ?Sized>(
    window: &IoMem,
    range: Clipped,
    buf: &mut B,
) -> Result<()> {
    let mut chunk = [0u8; COPY_CHUNK];
    let mut done = 0;
    while done < range.len {
        let n = (range.len - done).min(COPY_CHUNK);
        window.load(range.start + done, &mut chunk[..n]);
        buf.copy_to_user(done, &chunk[..n]).map_err(|fault| {
            tracing::error!(at = fault.at, "copy to caller failed");
            CdevError::Fault { at: fault.at }
        })?;
        done += n;
    }
    Ok(())
}

fn copy_from_caller<B: UserBuffer + ?Sized>(
    window: &IoMem,
    range: Clipped,
    buf: &B,
    cache: &dyn CacheMaintenance,
) -> Result<()> {
    let mut chunk = [0u8; COPY_CHUNK];
    let mut done = 0;
    while done < range.len {
        let n = (range.len - done).min(COPY_CHUNK);
        buf.copy_from_user(done, &mut chunk[..n]).map_err(|fault| {
            tracing::error!(at = fault.at, "copy from caller failed");
            CdevError::Fault { at: fault.at }
        })?;
        window.store(range.start + done, &chunk[..n]);
        cache.flush_range(window, range.start + done, n);
        done += n;
    }
    Ok(())
}

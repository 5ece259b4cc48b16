//! Driver-side view of a backing window.
//!
//! The same bytes are reached from two directions: the locked data path (read/write/flush/dump)
//! and caller mappings, which bypass the lock entirely. Every byte is therefore an [`AtomicU8`]
//! so that unsynchronized access from both sides is a benign race rather than undefined
//! behaviour. Coherence between the two paths is still the caller's problem.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::{CdevError, Result};

pub struct IoMem {
    bytes: Box<[AtomicU8]>,
    revoked: AtomicBool,
}

impl IoMem {
    /// Allocates a zero-filled window of `len` bytes.
    ///
    /// Allocation failure is reported instead of aborting so that initialization can surface it
    /// as a fatal device error.
    pub fn zeroed(len: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| CdevError::Fatal(format!("cannot allocate {len} byte window")))?;
        bytes.extend((0..len).map(|_| AtomicU8::new(0)));
        Ok(Self {
            bytes: bytes.into_boxed_slice(),
            revoked: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Virtual address of byte 0 of the window.
    pub fn virt_base(&self) -> u64 {
        self.as_ptr() as u64
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr().cast()
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the window.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside the window; callers clip before touching memory.
    pub fn load(&self, offset: usize, dst: &mut [u8]) {
        let src = &self.bytes[offset..offset + dst.len()];
        for (slot, byte) in dst.iter_mut().zip(src) {
            *slot = byte.load(Ordering::Relaxed);
        }
    }

    /// Copies `src` into the window starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range lies outside the window.
    pub fn store(&self, offset: usize, src: &[u8]) {
        let dst = &self.bytes[offset..offset + src.len()];
        for (slot, byte) in dst.iter().zip(src.iter().copied()) {
            slot.store(byte, Ordering::Relaxed);
        }
    }

    pub fn load_u8(&self, offset: usize) -> u8 {
        self.bytes[offset].load(Ordering::Relaxed)
    }

    pub fn store_u8(&self, offset: usize, value: u8) {
        self.bytes[offset].store(value, Ordering::Relaxed);
    }

    /// Copies `len` bytes between two offsets of possibly different windows.
    pub fn copy_within(src: &IoMem, src_offset: usize, dst: &IoMem, dst_offset: usize, len: usize) {
        let mut chunk = [0u8; 512];
        let mut done = 0;
        while done < len {
            let n = (len - done).min(chunk.len());
            src.load(src_offset + done, &mut chunk[..n]);
            dst.store(dst_offset + done, &chunk[..n]);
            done += n;
        }
    }

    /// Marks the window as no longer backed by a live device.
    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

impl fmt::Debug for IoMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoMem")
            .field("virt_base", &format_args!("0x{:x}", self.virt_base()))
            .field("len", &self.len())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

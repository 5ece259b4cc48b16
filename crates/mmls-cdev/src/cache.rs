//! CPU cache maintenance over backing windows.
//!
//! Directly exposed physical memory does not get the write-back guarantees an ordinary I/O path
//! would give, so flushing is an explicit operation. Nothing here decides *when* to flush; that
//! stays with the caller (`flush_range`) and with the data path's uncached write copy.

use core::sync::atomic::{fence, Ordering};

use crate::IoMem;

pub const CACHE_LINE_SIZE: usize = 64;

/// Writes back and invalidates the cache lines covering a byte range of a window.
pub trait CacheMaintenance: Send + Sync {
    /// Flushes `[offset, offset + len)` of `mem`. The range is already bounds-checked.
    fn flush_range(&self, mem: &IoMem, offset: usize, len: usize);
}

/// Flushes with the host CPU's cache-line instructions.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuCache;

impl CacheMaintenance for CpuCache {
    fn flush_range(&self, mem: &IoMem, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        debug_assert!(offset + len <= mem.len());

        let base = mem.as_ptr();
        let first = offset - offset % CACHE_LINE_SIZE;
        let end = offset + len;

        #[cfg(target_arch = "x86_64")]
        {
            let mut line = first;
            while line < end {
                // Safety: `line` is within `[0, mem.len())` because `first <= offset < end <=
                // mem.len()`, so the pointer stays inside the allocation. `clflush` has no other
                // preconditions and SSE2 is part of the x86_64 baseline.
                unsafe { core::arch::x86_64::_mm_clflush(base.wrapping_add(line)) };
                line += CACHE_LINE_SIZE;
            }
            // Safety: `mfence` has no preconditions.
            unsafe { core::arch::x86_64::_mm_mfence() };
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (base, first, end);
            fence(Ordering::SeqCst);
        }

        tracing::trace!(offset, len, "flushed cache lines");
        fence(Ordering::SeqCst);
    }
}

/// Number of cache lines touched by `[offset, offset + len)`.
pub fn lines_covering(offset: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    let first = offset / CACHE_LINE_SIZE;
    let last = (offset + len - 1) / CACHE_LINE_SIZE;
    last - first + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_covering_counts_partial_lines() {
        assert_eq!(lines_covering(0, 0), 0);
        assert_eq!(lines_covering(0, 1), 1);
        assert_eq!(lines_covering(0, 64), 1);
        assert_eq!(lines_covering(63, 2), 2);
        assert_eq!(lines_covering(4096, 4096), 64);
    }

    #[test]
    fn cpu_flush_preserves_contents() {
        let mem = IoMem::zeroed(300).unwrap();
        mem.store(5, &[0xAB; 290]);

        CpuCache.flush_range(&mem, 5, 290);

        let mut back = [0u8; 290];
        mem.load(5, &mut back);
        assert!(back.iter().all(|b| *b == 0xAB));
    }
}

//! Open handles onto a device.
//!
//! A [`DeviceHandle`] carries the per-open state: the file position and the interrupt used to
//! abandon a wait on the device lock. It also adapts the device to `std::io`.

use std::io::{self, SeekFrom};
use std::sync::Arc;

use crate::config::SeekEnd;
use crate::control::{
    DumpSink, MmlsRange, TracingDumpSink, MMLS_IOC_DUMP_MEM, MMLS_IOC_FLUSH_RANGE, MMLS_IOC_SIZE,
};
use crate::device::{MmlsDevice, STATIC_BUFFER_SIZE};
use crate::mmap::{AddressSpace, Mapping};
use crate::notify::Subscription;
use crate::sync::Interrupt;
use crate::user::{UserBuffer, UserBufferMut};
use crate::{CdevError, Result};

pub struct DeviceHandle {
    device: Arc<MmlsDevice>,
    pos: u64,
    intr: Interrupt,
    seek_end: SeekEnd,
}

impl DeviceHandle {
    pub(crate) fn new(device: Arc<MmlsDevice>, seek_end: SeekEnd) -> Self {
        tracing::debug!(device = device.index(), "open");
        Self {
            device,
            pos: 0,
            intr: Interrupt::new(),
            seek_end,
        }
    }

    pub fn device(&self) -> &Arc<MmlsDevice> {
        &self.device
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Returns a handle that can abandon this file's pending lock waits from another thread.
    pub fn interrupter(&self) -> Interrupt {
        self.intr.clone()
    }

    /// Reads at the current position and advances it by the number of bytes read.
    pub fn read<B: UserBufferMut + ?Sized>(&mut self, buf: &mut B) -> Result<usize> {
        let n = self.device.read(self.pos, buf, &self.intr)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Writes at the current position and advances it by the number of bytes written.
    pub fn write<B: UserBuffer + ?Sized>(&mut self, buf: &B) -> Result<usize> {
        let n = self.device.write(self.pos, buf, &self.intr)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Repositions the handle. A position past the end is allowed; the next transfer fails.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let new = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.end_anchor().checked_add_signed(delta),
        };
        let new = new.ok_or(CdevError::InvalidArgument(
            "seek to a negative or overflowing position",
        ))?;
        self.pos = new;
        Ok(new)
    }

    fn end_anchor(&self) -> u64 {
        match self.seek_end {
            SeekEnd::DeviceSize => self.device.query_size(),
            SeekEnd::StaticBufferCapacity => STATIC_BUFFER_SIZE as u64,
        }
    }

    /// Dispatches a control command, logging dumps through `tracing`.
    ///
    /// `arg` is the command's in/out argument block: an 8-byte slot for the size query, a
    /// 16-byte [`MmlsRange`] for flush and dump.
    pub fn ioctl(&self, cmd: u32, arg: &mut [u8]) -> Result<()> {
        let mut sink = TracingDumpSink {
            device: self.device.index(),
        };
        self.ioctl_with_sink(cmd, arg, &mut sink)
    }

    pub fn ioctl_with_sink(&self, cmd: u32, arg: &mut [u8], sink: &mut dyn DumpSink) -> Result<()> {
        match cmd {
            MMLS_IOC_SIZE => {
                let len = arg.len();
                let out = arg.get_mut(..8).ok_or(CdevError::Fault { at: len })?;
                out.copy_from_slice(&self.device.query_size().to_le_bytes());
                Ok(())
            }
            MMLS_IOC_FLUSH_RANGE => {
                let range = MmlsRange::from_bytes(arg)?;
                self.device.flush_range(range, &self.intr).map(drop)
            }
            MMLS_IOC_DUMP_MEM => {
                let range = MmlsRange::from_bytes(arg)?;
                self.device.dump_range(range, sink, &self.intr).map(drop)
            }
            _ => {
                tracing::debug!(
                    device = self.device.index(),
                    cmd = format_args!("0x{cmd:08x}"),
                    "unknown ioctl"
                );
                Err(CdevError::NotTty { cmd })
            }
        }
    }

    pub fn mmap(&self, space: Arc<dyn AddressSpace>, offset: u64, len: u64) -> Result<Mapping> {
        self.device.map_region(space, offset, len)
    }

    pub fn subscribe(&self) -> Subscription {
        self.device.subscribe()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        tracing::debug!(device = self.device.index(), "release");
    }
}

impl io::Read for DeviceHandle {
    /// Reading at or past the end reports end of file.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match DeviceHandle::read(self, buf) {
            Err(CdevError::OutOfRange { offset, size, .. }) if offset >= size => Ok(0),
            other => other.map_err(Into::into),
        }
    }
}

impl io::Write for DeviceHandle {
    /// Writing at or past the end accepts nothing, which `write_all` reports as `WriteZero`.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match DeviceHandle::write(self, buf) {
            Err(CdevError::OutOfRange { offset, size, .. }) if offset >= size => Ok(0),
            other => other.map_err(Into::into),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Seek for DeviceHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        DeviceHandle::seek(self, pos).map_err(Into::into)
    }
}

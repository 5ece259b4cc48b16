//! Caller-supplied buffers.
//!
//! The data path never borrows caller memory as a plain slice for the whole transfer. It copies
//! through these traits chunk by chunk, so a buffer that stops being accessible part-way (a bad
//! user pointer, a guard page) fails the operation with [`crate::CdevError::Fault`] after the
//! earlier chunks have already landed.

use thiserror::Error;

/// Caller memory at buffer index `at` was not accessible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("caller buffer not accessible at index {at}")]
pub struct UserFault {
    pub at: usize,
}

/// A caller buffer the device copies out of (the source of a write).
pub trait UserBuffer {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `dst.len()` bytes starting at buffer index `at` into `dst`.
    fn copy_from_user(&self, at: usize, dst: &mut [u8]) -> Result<(), UserFault>;
}

/// A caller buffer the device copies into (the destination of a read).
pub trait UserBufferMut: UserBuffer {
    /// Copies `src` into the buffer starting at index `at`.
    fn copy_to_user(&mut self, at: usize, src: &[u8]) -> Result<(), UserFault>;
}

impl UserBuffer for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn copy_from_user(&self, at: usize, dst: &mut [u8]) -> Result<(), UserFault> {
        let src = self
            .get(at..at + dst.len())
            .ok_or(UserFault { at: at.max(<[u8]>::len(self)) })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl UserBufferMut for [u8] {
    fn copy_to_user(&mut self, at: usize, src: &[u8]) -> Result<(), UserFault> {
        let len = <[u8]>::len(self);
        let dst = self
            .get_mut(at..at + src.len())
            .ok_or(UserFault { at: at.max(len) })?;
        dst.copy_from_slice(src);
        Ok(())
    }
}

impl UserBuffer for Vec<u8> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn copy_from_user(&self, at: usize, dst: &mut [u8]) -> Result<(), UserFault> {
        self.as_slice().copy_from_user(at, dst)
    }
}

impl UserBufferMut for Vec<u8> {
    fn copy_to_user(&mut self, at: usize, src: &[u8]) -> Result<(), UserFault> {
        self.as_mut_slice().copy_to_user(at, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_copy_out_of_bounds_faults() {
        let buf = [1u8, 2, 3];
        let mut dst = [0u8; 2];
        assert_eq!(buf[..].copy_from_user(2, &mut dst), Err(UserFault { at: 3 }));

        buf[..].copy_from_user(1, &mut dst).unwrap();
        assert_eq!(dst, [2, 3]);
    }

    #[test]
    fn vec_copy_to_user_writes_in_place() {
        let mut buf = vec![0u8; 4];
        buf.copy_to_user(1, &[9, 9]).unwrap();
        assert_eq!(buf, vec![0, 9, 9, 0]);
        assert!(buf.copy_to_user(3, &[1, 1]).is_err());
    }
}

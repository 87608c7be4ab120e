//! The client's view of the server's shared-memory region.
//!
//! The session server passes its memfd once per mapping; the client maps
//! it and only ever addresses it through the `(offset, max_len)` windows
//! announced in NeedMediaData events. Segment records are staged in
//! process-local memory and copied into the window in one go.

use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr::NonNull;

use rialto_core::segments::SegmentWriter;
use rialto_core::types::{MediaSegmentHeader, ShmInfo};

use crate::error::{ClientError, ClientResult};

/// A read/write mapping of the region backing all partitions.
pub struct ClientSharedMemory {
    base: NonNull<u8>,
    len: usize,
}

// Safety: access goes through bounds-checked copies only; concurrent use
// is governed by the need-data/have-data protocol.
unsafe impl Send for ClientSharedMemory {}
unsafe impl Sync for ClientSharedMemory {}

impl ClientSharedMemory {
    /// Maps `len` bytes of the received memfd.
    pub fn map(fd: &OwnedFd, len: u64) -> ClientResult<Self> {
        if len == 0 {
            return Err(ClientError::SharedMemory("zero-length region".into()));
        }
        // Safety: mapping a descriptor we own for its announced length.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(ClientError::SharedMemory(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            base: NonNull::new(base.cast::<u8>())
                .ok_or_else(|| ClientError::SharedMemory("mmap returned null".into()))?,
            len: len as usize,
        })
    }

    /// Total mapped length.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_window(&self, window: ShmInfo) -> ClientResult<()> {
        let end = window
            .offset
            .checked_add(window.max_len)
            .ok_or_else(|| ClientError::SharedMemory("window overflows".into()))?;
        if end > self.len as u64 {
            return Err(ClientError::SharedMemory(format!(
                "window [{}, {end}) outside the {} byte mapping",
                window.offset, self.len
            )));
        }
        Ok(())
    }

    /// Stages `segments` as partition records and copies them into the
    /// announced window. Returns the number of frames written.
    pub fn write_segments(
        &self,
        window: ShmInfo,
        segments: &[(MediaSegmentHeader, &[u8])],
    ) -> ClientResult<u32> {
        self.check_window(window)?;

        let mut staging = vec![0u8; window.max_len as usize];
        let mut writer = SegmentWriter::new(&mut staging);
        for (header, payload) in segments {
            writer.write(header, payload)?;
        }
        let frames = writer.frames_written();
        let bytes = writer.bytes_written();

        // Safety: the window was bounds-checked against this mapping.
        unsafe {
            std::ptr::copy_nonoverlapping(
                staging.as_ptr(),
                self.base.as_ptr().add(window.offset as usize),
                bytes,
            );
        }
        Ok(frames)
    }

    /// Copies bytes out of a window; diagnostics and tests.
    pub fn read_window(&self, window: ShmInfo) -> ClientResult<Vec<u8>> {
        self.check_window(window)?;
        let mut out = vec![0u8; window.max_len as usize];
        // Safety: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(window.offset as usize),
                out.as_mut_ptr(),
                window.max_len as usize,
            );
        }
        Ok(out)
    }
}

impl Drop for ClientSharedMemory {
    fn drop(&mut self) {
        // Safety: unmapping the exact mapping created in `map`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

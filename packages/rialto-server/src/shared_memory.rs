//! The shared-memory partition allocator.
//!
//! One memfd per session server, mapped read/write once at startup. Each
//! playback gets a contiguous region subdivided into fixed partitions - one
//! per media source type for generic playback, one per player handle for web
//! audio. Producers (clients) are told `(offset, max_len)` pairs and never
//! learn the session base offset; the fd itself travels over the RPC channel
//! once per mapping.
//!
//! Partition disjointness is structural: offsets are computed from fixed
//! slot sizes, so two live mappings can never overlap. Violating that would
//! be a fatal bug, and the accessors double-check bounds before handing out
//! windows.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use parking_lot::Mutex;
use tracing::{debug, error};

use rialto_core::error::{ServiceError, ServiceResult};
use rialto_core::types::{MediaSourceType, PlaybackType, SessionId, ShmInfo};

/// Partition sizing for one session server.
#[derive(Debug, Clone, Copy)]
pub struct SharedMemoryConfig {
    pub max_playbacks: u32,
    pub max_web_audio_players: u32,
    pub audio_partition_len: u64,
    pub video_partition_len: u64,
    pub subtitle_partition_len: u64,
    pub web_audio_partition_len: u64,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            max_playbacks: 2,
            max_web_audio_players: 1,
            audio_partition_len: 1024 * 1024,
            video_partition_len: 7 * 1024 * 1024,
            subtitle_partition_len: 256 * 1024,
            web_audio_partition_len: 640 * 1024,
        }
    }
}

impl SharedMemoryConfig {
    fn generic_session_len(&self) -> u64 {
        self.audio_partition_len + self.video_partition_len + self.subtitle_partition_len
    }

    fn total_len(&self) -> u64 {
        u64::from(self.max_playbacks) * self.generic_session_len()
            + u64::from(self.max_web_audio_players) * self.web_audio_partition_len
    }

    fn validate(&self) -> ServiceResult<()> {
        if self.total_len() == 0 {
            return Err(ServiceError::ResourceExhausted(
                "shared memory size is zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
struct SlotTable {
    generic: Vec<Option<SessionId>>,
    web_audio: Vec<Option<u32>>,
}

/// The mapped region plus the partition table. The table lives in
/// server-side metadata, never inside the region itself.
pub struct SharedMemoryBuffer {
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
    config: SharedMemoryConfig,
    slots: Mutex<SlotTable>,
}

// Safety: the raw base pointer is only dereferenced through the bounded
// accessors below; concurrent access is either the cross-process producer
// protocol or zeroing under the slot lock.
unsafe impl Send for SharedMemoryBuffer {}
unsafe impl Sync for SharedMemoryBuffer {}

impl SharedMemoryBuffer {
    /// Creates the memfd, sizes it and maps it read/write.
    pub fn new(config: SharedMemoryConfig) -> ServiceResult<Self> {
        config.validate()?;
        let len = config.total_len() as usize;

        let name = CString::new("rialto-av-shm")
            .map_err(|e| ServiceError::Fatal(format!("shm name: {e}")))?;
        // Safety: plain syscalls; the returned fd is owned immediately.
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(ServiceError::ResourceExhausted(format!(
                "memfd_create failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(ServiceError::ResourceExhausted(format!(
                "ftruncate({len}) failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        // Safety: fresh anonymous mapping over the whole memfd.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            error!("mmap of {len} byte shared region failed");
            return Err(ServiceError::Fatal(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let slots = SlotTable {
            generic: vec![None; config.max_playbacks as usize],
            web_audio: vec![None; config.max_web_audio_players as usize],
        };
        debug!(len, "shared memory region mapped");

        Ok(Self {
            fd,
            base: NonNull::new(base.cast::<u8>())
                .ok_or_else(|| ServiceError::Fatal("mmap returned null".into()))?,
            len,
            config,
            slots: Mutex::new(slots),
        })
    }

    /// Total length of the region in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Duplicates the backing fd for passing over SCM_RIGHTS.
    pub fn dup_fd(&self) -> ServiceResult<OwnedFd> {
        self.fd
            .try_clone()
            .map_err(|e| ServiceError::ResourceExhausted(format!("dup shm fd: {e}")))
    }

    /// Reserves a partition slot for the given playback.
    ///
    /// Mapping an already-mapped id is a no-op; running out of slots is
    /// `ResourceExhausted` (the max-playbacks budget).
    pub fn map_partition(&self, playback: PlaybackType, id: u32) -> ServiceResult<()> {
        let mut slots = self.slots.lock();
        let table = match playback {
            PlaybackType::Generic => &mut slots.generic,
            PlaybackType::WebAudio => &mut slots.web_audio,
        };
        if table.iter().any(|slot| *slot == Some(id)) {
            return Ok(());
        }
        match table.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(id);
                Ok(())
            }
            None => Err(ServiceError::ResourceExhausted(format!(
                "no free {playback:?} partition for id {id}"
            ))),
        }
    }

    /// Releases a playback's partition slot. Returns whether it was mapped.
    pub fn unmap_partition(&self, playback: PlaybackType, id: u32) -> bool {
        let mut slots = self.slots.lock();
        let table = match playback {
            PlaybackType::Generic => &mut slots.generic,
            PlaybackType::WebAudio => &mut slots.web_audio,
        };
        for slot in table.iter_mut() {
            if *slot == Some(id) {
                *slot = None;
                return true;
            }
        }
        false
    }

    fn slot_index(&self, playback: PlaybackType, id: u32) -> Option<usize> {
        let slots = self.slots.lock();
        let table = match playback {
            PlaybackType::Generic => &slots.generic,
            PlaybackType::WebAudio => &slots.web_audio,
        };
        table.iter().position(|slot| *slot == Some(id))
    }

    fn partition_window(
        &self,
        playback: PlaybackType,
        id: u32,
        source_type: MediaSourceType,
    ) -> Option<ShmInfo> {
        let index = self.slot_index(playback, id)? as u64;
        match playback {
            PlaybackType::Generic => {
                let base = index * self.config.generic_session_len();
                let (offset, max_len) = match source_type {
                    MediaSourceType::Audio => (base, self.config.audio_partition_len),
                    MediaSourceType::Video => (
                        base + self.config.audio_partition_len,
                        self.config.video_partition_len,
                    ),
                    MediaSourceType::Subtitle => (
                        base + self.config.audio_partition_len + self.config.video_partition_len,
                        self.config.subtitle_partition_len,
                    ),
                    MediaSourceType::Unknown => return None,
                };
                Some(ShmInfo { offset, max_len })
            }
            PlaybackType::WebAudio => {
                let base = u64::from(self.config.max_playbacks) * self.config.generic_session_len()
                    + index * self.config.web_audio_partition_len;
                Some(ShmInfo {
                    offset: base,
                    max_len: self.config.web_audio_partition_len,
                })
            }
        }
    }

    /// Byte offset of the partition's data, for handing to a producer.
    pub fn data_offset(
        &self,
        playback: PlaybackType,
        id: u32,
        source_type: MediaSourceType,
    ) -> ServiceResult<u64> {
        self.partition_window(playback, id, source_type)
            .map(|window| window.offset)
            .ok_or_else(|| {
                ServiceError::ResourceExhausted(format!(
                    "no {playback:?} partition mapped for id {id}"
                ))
            })
    }

    /// Maximum bytes a producer may write; 0 means "no such partition".
    #[must_use]
    pub fn max_data_len(
        &self,
        playback: PlaybackType,
        id: u32,
        source_type: MediaSourceType,
    ) -> u64 {
        self.partition_window(playback, id, source_type)
            .map(|window| window.max_len)
            .unwrap_or(0)
    }

    /// The producer window for a partition, when mapped.
    #[must_use]
    pub fn window(
        &self,
        playback: PlaybackType,
        id: u32,
        source_type: MediaSourceType,
    ) -> Option<ShmInfo> {
        self.partition_window(playback, id, source_type)
    }

    /// Makes a partition logically empty. Outstanding producer offsets into
    /// it become invalid.
    pub fn clear_data(&self, playback: PlaybackType, id: u32, source_type: MediaSourceType) {
        if let Some(window) = self.partition_window(playback, id, source_type) {
            let _slots = self.slots.lock();
            // Safety: the window was computed against this mapping and is
            // in bounds by construction.
            unsafe {
                std::ptr::write_bytes(
                    self.base.as_ptr().add(window.offset as usize),
                    0,
                    window.max_len as usize,
                );
            }
        }
    }

    /// Copies `len` bytes out of the region (the consumer side of a
    /// HaveData cycle).
    pub fn copy_from_region(&self, offset: u64, len: u64) -> ServiceResult<Vec<u8>> {
        self.check_bounds(offset, len)?;
        let mut out = vec![0u8; len as usize];
        // Safety: bounds checked above; the producer protocol guarantees the
        // client finished writing before HaveData arrived.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len as usize,
            );
        }
        Ok(out)
    }

    /// Copies bytes into the region; used by in-process producers and tests.
    pub fn write_to_region(&self, offset: u64, data: &[u8]) -> ServiceResult<()> {
        self.check_bounds(offset, data.len() as u64)?;
        // Safety: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    fn check_bounds(&self, offset: u64, len: u64) -> ServiceResult<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| ServiceError::Fatal("region access overflows".into()))?;
        if end > self.len as u64 {
            return Err(ServiceError::Fatal(format!(
                "region access [{offset}, {end}) outside the {} byte mapping",
                self.len
            )));
        }
        Ok(())
    }
}

impl Drop for SharedMemoryBuffer {
    fn drop(&mut self) {
        // Safety: unmapping the exact mapping created in `new`.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

//! The protection-metadata pipeline.
//!
//! Encrypted segments arrive with per-buffer DRM material (key session, key
//! id, IV, subsample map, the PlayReady init flag). The server wraps the
//! payload in a [`MediaBuffer`] and attaches a [`ProtectionData`] record
//! that travels with the buffer until the downstream decryptor consumes it.
//! A buffer carries at most one record, the record shares the buffer's
//! lifetime, and the decryptor removes it before the buffer moves on. A
//! buffer without metadata passes the decryptor untouched.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use rialto_core::types::{ProtectionInfo, SubSample};

/// Errors raised along the decryption path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtectionError {
    /// A buffer already carries a metadata record.
    #[error("buffer already carries protection metadata")]
    AlreadyProtected,
    /// The decryption service rejected the buffer.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Per-buffer DRM material, borrowed by the buffer that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionData {
    pub key_session_id: u32,
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub subsamples: Vec<SubSample>,
    pub init_with_last_15: bool,
}

impl From<ProtectionInfo> for ProtectionData {
    fn from(info: ProtectionInfo) -> Self {
        Self {
            key_session_id: info.key_session_id,
            key_id: info.key_id,
            iv: info.iv,
            subsamples: info.subsamples,
            init_with_last_15: info.init_with_last_15,
        }
    }
}

/// One media buffer on its way into the pipeline, optionally carrying
/// protection metadata.
///
/// The metadata is owned by the buffer: dropping the buffer drops the
/// record, so the two can never have diverging lifetimes.
#[derive(Debug)]
pub struct MediaBuffer {
    pub data: Vec<u8>,
    pub time_ns: i64,
    pub duration_ns: i64,
    protection: Option<Box<ProtectionData>>,
}

impl MediaBuffer {
    #[must_use]
    pub fn new(data: Vec<u8>, time_ns: i64, duration_ns: i64) -> Self {
        Self {
            data,
            time_ns,
            duration_ns,
            protection: None,
        }
    }

    /// Attaches a metadata record. Exactly one record per buffer.
    pub fn attach_protection(&mut self, data: ProtectionData) -> Result<(), ProtectionError> {
        if self.protection.is_some() {
            return Err(ProtectionError::AlreadyProtected);
        }
        self.protection = Some(Box::new(data));
        Ok(())
    }

    /// True while a metadata record is attached.
    #[must_use]
    pub fn has_protection_metadata(&self) -> bool {
        self.protection.is_some()
    }

    /// Reads the attached record without consuming it.
    #[must_use]
    pub fn protection_metadata(&self) -> Option<&ProtectionData> {
        self.protection.as_deref()
    }

    /// Detaches and returns the record; the buffer is clear afterwards.
    pub fn remove_protection_metadata(&mut self) -> Option<ProtectionData> {
        self.protection.take().map(|boxed| *boxed)
    }
}

/// The DRM system boundary: decrypts one buffer in place.
pub trait DecryptionService: Send + Sync {
    fn decrypt(
        &self,
        key_session_id: u32,
        payload: &mut [u8],
        subsamples: &[SubSample],
        iv: &[u8],
        key_id: &[u8],
        init_with_last_15: bool,
    ) -> Result<(), ProtectionError>;
}

/// Outcome of running a buffer through the decryptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// Metadata was present; the buffer was decrypted and the record
    /// removed.
    Decrypted,
    /// No metadata; the buffer is treated as clear and passed through.
    Passthrough,
}

/// The decryptor element's core: consumes protection metadata and invokes
/// the decryption service.
pub struct BufferDecryptor {
    service: Arc<dyn DecryptionService>,
}

impl BufferDecryptor {
    #[must_use]
    pub fn new(service: Arc<dyn DecryptionService>) -> Self {
        Self { service }
    }

    /// Decrypts `buffer` in place.
    ///
    /// The metadata record is removed before returning, on success and on
    /// failure alike, so the buffer never leaves the decryptor still
    /// carrying key material. Errors surface to the caller, which reports
    /// them as a decryption playback error.
    pub fn decrypt(&self, buffer: &mut MediaBuffer) -> Result<DecryptOutcome, ProtectionError> {
        let Some(metadata) = buffer.remove_protection_metadata() else {
            return Ok(DecryptOutcome::Passthrough);
        };

        match self.service.decrypt(
            metadata.key_session_id,
            &mut buffer.data,
            &metadata.subsamples,
            &metadata.iv,
            &metadata.key_id,
            metadata.init_with_last_15,
        ) {
            Ok(()) => Ok(DecryptOutcome::Decrypted),
            Err(e) => {
                warn!(key_session = metadata.key_session_id, error = %e, "decrypt failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_protection() -> ProtectionData {
        ProtectionData {
            key_session_id: 3,
            key_id: vec![1; 16],
            iv: vec![2; 16],
            subsamples: vec![SubSample {
                clear_bytes: 4,
                encrypted_bytes: 12,
            }],
            init_with_last_15: false,
        }
    }

    /// XORs the payload; applying it twice restores the original.
    struct XorDecryptor {
        calls: AtomicUsize,
    }

    impl DecryptionService for XorDecryptor {
        fn decrypt(
            &self,
            _key_session_id: u32,
            payload: &mut [u8],
            _subsamples: &[SubSample],
            _iv: &[u8],
            _key_id: &[u8],
            _init_with_last_15: bool,
        ) -> Result<(), ProtectionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for byte in payload.iter_mut() {
                *byte ^= 0x5a;
            }
            Ok(())
        }
    }

    struct FailingDecryptor;

    impl DecryptionService for FailingDecryptor {
        fn decrypt(
            &self,
            _key_session_id: u32,
            _payload: &mut [u8],
            _subsamples: &[SubSample],
            _iv: &[u8],
            _key_id: &[u8],
            _init_with_last_15: bool,
        ) -> Result<(), ProtectionError> {
            Err(ProtectionError::DecryptionFailed("no such key session".into()))
        }
    }

    #[test]
    fn buffer_carries_exactly_one_metadata_record() {
        let mut buffer = MediaBuffer::new(vec![0; 16], 0, 0);
        assert!(!buffer.has_protection_metadata());

        buffer.attach_protection(sample_protection()).unwrap();
        assert!(buffer.has_protection_metadata());
        assert_eq!(
            buffer.attach_protection(sample_protection()),
            Err(ProtectionError::AlreadyProtected)
        );
    }

    #[test]
    fn removing_metadata_leaves_a_clear_buffer() {
        let mut buffer = MediaBuffer::new(vec![0; 16], 0, 0);
        buffer.attach_protection(sample_protection()).unwrap();

        let removed = buffer.remove_protection_metadata().unwrap();
        assert_eq!(removed.key_session_id, 3);
        assert!(!buffer.has_protection_metadata());
        assert!(buffer.remove_protection_metadata().is_none());
    }

    #[test]
    fn decrypt_roundtrip_consumes_the_metadata() {
        let service = Arc::new(XorDecryptor {
            calls: AtomicUsize::new(0),
        });
        let decryptor = BufferDecryptor::new(Arc::clone(&service) as Arc<dyn DecryptionService>);

        let mut buffer = MediaBuffer::new(vec![0x5a; 8], 0, 0);
        buffer.attach_protection(sample_protection()).unwrap();

        assert_eq!(decryptor.decrypt(&mut buffer).unwrap(), DecryptOutcome::Decrypted);
        assert!(!buffer.has_protection_metadata());
        assert_eq!(buffer.data, vec![0; 8]);
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_buffer_passes_through_untouched() {
        let decryptor = BufferDecryptor::new(Arc::new(XorDecryptor {
            calls: AtomicUsize::new(0),
        }));
        let mut buffer = MediaBuffer::new(vec![7; 4], 0, 0);

        assert_eq!(
            decryptor.decrypt(&mut buffer).unwrap(),
            DecryptOutcome::Passthrough
        );
        assert_eq!(buffer.data, vec![7; 4]);
    }

    #[test]
    fn failed_decrypt_still_removes_the_metadata() {
        let decryptor = BufferDecryptor::new(Arc::new(FailingDecryptor));
        let mut buffer = MediaBuffer::new(vec![1; 4], 0, 0);
        buffer.attach_protection(sample_protection()).unwrap();

        assert!(matches!(
            decryptor.decrypt(&mut buffer),
            Err(ProtectionError::DecryptionFailed(_))
        ));
        assert!(!buffer.has_protection_metadata());
    }
}

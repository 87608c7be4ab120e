//! Service-level error kinds surfaced across the RPC boundary.
//!
//! RPC handlers never panic across the boundary: failures either fail the
//! call's controller with a textual reason or surface as a `PlaybackError`
//! event. [`ServiceError`] is the taxonomy those reasons are built from.

use thiserror::Error;

/// Application-wide error kinds for playback operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// A caller-supplied argument is rejected, e.g. a zero playback rate or
    /// an empty mime type on attach.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation was issued before a successful `Load`.
    #[error("Session not initialized")]
    NotInitialized,

    /// A bounded resource ran out: partitions, playbacks, executor threads.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The decryption service rejected an encrypted buffer.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// An invariant was violated; the session server cannot continue.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl ServiceError {
    /// Returns a machine-readable error code for logs and call-failure
    /// reasons.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotInitialized => "not_initialized",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::DecryptionFailed(_) => "decryption_failed",
            Self::Fatal(_) => "fatal",
        }
    }

    /// True when the session server must terminate because of this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Convenient Result alias for service operations.
pub type ServiceResult<T> = Result<T, ServiceError>;

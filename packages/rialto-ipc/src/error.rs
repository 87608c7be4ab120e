//! Centralized error types for the IPC fabric.

use thiserror::Error;

use crate::frame::{DecodeError, EncodeError};

/// Errors surfaced by channels, servers and calls.
#[derive(Debug, Error)]
pub enum IpcError {
    /// A frame could not be encoded for transmission.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodeError),

    /// A received frame was malformed; the connection is closed.
    #[error("Decoding error: {0}")]
    Decoding(#[from] DecodeError),

    /// The peer violated the framing protocol; the connection is closed.
    #[error("Channel protocol error: {0}")]
    Protocol(String),

    /// The peer closed or the socket became unrecoverable. All pending
    /// calls are failed with this error exactly once.
    #[error("Channel disconnected")]
    Disconnected,

    /// The remote service handler failed the call with a textual reason.
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// An operating-system error outside the framing protocol.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    /// Returns a machine-readable error code for logs.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Encoding(_) => "encoding_error",
            Self::Decoding(_) => "decoding_error",
            Self::Protocol(_) => "channel_protocol_error",
            Self::Disconnected => "channel_disconnected",
            Self::CallFailed(_) => "rpc_call_failed",
            Self::Io(_) => "io_error",
        }
    }
}

/// Convenient Result alias for IPC operations.
pub type IpcResult<T> = Result<T, IpcError>;

//! Centralized error types for the client library.

use thiserror::Error;

use rialto_core::schema::SchemaError;
use rialto_core::segments::SegmentError;
use rialto_ipc::IpcError;

/// Errors surfaced by client-side operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The channel failed or the call was rejected by the server.
    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// A message body could not be encoded or decoded.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A segment record did not fit or could not be laid out.
    #[error(transparent)]
    Segments(#[from] SegmentError),

    /// Mapping or addressing the shared-memory region failed.
    #[error("shared memory: {0}")]
    SharedMemory(String),

    /// The server answered outside the protocol, e.g. a missing fd.
    #[error("protocol: {0}")]
    Protocol(String),
}

/// Convenient Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

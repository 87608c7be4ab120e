//! Rialto Core - shared vocabulary for the Rialto media playback service.
//!
//! Rialto is a multi-process playback system for constrained streaming
//! devices: a privileged server manager launches per-application session
//! servers, and each session server hosts playback pipelines driven by a
//! remote client library over an authenticated UNIX-domain RPC channel.
//! Encoded media frames travel through a shared-memory region rather than
//! over the socket.
//!
//! This crate holds everything both sides of that boundary must agree on:
//!
//! - [`types`]: media source types, identities, playback states, the media
//!   segment model and protection (DRM) records
//! - [`schema`]: the typed RPC surface - method ids, request/response bodies
//!   and event bodies, plus their wire encoding
//! - [`segments`]: the record layout of media segments inside a
//!   shared-memory partition
//! - [`config`]: session-server and server-manager configuration shared with
//!   the hosting process
//! - [`error`]: the service-level error kinds surfaced across the RPC
//!   boundary

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod schema;
pub mod segments;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    AppConfig, MaxResourceCapabilities, ServerManagerConfig, SessionServerState,
    SocketPermissions, resolve_socket_path,
};
pub use error::{ServiceError, ServiceResult};
pub use types::{
    AudioConfig, EaseType, MediaSegment, MediaSegmentHeader, MediaSourceStatus, MediaSourceType,
    MediaType, NetworkState, PlaybackState, PlaybackType, ProtectionInfo, QosInfo, SessionId,
    ShmInfo, SourceId, SubSample, VideoGeometry,
};

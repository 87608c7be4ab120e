//! Rialto Server - the session server core.
//!
//! A session server hosts the playback pipelines for one application. The
//! client library drives them over the RPC fabric (`rialto-ipc`); encoded
//! frames arrive through a shared-memory region rather than the socket.
//!
//! # Architecture
//!
//! - [`main_thread`]: the per-session task executor that serialises every
//!   state change
//! - [`shared_memory`]: the memfd-backed partition allocator
//! - [`backend`]: the named interface to the media pipeline collaborator
//! - [`player`]: per-source playback contexts and the task factory,
//!   including the flush-on-preroll barrier and need-data dedupe
//! - [`protection`]: per-buffer DRM metadata and the decryptor boundary
//! - [`capabilities`]: the sink/decoder property probe
//! - [`service`]: the RPC dispatch layer and session registry
//! - [`health`]: ping/ack bookkeeping for the server manager
//!
//! The pipeline itself, DRM system bindings and process management are
//! external collaborators reached only through the traits in [`backend`],
//! [`protection`] and [`capabilities`].

#![warn(clippy::all)]

pub mod backend;
pub mod capabilities;
pub mod health;
pub mod main_thread;
pub mod player;
pub mod protection;
pub mod service;
pub mod shared_memory;

// Re-export commonly used types at the crate root
pub use backend::{
    AppSrcId, AudioSinkKind, BackendError, BackendEventHandler, BusMessage, BusMessageSource,
    PipelineState, PlayerBackend, PlayerBackendFactory, SourceCaps,
};
pub use capabilities::{CapabilityProbe, FactoryClass, FactoryHandle, FactoryRegistry};
pub use health::{HealthMonitor, RecoveryObserver};
pub use main_thread::MainThread;
pub use player::{
    EventSink, FlushOnPrerollController, FlushWatcher, NeedDataMapping, PlayerError, PlayerSession,
    SourceState, NEED_DATA_FRAME_COUNT,
};
pub use protection::{
    BufferDecryptor, DecryptOutcome, DecryptionService, MediaBuffer, ProtectionData,
    ProtectionError,
};
pub use service::web_audio::WebAudioService;
pub use service::{PlaybackService, PlaybackServiceConfig};
pub use shared_memory::{SharedMemoryBuffer, SharedMemoryConfig};

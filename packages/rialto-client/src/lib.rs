//! Rialto Client - the application-side library of the Rialto playback
//! service.
//!
//! Lives in the application process and talks to a session server over the
//! RPC fabric: typed stubs for every playback operation, event demux onto a
//! caller-supplied callback object, and the writer that places encoded
//! frames into the shared-memory partition announced by NeedMediaData
//! events.
//!
//! # Modules
//!
//! - [`connection`]: socket connection plus the thread driving the channel
//! - [`pipeline`]: the media pipeline stub and its callbacks
//! - [`web_audio`]: the web-audio player stub
//! - [`control`]: session-server state observation and keepalive
//! - [`shm`]: the received shared-memory mapping and segment writer

#![warn(clippy::all)]

pub mod connection;
pub mod control;
pub mod error;
pub mod pipeline;
pub mod shm;
pub mod web_audio;

pub use connection::ClientConnection;
pub use control::ControlClient;
pub use error::{ClientError, ClientResult};
pub use pipeline::{MediaPipelineCallbacks, MediaPipelineClient};
pub use shm::ClientSharedMemory;
pub use web_audio::WebAudioPlayerClient;

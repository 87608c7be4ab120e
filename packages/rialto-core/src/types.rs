//! Core media types shared between the client library and the session server.
//!
//! Identities ([`SessionId`], [`SourceId`]) are plain integers assigned by the
//! server; the segment model ([`MediaSegmentHeader`], [`MediaSegment`])
//! describes the records the client writes into its shared-memory partition
//! and the server reads back out.

use serde::{Deserialize, Serialize};

/// Identifies one playback session within a session server.
///
/// Unique for the lifetime of the session server; assigned when the client
/// requests a new playback.
pub type SessionId = u32;

/// Identifies one attached source within a session.
///
/// Assigned on attach. A remove followed by a re-attach of the same media
/// source type yields a fresh id; ids are never reused for a different
/// attach.
pub type SourceId = u32;

/// The type of an attached media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSourceType {
    Unknown,
    Audio,
    Video,
    Subtitle,
}

impl MediaSourceType {
    /// Returns the source type as a short string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Subtitle => "subtitle",
        }
    }
}

/// The playback flavour a shared-memory partition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackType {
    /// Main MSE-style playback with audio/video/subtitle partitions.
    Generic,
    /// Web-audio playback with one partition per player handle.
    WebAudio,
}

/// The media container flavour requested on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Unknown,
    /// Media-source-extensions style playback; frames arrive via HaveData.
    Mse,
}

/// Playback pipeline state reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Unknown,
    Idle,
    Playing,
    Paused,
    Seeking,
    Flushed,
    Stopped,
    EndOfStream,
    Failure,
}

/// Network/buffering state reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    Unknown,
    Idle,
    Buffering,
    Buffered,
    Stalled,
    FormatError,
    NetworkError,
    DecodeError,
}

/// Status carried by a HaveData request answering a NeedData cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSourceStatus {
    /// Frames were written into the announced partition slot.
    Ok,
    /// The stream has ended; no further frames will be supplied.
    EndOfStream,
    /// The client had nothing to supply for this cycle.
    NoAvailableSamples,
    /// The client failed to produce data.
    Error,
}

/// PCM configuration for an audio source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AudioConfig {
    pub channels: u32,
    pub sample_rate: u32,
    /// Codec-specific configuration blob forwarded into the caps.
    pub codec_specific_config: Option<Vec<u8>>,
}

/// Window geometry for video output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VideoGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Easing curve for a volume fade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EaseType {
    #[default]
    Linear,
    CubicIn,
    CubicOut,
}

/// Quality-of-service counters for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QosInfo {
    pub processed: u64,
    pub dropped: u64,
}

/// One clear/encrypted byte-range pair of a subsample map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSample {
    pub clear_bytes: u32,
    pub encrypted_bytes: u32,
}

/// Per-buffer DRM material carried alongside an encrypted segment until a
/// downstream decryptor consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionInfo {
    /// Matches an open DRM session on the decryption service.
    pub key_session_id: u32,
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub subsamples: Vec<SubSample>,
    /// PlayReady-specific initialisation flag.
    pub init_with_last_15: bool,
}

/// The `(offset, max_len)` window of a shared-memory partition announced to
/// the client in a NeedMediaData event.
///
/// The client never learns the session base offset; it writes at most
/// `max_len` bytes starting at `offset` within the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShmInfo {
    pub offset: u64,
    pub max_len: u64,
}

/// Header of one media segment record in a shared-memory partition.
///
/// Records are laid out back to back: a little-endian `u32` header length,
/// the encoded header, then `payload_len` bytes of encoded media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSegmentHeader {
    pub source_id: SourceId,
    pub source_type: MediaSourceType,
    pub time_ns: i64,
    pub duration_ns: i64,
    pub payload_len: u32,
    /// Audio-only stream parameters.
    pub audio: Option<AudioConfig>,
    /// Video-only frame dimensions.
    pub dimensions: Option<(u32, u32)>,
    /// Present iff the payload is encrypted.
    pub protection: Option<ProtectionInfo>,
}

/// A fully-read media segment: header plus its payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub header: MediaSegmentHeader,
    pub payload: Vec<u8>,
}

//! The typed RPC surface between the client library and the session server.
//!
//! Every request, response and event body is a serde type encoded with
//! bincode; the surrounding frame carries the method or event id from
//! [`MethodId`] / [`EventId`]. The stubs on the client side and the
//! dispatcher on the server side are both generated by hand from this
//! module, which keeps the two in lockstep.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SessionServerState;
use crate::types::{
    AudioConfig, EaseType, MediaSourceStatus, MediaSourceType, MediaType, NetworkState,
    PlaybackState, QosInfo, SessionId, ShmInfo, SourceId, VideoGeometry,
};

/// Error raised when a message body cannot be encoded or decoded.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Failed to encode message body: {0}")]
    Encode(#[source] bincode::Error),
    #[error("Failed to decode message body: {0}")]
    Decode(#[source] bincode::Error),
    #[error("Unknown method id {0}")]
    UnknownMethod(u32),
    #[error("Unknown event id {0}")]
    UnknownEvent(u32),
}

/// Encodes a message body for transmission.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, SchemaError> {
    bincode::serialize(value).map_err(SchemaError::Encode)
}

/// Decodes a received message body.
pub fn decode_body<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SchemaError> {
    bincode::deserialize(bytes).map_err(SchemaError::Decode)
}

macro_rules! wire_id_enum {
    ($(#[$meta:meta])* $name:ident, $unknown:ident, $($variant:ident = $value:expr),+ $(,)?) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            /// Resolves a wire id back to its variant.
            pub fn from_u32(value: u32) -> Result<Self, SchemaError> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(SchemaError::$unknown(other)),
                }
            }
        }

        impl From<$name> for u32 {
            fn from(value: $name) -> u32 {
                value as u32
            }
        }
    };
}

wire_id_enum!(
    /// Request methods understood by the session server.
    MethodId,
    UnknownMethod,
    CreateSession = 1,
    DestroySession = 2,
    Load = 3,
    AttachSource = 4,
    RemoveSource = 5,
    AllSourcesAttached = 6,
    SwitchSource = 7,
    Play = 8,
    Pause = 9,
    Stop = 10,
    SetPosition = 11,
    GetPosition = 12,
    SetPlaybackRate = 13,
    SetVideoWindow = 14,
    SetImmediateOutput = 15,
    GetImmediateOutput = 16,
    SetLowLatency = 17,
    SetSync = 18,
    GetSync = 19,
    SetSyncOff = 20,
    SetStreamSyncMode = 21,
    GetStreamSyncMode = 22,
    Flush = 23,
    SetSourcePosition = 24,
    ProcessAudioGap = 25,
    SetVolume = 26,
    GetVolume = 27,
    SetMute = 28,
    GetMute = 29,
    SetTextTrackIdentifier = 30,
    GetTextTrackIdentifier = 31,
    SetBufferingLimit = 32,
    GetBufferingLimit = 33,
    SetUseBuffering = 34,
    GetUseBuffering = 35,
    GetStats = 36,
    IsVideoMaster = 37,
    HaveData = 38,
    Ping = 39,
    RenderFrame = 40,
    GetSupportedProperties = 45,
    CreateWebAudioPlayer = 50,
    DestroyWebAudioPlayer = 51,
    WebAudioPlay = 52,
    WebAudioPause = 53,
    WebAudioSetEos = 54,
    WebAudioGetBufferAvailable = 55,
    WebAudioWriteBuffer = 56,
    WebAudioGetDeviceInfo = 57,
    WebAudioSetVolume = 58,
    WebAudioGetVolume = 59,
);

wire_id_enum!(
    /// Server-to-client event messages.
    EventId,
    UnknownEvent,
    PlaybackStateChanged = 100,
    NetworkStateChanged = 101,
    Position = 102,
    NeedMediaData = 103,
    Qos = 104,
    PlaybackError = 105,
    SourceFlushed = 106,
    ApplicationStateChanged = 107,
);

/// Empty body for requests and responses that carry no payload beyond their
/// frame metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack;

/// Codec initialisation data supplied on attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecData {
    Bytes(Vec<u8>),
    Text(String),
}

/// Everything the server needs to build caps for a new source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub source_type: MediaSourceType,
    pub mime_type: String,
    pub audio_config: Option<AudioConfig>,
    pub codec_data: Option<CodecData>,
    pub is_drm: bool,
    /// Dolby Vision profile, when the stream carries one.
    pub dolby_vision_profile: Option<u32>,
    /// Identifier of the text track to render, subtitle sources only.
    pub text_track_identifier: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub max_width: u32,
    pub max_height: u32,
}

/// The response frame additionally carries the shared-memory fd; the body
/// only describes the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
    pub shm_len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestroySessionRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub session_id: SessionId,
    pub media_type: MediaType,
    pub mime_type: String,
    pub url: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Source management
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachSourceRequest {
    pub session_id: SessionId,
    pub source: SourceDescriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachSourceResponse {
    pub source_id: SourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveSourceRequest {
    pub session_id: SessionId,
    pub source_id: SourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllSourcesAttachedRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchSourceRequest {
    pub session_id: SessionId,
    pub source: SourceDescriptor,
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport control
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPositionRequest {
    pub session_id: SessionId,
    pub position_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPositionResponse {
    pub position_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetPlaybackRateRequest {
    pub session_id: SessionId,
    pub rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetVideoWindowRequest {
    pub session_id: SessionId,
    pub geometry: VideoGeometry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetImmediateOutputRequest {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub immediate_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRequest {
    pub session_id: SessionId,
    pub source_id: SourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoolResponse {
    pub value: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLowLatencyRequest {
    pub session_id: SessionId,
    pub low_latency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSyncRequest {
    pub session_id: SessionId,
    pub sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSyncOffRequest {
    pub session_id: SessionId,
    pub sync_off: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStreamSyncModeRequest {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub stream_sync_mode: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStreamSyncModeResponse {
    pub stream_sync_mode: i32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Flush and per-source positioning
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushRequest {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub reset_time: bool,
    #[serde(rename = "async")]
    pub async_flush: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetSourcePositionRequest {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub position_ns: i64,
    pub reset_time: bool,
    pub applied_rate: f64,
    pub stop_position_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessAudioGapRequest {
    pub session_id: SessionId,
    pub position_ns: i64,
    pub duration_ns: i64,
    pub discontinuity_gap_ns: i64,
    pub is_audio_aac: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Volume, mute, text tracks, buffering
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SetVolumeRequest {
    pub session_id: SessionId,
    pub target_volume: f64,
    pub duration_ms: u32,
    pub ease_type: EaseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GetVolumeResponse {
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetMuteRequest {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub mute: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetTextTrackIdentifierRequest {
    pub session_id: SessionId,
    pub text_track_identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTextTrackIdentifierResponse {
    pub text_track_identifier: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetBufferingLimitRequest {
    pub session_id: SessionId,
    pub limit_buffering_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBufferingLimitResponse {
    pub limit_buffering_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetUseBufferingRequest {
    pub session_id: SessionId,
    pub use_buffering: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatsResponse {
    pub rendered_frames: u64,
    pub dropped_frames: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Data exchange and keepalive
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaveDataRequest {
    pub session_id: SessionId,
    pub status: MediaSourceStatus,
    pub request_id: u32,
    pub num_frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub id: u32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability probing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSupportedPropertiesRequest {
    pub media_type: MediaSourceType,
    pub property_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSupportedPropertiesResponse {
    pub supported_properties: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Web audio
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWebAudioPlayerRequest {
    pub audio_mime_type: String,
    pub priority: u32,
    pub pcm_config: Option<AudioConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateWebAudioPlayerResponse {
    pub handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAudioHandleRequest {
    pub handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAudioGetBufferAvailableResponse {
    pub available_frames: u32,
    pub shm_info: ShmInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAudioWriteBufferRequest {
    pub handle: u32,
    pub number_of_frames: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebAudioGetDeviceInfoResponse {
    pub preferred_frames: u32,
    pub maximum_frames: u32,
    pub support_deferred_play: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WebAudioSetVolumeRequest {
    pub handle: u32,
    pub volume: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackStateChangedEvent {
    pub session_id: SessionId,
    pub state: PlaybackState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStateChangedEvent {
    pub session_id: SessionId,
    pub state: NetworkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionChangedEvent {
    pub session_id: SessionId,
    pub position_ns: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeedMediaDataEvent {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub request_id: u32,
    pub frame_count: u32,
    pub shm_info: ShmInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QosEvent {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub qos_info: QosInfo,
}

/// Classes of playback error surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackErrorKind {
    /// A decryptor failed to decrypt an encrypted buffer.
    Decryption,
    /// The pipeline reported a stream-level error.
    Stream,
    /// A source could not be configured with the requested capabilities.
    Capability,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackErrorEvent {
    pub session_id: SessionId,
    pub source_id: SourceId,
    pub error: PlaybackErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFlushedEvent {
    pub session_id: SessionId,
    pub source_id: SourceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationStateChangedEvent {
    pub state: SessionServerState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_ids_roundtrip_through_u32() {
        for method in [
            MethodId::CreateSession,
            MethodId::HaveData,
            MethodId::Ping,
            MethodId::WebAudioGetVolume,
        ] {
            let wire: u32 = method.into();
            assert_eq!(MethodId::from_u32(wire).unwrap(), method);
        }
    }

    #[test]
    fn unknown_method_id_is_rejected() {
        assert!(matches!(
            MethodId::from_u32(9999),
            Err(SchemaError::UnknownMethod(9999))
        ));
    }

    #[test]
    fn unknown_event_id_is_rejected() {
        assert!(matches!(
            EventId::from_u32(1),
            Err(SchemaError::UnknownEvent(1))
        ));
    }

    #[test]
    fn need_media_data_event_roundtrips() {
        let event = NeedMediaDataEvent {
            session_id: 1,
            source_id: 2,
            request_id: 17,
            frame_count: 24,
            shm_info: ShmInfo {
                offset: 4096,
                max_len: 1024 * 1024,
            },
        };
        let bytes = encode_body(&event).unwrap();
        let decoded: NeedMediaDataEvent = decode_body(&bytes).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn attach_source_request_roundtrips_with_codec_data() {
        let request = AttachSourceRequest {
            session_id: 4,
            source: SourceDescriptor {
                source_type: MediaSourceType::Video,
                mime_type: "video/h264".into(),
                audio_config: None,
                codec_data: Some(CodecData::Bytes(vec![0, 1, 2, 3])),
                is_drm: true,
                dolby_vision_profile: None,
                text_track_identifier: None,
            },
        };
        let bytes = encode_body(&request).unwrap();
        let decoded: AttachSourceRequest = decode_body(&bytes).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let bytes = encode_body(&PingRequest { id: 42 }).unwrap();
        let result: Result<PingRequest, _> = decode_body(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(SchemaError::Decode(_))));
    }
}

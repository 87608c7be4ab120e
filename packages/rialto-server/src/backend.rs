//! The named interface to the media pipeline collaborator.
//!
//! The session server never touches GStreamer directly: every pipeline
//! operation a playback task needs goes through [`PlayerBackend`], and
//! everything the pipeline reports back arrives through
//! [`BackendEventHandler`]. A backend is injected at session creation and
//! never replaced during the session's lifetime, which is what lets the
//! whole playback core run without a media stack underneath it.

use std::sync::Arc;

use thiserror::Error;

use rialto_core::schema::CodecData;
use rialto_core::types::{
    AudioConfig, EaseType, MediaSourceType, MediaType, SessionId, VideoGeometry,
};

use crate::protection::MediaBuffer;

/// Opaque identity of one upstream appsrc element inside the pipeline.
pub type AppSrcId = u64;

/// Pipeline states, ordered so that "has the pipeline reached its target"
/// is a plain comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
}

/// Flavour of the platform audio sink; decides how rate changes are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSinkKind {
    /// Amlogic HAL sink; rate changes go out as a segment event.
    Amlhalasink,
    /// Any other sink; rate changes use an instant-rate seek or a property.
    Standard,
}

/// Errors reported by the pipeline collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The pipeline does not exist (not loaded, or torn down).
    #[error("pipeline unavailable")]
    PipelineUnavailable,
    /// The requested capabilities cannot be satisfied.
    #[error("unsupported capabilities: {0}")]
    UnsupportedCaps(String),
    /// Any other pipeline failure.
    #[error("{0}")]
    Failed(String),
}

/// Who a bus message originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMessageSource {
    /// The session's own pipeline.
    Pipeline,
    /// An element identified as one of our appsrcs.
    Element(AppSrcId),
    /// Anything else; such messages are freed and ignored.
    Other,
}

/// Messages the pipeline posts on its bus, pre-digested by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Eos {
        source: BusMessageSource,
    },
    StateChanged {
        source: BusMessageSource,
        old: PipelineState,
        new: PipelineState,
        pending: PipelineState,
    },
    /// Qos from an element whose class metadata identified a source type;
    /// `None` when the class was not recognised.
    Qos {
        source_type: Option<MediaSourceType>,
        processed: u64,
        dropped: u64,
    },
    Error {
        source: BusMessageSource,
        message: String,
    },
    /// A sink ran out of buffered data for one source.
    Underflow {
        source_type: MediaSourceType,
    },
    /// Stream collections are acknowledged but carry nothing we act on.
    StreamCollection {
        source: BusMessageSource,
    },
}

/// Everything the pipeline reports back into the session.
///
/// Implementations enqueue a task on the session's main thread; callbacks
/// may arrive from arbitrary streaming threads.
pub trait BackendEventHandler: Send + Sync {
    /// A message was posted on the pipeline bus.
    fn on_bus_message(&self, message: BusMessage);

    /// An appsrc asked for more data.
    fn on_need_data(&self, appsrc: AppSrcId);
}

/// Caps for one source, assembled from the attach request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCaps {
    pub source_type: MediaSourceType,
    pub mime_type: String,
    pub audio_config: Option<AudioConfig>,
    pub codec_data: Option<CodecData>,
    pub is_drm: bool,
    pub dolby_vision_profile: Option<u32>,
}

/// The operations playback tasks perform against the pipeline.
///
/// One backend per session, owned by the session's main thread.
pub trait PlayerBackend: Send {
    /// Builds the pipeline for the given container type and url.
    fn load(&mut self, media_type: MediaType, mime_type: &str, url: &str)
        -> Result<(), BackendError>;

    /// Creates an appsrc with the given caps and links it in.
    fn attach_source(&mut self, caps: &SourceCaps) -> Result<AppSrcId, BackendError>;

    /// Updates an existing appsrc's caps in place while buffers flow.
    fn switch_source(&mut self, appsrc: AppSrcId, caps: &SourceCaps) -> Result<(), BackendError>;

    /// Unlinks and releases an appsrc.
    fn remove_source(&mut self, appsrc: AppSrcId);

    fn flush_start(&mut self, appsrc: AppSrcId);
    fn flush_stop(&mut self, appsrc: AppSrcId, reset_time: bool);

    /// Hands one buffer (and any attached protection metadata) to an appsrc.
    fn push_buffer(&mut self, appsrc: AppSrcId, buffer: MediaBuffer) -> Result<(), BackendError>;

    /// Signals end-of-stream on an appsrc.
    fn signal_eos(&mut self, appsrc: AppSrcId);

    /// Requests a pipeline state change; completion arrives on the bus.
    fn set_state(&mut self, state: PipelineState) -> Result<(), BackendError>;

    /// Session-wide seek at the given rate.
    fn seek(&mut self, position_ns: i64, rate: f64) -> Result<(), BackendError>;

    /// Per-source seek with segment parameters.
    fn seek_source(
        &mut self,
        appsrc: AppSrcId,
        position_ns: i64,
        reset_time: bool,
        applied_rate: f64,
        stop_position_ns: i64,
    ) -> Result<(), BackendError>;

    fn audio_sink_kind(&self) -> AudioSinkKind;

    /// Whether the runtime supports `FLAG_INSTANT_RATE_CHANGE` seeks.
    fn supports_instant_rate_change(&self) -> bool;

    /// Applies a rate via a segment event (amlhalasink path).
    fn send_segment_rate(&mut self, rate: f64) -> Result<(), BackendError>;

    /// Applies a rate via an instant-rate-change seek.
    fn seek_instant_rate(&mut self, rate: f64) -> Result<(), BackendError>;

    /// Applies a rate via a plain element property.
    fn set_rate_property(&mut self, rate: f64) -> Result<(), BackendError>;

    fn set_volume(&mut self, volume: f64);
    fn volume(&self) -> f64;

    /// Platform audio-fade helper.
    fn fade_volume(&mut self, target: f64, duration_ms: u32, ease: EaseType);

    fn set_mute(&mut self, mute: bool);
    fn mute(&self) -> bool;

    /// Inserts silence or a discontinuity marker preserving the timeline.
    fn process_audio_gap(
        &mut self,
        position_ns: i64,
        duration_ns: i64,
        discontinuity_gap_ns: i64,
        is_audio_aac: bool,
    );

    fn set_video_geometry(&mut self, geometry: VideoGeometry) -> Result<(), BackendError>;

    fn set_immediate_output(&mut self, appsrc: AppSrcId, enabled: bool)
        -> Result<(), BackendError>;
    fn immediate_output(&self, appsrc: AppSrcId) -> Result<bool, BackendError>;

    fn set_low_latency(&mut self, enabled: bool) -> Result<(), BackendError>;

    fn set_sync(&mut self, sync: bool) -> Result<(), BackendError>;
    fn sync(&self) -> Result<bool, BackendError>;
    fn set_sync_off(&mut self, sync_off: bool) -> Result<(), BackendError>;

    fn set_stream_sync_mode(&mut self, appsrc: AppSrcId, mode: i32) -> Result<(), BackendError>;
    fn stream_sync_mode(&self) -> Result<i32, BackendError>;

    fn set_buffering_limit(&mut self, limit_ms: u32);
    fn buffering_limit(&self) -> u32;
    fn set_use_buffering(&mut self, use_buffering: bool);
    fn use_buffering(&self) -> bool;

    /// Current playback position, when the pipeline can answer.
    fn position(&self) -> Option<i64>;

    /// `(rendered, dropped)` frame counters for one source's sink.
    fn stats(&self, appsrc: AppSrcId) -> Option<(u64, u64)>;

    fn is_video_master(&self) -> bool;

    /// Forces the prerolled frame out of the video sink.
    fn render_frame(&mut self) -> Result<(), BackendError>;

    fn set_text_track_identifier(&mut self, identifier: &str);
    fn text_track_identifier(&self) -> String;
}

/// Creates one backend per session, wired to the session's event handler.
pub trait PlayerBackendFactory: Send + Sync {
    fn create_backend(
        &self,
        session_id: SessionId,
        handler: Arc<dyn BackendEventHandler>,
    ) -> Result<Box<dyn PlayerBackend>, BackendError>;
}

//! Per-source playback state and the task factory around it.
//!
//! Everything here runs on the session's main thread: the service layer
//! wraps each operation in a task (see [`tasks`]) and enqueues it on the
//! session's executor, so no two mutations of a [`SessionContext`] ever run
//! concurrently. The pipeline collaborator is reached exclusively through
//! the injected [`PlayerBackend`](crate::backend::PlayerBackend).

pub mod flush_on_preroll;
pub mod flush_watcher;
pub mod need_data_mapping;
pub mod tasks;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use rialto_core::error::ServiceError;
use rialto_core::schema::PlaybackErrorKind;
use rialto_core::types::{
    MediaSegment, MediaSourceType, NetworkState, PlaybackState, PlaybackType, QosInfo, SessionId,
    ShmInfo, SourceId, VideoGeometry,
};

use crate::backend::{AppSrcId, AudioSinkKind, BackendError, PipelineState, PlayerBackend, SourceCaps};
use crate::protection::{MediaBuffer, ProtectionData};
use crate::shared_memory::SharedMemoryBuffer;

pub use flush_on_preroll::FlushOnPrerollController;
pub use flush_watcher::FlushWatcher;
pub use need_data_mapping::NeedDataMapping;

/// Frames requested from the client per need-data cycle.
pub const NEED_DATA_FRAME_COUNT: u32 = 24;

/// Errors produced by playback tasks.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("pipeline: {0}")]
    Backend(#[from] BackendError),
}

pub type PlayerResult<T> = Result<T, PlayerError>;

/// Where events leaving a session go; implemented over the client's
/// channel by the service layer.
pub trait EventSink: Send + Sync {
    fn playback_state(&self, state: PlaybackState);
    fn network_state(&self, state: NetworkState);
    fn position(&self, position_ns: i64);
    fn need_media_data(&self, source_id: SourceId, request_id: u32, frame_count: u32, shm: ShmInfo);
    fn qos(&self, source_id: SourceId, info: QosInfo);
    fn playback_error(&self, source_id: SourceId, kind: PlaybackErrorKind, message: &str);
    fn source_flushed(&self, source_id: SourceId);
}

/// Lifecycle of one attached source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Attached,
    Streaming,
    Flushing,
    Ended,
}

/// State for one attached source.
#[derive(Debug)]
pub struct SourceContext {
    pub source_id: SourceId,
    pub source_type: MediaSourceType,
    pub caps: SourceCaps,
    pub appsrc: AppSrcId,
    pub state: SourceState,
    pub need_data_pending: bool,
    pub underflow_occurred: bool,
    pub underflow_enabled: bool,
    pub removed: bool,
    pub initial_position_set: bool,
    pub eos_requested: bool,
    pub eos_notified: bool,
    pub buffered_segments: VecDeque<MediaSegment>,
}

impl SourceContext {
    fn new(source_id: SourceId, caps: SourceCaps, appsrc: AppSrcId) -> Self {
        Self {
            source_id,
            source_type: caps.source_type,
            caps,
            appsrc,
            state: SourceState::Attached,
            need_data_pending: false,
            underflow_occurred: false,
            underflow_enabled: true,
            removed: false,
            initial_position_set: false,
            eos_requested: false,
            eos_notified: false,
            buffered_segments: VecDeque::new(),
        }
    }
}

/// One outstanding need-data cycle.
#[derive(Debug, Clone, Copy)]
pub struct NeedDataRequest {
    pub source_type: MediaSourceType,
    pub source_id: SourceId,
    pub frame_count: u32,
    pub window: ShmInfo,
}

/// All mutable state of one playback session.
#[derive(Debug)]
pub struct SessionContext {
    pub session_id: SessionId,
    pub loaded: bool,
    pub pipeline_state: PipelineState,
    pub target_state: PipelineState,
    pub playback_state: PlaybackState,
    pub network_state: NetworkState,
    pub playback_rate: f64,
    pub pending_playback_rate: Option<f64>,
    pub pending_geometry: Option<VideoGeometry>,
    pub pending_immediate_output: Option<(SourceId, bool)>,
    pub pending_low_latency: Option<bool>,
    pub pending_sync: Option<bool>,
    pub pending_stream_sync_mode: Option<(SourceId, i32)>,
    pub pending_buffering_limit: Option<u32>,
    pub sources: HashMap<MediaSourceType, SourceContext>,
    pub eos_set: HashSet<MediaSourceType>,
    pub all_sources_attached: bool,
    pub pending_requests: HashMap<u32, NeedDataRequest>,
    pub unknown_request_drops: u64,
    next_source_id: SourceId,
    next_request_id: u32,
}

impl SessionContext {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            loaded: false,
            pipeline_state: PipelineState::Null,
            target_state: PipelineState::Null,
            playback_state: PlaybackState::Unknown,
            network_state: NetworkState::Unknown,
            playback_rate: 1.0,
            pending_playback_rate: None,
            pending_geometry: None,
            pending_immediate_output: None,
            pending_low_latency: None,
            pending_sync: None,
            pending_stream_sync_mode: None,
            pending_buffering_limit: None,
            sources: HashMap::new(),
            eos_set: HashSet::new(),
            all_sources_attached: false,
            pending_requests: HashMap::new(),
            unknown_request_drops: 0,
            next_source_id: 1,
            next_request_id: 1,
        }
    }

    /// Issues the next source id. Monotonic: a remove + re-attach always
    /// observes a fresh id.
    pub fn allocate_source_id(&mut self) -> SourceId {
        let id = self.next_source_id;
        self.next_source_id += 1;
        id
    }

    pub fn allocate_request_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// The live (non-removed) source with this id.
    pub fn source_by_id(&self, source_id: SourceId) -> Option<&SourceContext> {
        self.sources
            .values()
            .find(|source| source.source_id == source_id && !source.removed)
    }

    pub fn source_by_id_mut(&mut self, source_id: SourceId) -> Option<&mut SourceContext> {
        self.sources
            .values_mut()
            .find(|source| source.source_id == source_id && !source.removed)
    }

    pub fn source_by_appsrc(&self, appsrc: AppSrcId) -> Option<&SourceContext> {
        self.sources
            .values()
            .find(|source| source.appsrc == appsrc && !source.removed)
    }

    /// The appsrc of the live source with this id.
    pub fn appsrc_for(&self, source_id: SourceId) -> Option<AppSrcId> {
        self.source_by_id(source_id).map(|source| source.appsrc)
    }
}

/// One playback session: context, pipeline backend and the flush/need-data
/// helpers. Owned by the session's main thread.
pub struct PlayerSession {
    pub context: SessionContext,
    pub backend: Box<dyn PlayerBackend>,
    pub events: Arc<dyn EventSink>,
    pub shm: Arc<SharedMemoryBuffer>,
    pub flush_on_preroll: Arc<FlushOnPrerollController>,
    pub flush_watcher: FlushWatcher,
    pub need_data_mapping: NeedDataMapping,
}

impl PlayerSession {
    pub fn new(
        session_id: SessionId,
        backend: Box<dyn PlayerBackend>,
        events: Arc<dyn EventSink>,
        shm: Arc<SharedMemoryBuffer>,
    ) -> Self {
        Self {
            context: SessionContext::new(session_id),
            backend,
            events,
            shm,
            flush_on_preroll: Arc::new(FlushOnPrerollController::new()),
            flush_watcher: FlushWatcher::new(),
            need_data_mapping: NeedDataMapping::new(),
        }
    }

    pub(crate) fn notify_playback_state(&mut self, state: PlaybackState) {
        if self.context.playback_state != state {
            self.context.playback_state = state;
            self.events.playback_state(state);
        }
    }

    pub(crate) fn notify_network_state(&mut self, state: NetworkState) {
        if self.context.network_state != state {
            self.context.network_state = state;
            self.events.network_state(state);
        }
    }

    /// Applies a playback rate through the platform-appropriate mechanism.
    pub(crate) fn apply_rate(&mut self, rate: f64) -> PlayerResult<()> {
        match self.backend.audio_sink_kind() {
            AudioSinkKind::Amlhalasink => self.backend.send_segment_rate(rate)?,
            AudioSinkKind::Standard => {
                if self.backend.supports_instant_rate_change() {
                    self.backend.seek_instant_rate(rate)?;
                } else {
                    self.backend.set_rate_property(rate)?;
                }
            }
        }
        Ok(())
    }

    /// Pushes buffered segments for one source unless the flush barrier is
    /// holding injection back; signals EOS once the last segment went out.
    pub(crate) fn drain_buffered(&mut self, source_type: MediaSourceType) -> PlayerResult<()> {
        if self.flush_on_preroll.is_deferred(source_type) {
            debug!(source = source_type.as_str(), "injection deferred by flush barrier");
            return Ok(());
        }
        let Self {
            context, backend, ..
        } = self;
        let Some(source) = context.sources.get_mut(&source_type) else {
            return Ok(());
        };
        if source.removed {
            source.buffered_segments.clear();
            return Ok(());
        }

        while let Some(segment) = source.buffered_segments.pop_front() {
            let mut buffer = MediaBuffer::new(
                segment.payload,
                segment.header.time_ns,
                segment.header.duration_ns,
            );
            if let Some(protection) = segment.header.protection {
                if let Err(e) = buffer.attach_protection(ProtectionData::from(protection)) {
                    warn!(error = %e, "segment protection rejected");
                }
            }
            backend.push_buffer(source.appsrc, buffer)?;
            if source.state == SourceState::Attached {
                source.state = SourceState::Streaming;
            }
        }

        if source.eos_requested && !source.eos_notified && source.buffered_segments.is_empty() {
            backend.signal_eos(source.appsrc);
            source.eos_notified = true;
            source.state = SourceState::Ended;
        }
        Ok(())
    }

    /// Applies properties parked while the pipeline was still below its
    /// preroll state.
    pub(crate) fn apply_pending_properties(&mut self) {
        if let Some(geometry) = self.context.pending_geometry.take() {
            if let Err(e) = self.backend.set_video_geometry(geometry) {
                warn!(error = %e, "pending geometry rejected");
            }
        }
        if let Some((source_id, enabled)) = self.context.pending_immediate_output.take() {
            if let Some(appsrc) = self.context.appsrc_for(source_id) {
                if let Err(e) = self.backend.set_immediate_output(appsrc, enabled) {
                    warn!(error = %e, "pending immediate-output rejected");
                }
            }
        }
        if let Some(enabled) = self.context.pending_low_latency.take() {
            if let Err(e) = self.backend.set_low_latency(enabled) {
                warn!(error = %e, "pending low-latency rejected");
            }
        }
        if let Some(sync) = self.context.pending_sync.take() {
            if let Err(e) = self.backend.set_sync(sync) {
                warn!(error = %e, "pending sync rejected");
            }
        }
        if let Some((source_id, mode)) = self.context.pending_stream_sync_mode.take() {
            if let Some(appsrc) = self.context.appsrc_for(source_id) {
                if let Err(e) = self.backend.set_stream_sync_mode(appsrc, mode) {
                    warn!(error = %e, "pending stream-sync-mode rejected");
                }
            }
        }
        if let Some(limit) = self.context.pending_buffering_limit.take() {
            self.backend.set_buffering_limit(limit);
        }
    }

    /// Completes flushes whose pipeline has re-reached the target state:
    /// clears the watcher, restores the source state and notifies the
    /// client.
    pub(crate) fn complete_ready_flushes(&mut self) {
        if self.context.pipeline_state < self.context.target_state {
            return;
        }
        for (source_type, _) in self.flush_watcher.flushing_sources() {
            self.flush_watcher.set_flushed(source_type);
            let source_id = match self.context.sources.get_mut(&source_type) {
                Some(source) if !source.removed => {
                    source.state = SourceState::Streaming;
                    Some(source.source_id)
                }
                _ => None,
            };
            if let Some(source_id) = source_id {
                self.events.source_flushed(source_id);
            }
        }
    }

    fn live_appsrc(&self, source_id: SourceId) -> PlayerResult<AppSrcId> {
        self.context.appsrc_for(source_id).ok_or_else(|| {
            ServiceError::InvalidArgument(format!("no attached source {source_id}")).into()
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Property operations (invoked directly from service tasks)
    // ─────────────────────────────────────────────────────────────────────

    pub fn set_video_window(&mut self, geometry: VideoGeometry) -> PlayerResult<()> {
        if !self.context.loaded {
            return Err(ServiceError::NotInitialized.into());
        }
        if self.context.pipeline_state < PipelineState::Paused {
            self.context.pending_geometry = Some(geometry);
            Ok(())
        } else {
            self.backend.set_video_geometry(geometry).map_err(Into::into)
        }
    }

    pub fn set_immediate_output(&mut self, source_id: SourceId, enabled: bool) -> PlayerResult<()> {
        let appsrc = self.live_appsrc(source_id)?;
        if self.context.pipeline_state < PipelineState::Paused {
            self.context.pending_immediate_output = Some((source_id, enabled));
            Ok(())
        } else {
            self.backend
                .set_immediate_output(appsrc, enabled)
                .map_err(Into::into)
        }
    }

    pub fn immediate_output(&self, source_id: SourceId) -> PlayerResult<bool> {
        if let Some((pending_id, enabled)) = self.context.pending_immediate_output {
            if pending_id == source_id {
                return Ok(enabled);
            }
        }
        let appsrc = self.live_appsrc(source_id)?;
        self.backend.immediate_output(appsrc).map_err(Into::into)
    }

    pub fn set_low_latency(&mut self, enabled: bool) -> PlayerResult<()> {
        if self.context.pipeline_state < PipelineState::Paused {
            self.context.pending_low_latency = Some(enabled);
            Ok(())
        } else {
            self.backend.set_low_latency(enabled).map_err(Into::into)
        }
    }

    pub fn set_sync(&mut self, sync: bool) -> PlayerResult<()> {
        if self.context.pipeline_state < PipelineState::Paused {
            self.context.pending_sync = Some(sync);
            Ok(())
        } else {
            self.backend.set_sync(sync).map_err(Into::into)
        }
    }

    pub fn sync(&self) -> PlayerResult<bool> {
        if let Some(sync) = self.context.pending_sync {
            return Ok(sync);
        }
        self.backend.sync().map_err(Into::into)
    }

    pub fn set_sync_off(&mut self, sync_off: bool) -> PlayerResult<()> {
        self.backend.set_sync_off(sync_off).map_err(Into::into)
    }

    pub fn set_stream_sync_mode(&mut self, source_id: SourceId, mode: i32) -> PlayerResult<()> {
        let appsrc = self.live_appsrc(source_id)?;
        if self.context.pipeline_state < PipelineState::Paused {
            self.context.pending_stream_sync_mode = Some((source_id, mode));
            Ok(())
        } else {
            self.backend
                .set_stream_sync_mode(appsrc, mode)
                .map_err(Into::into)
        }
    }

    pub fn stream_sync_mode(&self) -> PlayerResult<i32> {
        if let Some((_, mode)) = self.context.pending_stream_sync_mode {
            return Ok(mode);
        }
        self.backend.stream_sync_mode().map_err(Into::into)
    }

    pub fn set_buffering_limit(&mut self, limit_ms: u32) {
        if self.context.pipeline_state < PipelineState::Paused {
            self.context.pending_buffering_limit = Some(limit_ms);
        } else {
            self.backend.set_buffering_limit(limit_ms);
        }
    }

    pub fn buffering_limit(&self) -> u32 {
        self.context
            .pending_buffering_limit
            .unwrap_or_else(|| self.backend.buffering_limit())
    }

    pub fn set_use_buffering(&mut self, use_buffering: bool) {
        self.backend.set_use_buffering(use_buffering);
    }

    pub fn use_buffering(&self) -> bool {
        self.backend.use_buffering()
    }

    pub fn position(&self) -> PlayerResult<i64> {
        if !self.context.loaded {
            return Err(ServiceError::NotInitialized.into());
        }
        self.backend
            .position()
            .ok_or_else(|| ServiceError::NotInitialized.into())
    }

    pub fn stats(&self, source_id: SourceId) -> PlayerResult<(u64, u64)> {
        let appsrc = self.live_appsrc(source_id)?;
        self.backend.stats(appsrc).ok_or_else(|| {
            ServiceError::InvalidArgument(format!("no stats for source {source_id}")).into()
        })
    }

    pub fn is_video_master(&self) -> bool {
        self.backend.is_video_master()
    }

    pub fn render_frame(&mut self) -> PlayerResult<()> {
        self.backend.render_frame().map_err(Into::into)
    }

    pub fn set_mute(&mut self, mute: bool) {
        self.backend.set_mute(mute);
    }

    pub fn mute(&self) -> bool {
        self.backend.mute()
    }

    pub fn volume(&self) -> f64 {
        self.backend.volume()
    }

    pub fn set_text_track_identifier(&mut self, identifier: &str) {
        self.backend.set_text_track_identifier(identifier);
    }

    pub fn text_track_identifier(&self) -> String {
        self.backend.text_track_identifier()
    }

    /// Clears the partition backing one source type.
    pub(crate) fn clear_partition(&self, source_type: MediaSourceType) {
        self.shm
            .clear_data(PlaybackType::Generic, self.context.session_id, source_type);
    }
}

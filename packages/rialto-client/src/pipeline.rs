//! The media pipeline stub: typed calls plus event demux.
//!
//! One `MediaPipelineClient` owns one session on the server. Calls block
//! on the channel's call controller; events arrive on the connection's
//! processing thread and are filtered by session id before reaching the
//! caller's [`MediaPipelineCallbacks`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use rialto_core::schema::{
    encode_body, Ack, AllSourcesAttachedRequest, AttachSourceRequest, AttachSourceResponse,
    BoolResponse, CreateSessionRequest, CreateSessionResponse, DestroySessionRequest, EventId,
    FlushRequest, GetBufferingLimitResponse, GetPositionResponse, GetStatsResponse,
    GetStreamSyncModeResponse, GetTextTrackIdentifierResponse, GetVolumeResponse, HaveDataRequest,
    LoadRequest, MethodId, NeedMediaDataEvent, NetworkStateChangedEvent, PlaybackErrorEvent,
    PlaybackErrorKind, PlaybackStateChangedEvent, PositionChangedEvent, ProcessAudioGapRequest,
    QosEvent, RemoveSourceRequest, SessionRequest, SetBufferingLimitRequest,
    SetImmediateOutputRequest, SetLowLatencyRequest, SetMuteRequest, SetPlaybackRateRequest,
    SetPositionRequest, SetSourcePositionRequest, SetStreamSyncModeRequest, SetSyncOffRequest,
    SetSyncRequest, SetTextTrackIdentifierRequest, SetUseBufferingRequest, SetVideoWindowRequest,
    SetVolumeRequest, SourceDescriptor, SourceFlushedEvent, SourceRequest, SwitchSourceRequest,
};
use rialto_core::types::{
    EaseType, MediaSegmentHeader, MediaSourceStatus, MediaType, NetworkState, PlaybackState,
    QosInfo, SessionId, ShmInfo, SourceId, VideoGeometry,
};
use rialto_ipc::{ChannelHandle, SubscriptionId};

use crate::error::{ClientError, ClientResult};
use crate::shm::ClientSharedMemory;

/// Callbacks invoked on the connection's processing thread.
///
/// Default implementations ignore the event, so callers only implement
/// what they observe.
pub trait MediaPipelineCallbacks: Send + Sync {
    fn on_playback_state(&self, state: PlaybackState) {
        let _ = state;
    }
    fn on_network_state(&self, state: NetworkState) {
        let _ = state;
    }
    fn on_position(&self, position_ns: i64) {
        let _ = position_ns;
    }
    fn on_need_media_data(
        &self,
        source_id: SourceId,
        request_id: u32,
        frame_count: u32,
        shm_info: ShmInfo,
    ) {
        let _ = (source_id, request_id, frame_count, shm_info);
    }
    fn on_qos(&self, source_id: SourceId, info: QosInfo) {
        let _ = (source_id, info);
    }
    fn on_playback_error(&self, source_id: SourceId, kind: PlaybackErrorKind, message: &str) {
        let _ = (source_id, kind, message);
    }
    fn on_source_flushed(&self, source_id: SourceId) {
        let _ = source_id;
    }
}

/// One playback session as seen from the application process.
pub struct MediaPipelineClient {
    channel: ChannelHandle,
    session_id: SessionId,
    shm: ClientSharedMemory,
    subscriptions: Vec<(u32, SubscriptionId)>,
}

fn decode_event<T: DeserializeOwned>(body: &[u8]) -> Option<T> {
    match rialto_core::schema::decode_body(body) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "malformed event body dropped");
            None
        }
    }
}

impl MediaPipelineClient {
    /// Creates a session on the server, maps the shared-memory fd passed
    /// back with the response and wires the event subscriptions.
    pub fn create(
        channel: ChannelHandle,
        callbacks: Arc<dyn MediaPipelineCallbacks>,
        max_width: u32,
        max_height: u32,
    ) -> ClientResult<Self> {
        let payload = encode_body(&CreateSessionRequest {
            max_width,
            max_height,
        })?;
        let (body, mut fds) =
            channel.call_blocking(MethodId::CreateSession.into(), payload, Vec::new())?;
        let response: CreateSessionResponse = rialto_core::schema::decode_body(&body)?;
        if fds.is_empty() {
            return Err(ClientError::Protocol(
                "create-session response carried no shared-memory fd".into(),
            ));
        }
        let shm = ClientSharedMemory::map(&fds.remove(0), response.shm_len)?;

        let mut client = Self {
            channel,
            session_id: response.session_id,
            shm,
            subscriptions: Vec::new(),
        };
        client.subscribe_events(callbacks);
        Ok(client)
    }

    fn subscribe_events(&mut self, callbacks: Arc<dyn MediaPipelineCallbacks>) {
        let session_id = self.session_id;

        let cb = Arc::clone(&callbacks);
        self.subscribe(EventId::PlaybackStateChanged, move |body| {
            if let Some(event) = decode_event::<PlaybackStateChangedEvent>(body) {
                if event.session_id == session_id {
                    cb.on_playback_state(event.state);
                }
            }
        });
        let cb = Arc::clone(&callbacks);
        self.subscribe(EventId::NetworkStateChanged, move |body| {
            if let Some(event) = decode_event::<NetworkStateChangedEvent>(body) {
                if event.session_id == session_id {
                    cb.on_network_state(event.state);
                }
            }
        });
        let cb = Arc::clone(&callbacks);
        self.subscribe(EventId::Position, move |body| {
            if let Some(event) = decode_event::<PositionChangedEvent>(body) {
                if event.session_id == session_id {
                    cb.on_position(event.position_ns);
                }
            }
        });
        let cb = Arc::clone(&callbacks);
        self.subscribe(EventId::NeedMediaData, move |body| {
            if let Some(event) = decode_event::<NeedMediaDataEvent>(body) {
                if event.session_id == session_id {
                    cb.on_need_media_data(
                        event.source_id,
                        event.request_id,
                        event.frame_count,
                        event.shm_info,
                    );
                }
            }
        });
        let cb = Arc::clone(&callbacks);
        self.subscribe(EventId::Qos, move |body| {
            if let Some(event) = decode_event::<QosEvent>(body) {
                if event.session_id == session_id {
                    cb.on_qos(event.source_id, event.qos_info);
                }
            }
        });
        let cb = Arc::clone(&callbacks);
        self.subscribe(EventId::PlaybackError, move |body| {
            if let Some(event) = decode_event::<PlaybackErrorEvent>(body) {
                if event.session_id == session_id {
                    cb.on_playback_error(event.source_id, event.error, &event.message);
                }
            }
        });
        let cb = callbacks;
        self.subscribe(EventId::SourceFlushed, move |body| {
            if let Some(event) = decode_event::<SourceFlushedEvent>(body) {
                if event.session_id == session_id {
                    cb.on_source_flushed(event.source_id);
                }
            }
        });
    }

    fn subscribe<F: Fn(&[u8]) + Send + Sync + 'static>(&mut self, event: EventId, handler: F) {
        let subscription = self
            .channel
            .subscribe(event.into(), move |body, _fds| handler(body));
        self.subscriptions.push((event.into(), subscription));
    }

    fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        method: MethodId,
        request: &Req,
    ) -> ClientResult<Resp> {
        let payload = encode_body(request)?;
        let (body, _fds) = self.channel.call_blocking(method.into(), payload, Vec::new())?;
        Ok(rialto_core::schema::decode_body(&body)?)
    }

    /// The server-assigned session id.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// The mapped shared-memory region.
    #[must_use]
    pub fn shared_memory(&self) -> &ClientSharedMemory {
        &self.shm
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playback surface
    // ─────────────────────────────────────────────────────────────────────

    pub fn load(&self, media_type: MediaType, mime_type: &str, url: &str) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::Load,
            &LoadRequest {
                session_id: self.session_id,
                media_type,
                mime_type: mime_type.to_string(),
                url: url.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn attach_source(&self, source: SourceDescriptor) -> ClientResult<SourceId> {
        let response: AttachSourceResponse = self.call(
            MethodId::AttachSource,
            &AttachSourceRequest {
                session_id: self.session_id,
                source,
            },
        )?;
        Ok(response.source_id)
    }

    pub fn remove_source(&self, source_id: SourceId) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::RemoveSource,
            &RemoveSourceRequest {
                session_id: self.session_id,
                source_id,
            },
        )?;
        Ok(())
    }

    pub fn all_sources_attached(&self) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::AllSourcesAttached,
            &AllSourcesAttachedRequest {
                session_id: self.session_id,
            },
        )?;
        Ok(())
    }

    pub fn switch_source(&self, source: SourceDescriptor) -> ClientResult<SourceId> {
        let response: AttachSourceResponse = self.call(
            MethodId::SwitchSource,
            &SwitchSourceRequest {
                session_id: self.session_id,
                source,
            },
        )?;
        Ok(response.source_id)
    }

    pub fn play(&self) -> ClientResult<()> {
        let _: Ack = self.call(MethodId::Play, &self.session_request())?;
        Ok(())
    }

    pub fn pause(&self) -> ClientResult<()> {
        let _: Ack = self.call(MethodId::Pause, &self.session_request())?;
        Ok(())
    }

    pub fn stop(&self) -> ClientResult<()> {
        let _: Ack = self.call(MethodId::Stop, &self.session_request())?;
        Ok(())
    }

    pub fn set_position(&self, position_ns: i64) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetPosition,
            &SetPositionRequest {
                session_id: self.session_id,
                position_ns,
            },
        )?;
        Ok(())
    }

    pub fn position(&self) -> ClientResult<i64> {
        let response: GetPositionResponse =
            self.call(MethodId::GetPosition, &self.session_request())?;
        Ok(response.position_ns)
    }

    pub fn set_playback_rate(&self, rate: f64) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetPlaybackRate,
            &SetPlaybackRateRequest {
                session_id: self.session_id,
                rate,
            },
        )?;
        Ok(())
    }

    pub fn set_video_window(&self, geometry: VideoGeometry) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetVideoWindow,
            &SetVideoWindowRequest {
                session_id: self.session_id,
                geometry,
            },
        )?;
        Ok(())
    }

    pub fn set_immediate_output(&self, source_id: SourceId, enabled: bool) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetImmediateOutput,
            &SetImmediateOutputRequest {
                session_id: self.session_id,
                source_id,
                immediate_output: enabled,
            },
        )?;
        Ok(())
    }

    pub fn immediate_output(&self, source_id: SourceId) -> ClientResult<bool> {
        let response: BoolResponse = self.call(
            MethodId::GetImmediateOutput,
            &SourceRequest {
                session_id: self.session_id,
                source_id,
            },
        )?;
        Ok(response.value)
    }

    pub fn set_low_latency(&self, low_latency: bool) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetLowLatency,
            &SetLowLatencyRequest {
                session_id: self.session_id,
                low_latency,
            },
        )?;
        Ok(())
    }

    pub fn set_sync(&self, sync: bool) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetSync,
            &SetSyncRequest {
                session_id: self.session_id,
                sync,
            },
        )?;
        Ok(())
    }

    pub fn sync(&self) -> ClientResult<bool> {
        let response: BoolResponse = self.call(MethodId::GetSync, &self.session_request())?;
        Ok(response.value)
    }

    pub fn set_sync_off(&self, sync_off: bool) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetSyncOff,
            &SetSyncOffRequest {
                session_id: self.session_id,
                sync_off,
            },
        )?;
        Ok(())
    }

    pub fn set_stream_sync_mode(&self, source_id: SourceId, mode: i32) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetStreamSyncMode,
            &SetStreamSyncModeRequest {
                session_id: self.session_id,
                source_id,
                stream_sync_mode: mode,
            },
        )?;
        Ok(())
    }

    pub fn stream_sync_mode(&self) -> ClientResult<i32> {
        let response: GetStreamSyncModeResponse =
            self.call(MethodId::GetStreamSyncMode, &self.session_request())?;
        Ok(response.stream_sync_mode)
    }

    pub fn flush(&self, source_id: SourceId, reset_time: bool, async_flush: bool) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::Flush,
            &FlushRequest {
                session_id: self.session_id,
                source_id,
                reset_time,
                async_flush,
            },
        )?;
        Ok(())
    }

    pub fn set_source_position(
        &self,
        source_id: SourceId,
        position_ns: i64,
        reset_time: bool,
        applied_rate: f64,
        stop_position_ns: i64,
    ) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetSourcePosition,
            &SetSourcePositionRequest {
                session_id: self.session_id,
                source_id,
                position_ns,
                reset_time,
                applied_rate,
                stop_position_ns,
            },
        )?;
        Ok(())
    }

    pub fn process_audio_gap(
        &self,
        position_ns: i64,
        duration_ns: i64,
        discontinuity_gap_ns: i64,
        is_audio_aac: bool,
    ) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::ProcessAudioGap,
            &ProcessAudioGapRequest {
                session_id: self.session_id,
                position_ns,
                duration_ns,
                discontinuity_gap_ns,
                is_audio_aac,
            },
        )?;
        Ok(())
    }

    pub fn set_volume(
        &self,
        target_volume: f64,
        duration_ms: u32,
        ease_type: EaseType,
    ) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetVolume,
            &SetVolumeRequest {
                session_id: self.session_id,
                target_volume,
                duration_ms,
                ease_type,
            },
        )?;
        Ok(())
    }

    pub fn volume(&self) -> ClientResult<f64> {
        let response: GetVolumeResponse = self.call(MethodId::GetVolume, &self.session_request())?;
        Ok(response.volume)
    }

    pub fn set_mute(&self, source_id: SourceId, mute: bool) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetMute,
            &SetMuteRequest {
                session_id: self.session_id,
                source_id,
                mute,
            },
        )?;
        Ok(())
    }

    pub fn mute(&self) -> ClientResult<bool> {
        let response: BoolResponse = self.call(MethodId::GetMute, &self.session_request())?;
        Ok(response.value)
    }

    pub fn set_text_track_identifier(&self, identifier: &str) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetTextTrackIdentifier,
            &SetTextTrackIdentifierRequest {
                session_id: self.session_id,
                text_track_identifier: identifier.to_string(),
            },
        )?;
        Ok(())
    }

    pub fn text_track_identifier(&self) -> ClientResult<String> {
        let response: GetTextTrackIdentifierResponse =
            self.call(MethodId::GetTextTrackIdentifier, &self.session_request())?;
        Ok(response.text_track_identifier)
    }

    pub fn set_buffering_limit(&self, limit_buffering_ms: u32) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetBufferingLimit,
            &SetBufferingLimitRequest {
                session_id: self.session_id,
                limit_buffering_ms,
            },
        )?;
        Ok(())
    }

    pub fn buffering_limit(&self) -> ClientResult<u32> {
        let response: GetBufferingLimitResponse =
            self.call(MethodId::GetBufferingLimit, &self.session_request())?;
        Ok(response.limit_buffering_ms)
    }

    pub fn set_use_buffering(&self, use_buffering: bool) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::SetUseBuffering,
            &SetUseBufferingRequest {
                session_id: self.session_id,
                use_buffering,
            },
        )?;
        Ok(())
    }

    pub fn use_buffering(&self) -> ClientResult<bool> {
        let response: BoolResponse =
            self.call(MethodId::GetUseBuffering, &self.session_request())?;
        Ok(response.value)
    }

    pub fn stats(&self, source_id: SourceId) -> ClientResult<(u64, u64)> {
        let response: GetStatsResponse = self.call(
            MethodId::GetStats,
            &SourceRequest {
                session_id: self.session_id,
                source_id,
            },
        )?;
        Ok((response.rendered_frames, response.dropped_frames))
    }

    pub fn is_video_master(&self) -> ClientResult<bool> {
        let response: BoolResponse =
            self.call(MethodId::IsVideoMaster, &self.session_request())?;
        Ok(response.value)
    }

    pub fn render_frame(&self) -> ClientResult<()> {
        let _: Ack = self.call(MethodId::RenderFrame, &self.session_request())?;
        Ok(())
    }

    /// Answers a NeedMediaData cycle after the frames were written with
    /// [`Self::write_segments`].
    pub fn have_data(
        &self,
        status: MediaSourceStatus,
        request_id: u32,
        num_frames: u32,
    ) -> ClientResult<()> {
        let _: Ack = self.call(
            MethodId::HaveData,
            &HaveDataRequest {
                session_id: self.session_id,
                status,
                request_id,
                num_frames,
            },
        )?;
        Ok(())
    }

    /// Writes segment records into the window a NeedMediaData event
    /// announced. Returns the number of frames written.
    pub fn write_segments(
        &self,
        shm_info: ShmInfo,
        segments: &[(MediaSegmentHeader, &[u8])],
    ) -> ClientResult<u32> {
        self.shm.write_segments(shm_info, segments)
    }

    /// Destroys the server-side session and drops the subscriptions.
    pub fn destroy(mut self) -> ClientResult<()> {
        self.unsubscribe_all();
        let _: Ack = self.call(
            MethodId::DestroySession,
            &DestroySessionRequest {
                session_id: self.session_id,
            },
        )?;
        Ok(())
    }

    fn session_request(&self) -> SessionRequest {
        SessionRequest {
            session_id: self.session_id,
        }
    }

    fn unsubscribe_all(&mut self) {
        for (event_id, subscription) in self.subscriptions.drain(..) {
            self.channel.unsubscribe(event_id, subscription);
        }
    }
}

impl Drop for MediaPipelineClient {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

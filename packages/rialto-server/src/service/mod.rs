//! The playback service: session registry plus the RPC dispatch layer.
//!
//! Requests arrive on the IPC server's processing thread, get decoded
//! against the schema and are enqueued as tasks on the owning session's
//! main thread; the responder completes the call from there. Events flow
//! the other way through a per-session [`EventSink`] bound to the client's
//! connection. The channel itself only ever holds session ids - live
//! sessions are resolved through the registry, which is what breaks the
//! ownership cycle between connections and sessions.

pub mod web_audio;

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use rialto_core::config::{MaxResourceCapabilities, SessionServerState};
use rialto_core::error::ServiceError;
use rialto_core::schema::{
    decode_body, encode_body, Ack, AllSourcesAttachedRequest, ApplicationStateChangedEvent,
    AttachSourceRequest, AttachSourceResponse, BoolResponse, CreateSessionRequest,
    CreateSessionResponse,
    CreateWebAudioPlayerRequest, DestroySessionRequest, EventId, FlushRequest,
    GetBufferingLimitResponse, GetPositionResponse, GetStatsResponse, GetStreamSyncModeResponse,
    GetSupportedPropertiesRequest, GetSupportedPropertiesResponse, GetTextTrackIdentifierResponse,
    GetVolumeResponse, HaveDataRequest, LoadRequest, MethodId, NeedMediaDataEvent,
    NetworkStateChangedEvent, PingRequest, PingResponse, PlaybackErrorEvent,
    PlaybackErrorKind, PlaybackStateChangedEvent, PositionChangedEvent, ProcessAudioGapRequest,
    QosEvent, RemoveSourceRequest, SessionRequest, SetBufferingLimitRequest,
    SetImmediateOutputRequest, SetLowLatencyRequest, SetMuteRequest, SetPlaybackRateRequest,
    SetPositionRequest, SetSourcePositionRequest, SetStreamSyncModeRequest, SetSyncOffRequest,
    SetSyncRequest, SetTextTrackIdentifierRequest, SetUseBufferingRequest, SetVideoWindowRequest,
    SetVolumeRequest, SourceFlushedEvent, SourceRequest, SwitchSourceRequest,
    WebAudioHandleRequest, WebAudioSetVolumeRequest, WebAudioWriteBufferRequest,
};
use rialto_core::types::{
    NetworkState, PlaybackState, PlaybackType, QosInfo, SessionId, ShmInfo, SourceId,
};
use rialto_ipc::{Client, Responder, RequestHandler, ServerShutdown};

use crate::backend::{AppSrcId, BackendEventHandler, BusMessage, PlayerBackendFactory};
use crate::capabilities::CapabilityProbe;
use crate::main_thread::{ClientId as TaskClientId, MainThread};
use crate::player::tasks::{
    AttachSource, Flush, HandleBusMessage, HaveData, NeedData, Pause, Play, ProcessAudioGap,
    RemoveSource, SetPlaybackRate, SetPosition, SetSourcePosition, SetVolume, Shutdown, Stop,
    SwitchSource,
};
use crate::player::{EventSink, PlayerError, PlayerResult, PlayerSession};
use crate::shared_memory::{SharedMemoryBuffer, SharedMemoryConfig};

use web_audio::WebAudioService;

/// How often playing sessions report their position to the client.
const POSITION_REPORT_INTERVAL: Duration = Duration::from_millis(250);

/// Sizing and capability limits for one session server.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaybackServiceConfig {
    pub capabilities: MaxResourceCapabilities,
    pub shared_memory: SharedMemoryConfig,
}

/// One live session: its executor, player state and owning client.
struct SessionHandle {
    session_id: SessionId,
    owner: rialto_ipc::ClientId,
    main_thread: Arc<MainThread>,
    task_client: TaskClientId,
    player: Arc<Mutex<PlayerSession>>,
}

impl SessionHandle {
    fn enqueue(&self, f: impl FnOnce(&mut PlayerSession) + Send + 'static) {
        let player = Arc::clone(&self.player);
        self.main_thread
            .enqueue(self.task_client, Box::new(move || f(&mut player.lock())));
    }

    fn enqueue_and_wait(&self, f: impl FnOnce(&mut PlayerSession) + Send + 'static) {
        let player = Arc::clone(&self.player);
        self.main_thread
            .enqueue_and_wait(self.task_client, Box::new(move || f(&mut player.lock())));
    }
}

/// Routes pipeline callbacks back onto the session's main thread.
///
/// Holds only a weak handle: a session mid-teardown drops callbacks on the
/// floor instead of resurrecting itself.
#[derive(Default)]
struct SessionBackendHandler {
    handle: OnceLock<Weak<SessionHandle>>,
}

impl SessionBackendHandler {
    fn bind(&self, handle: &Arc<SessionHandle>) {
        let _ = self.handle.set(Arc::downgrade(handle));
    }

    fn with_session(&self, f: impl FnOnce(&mut PlayerSession) + Send + 'static) {
        if let Some(handle) = self.handle.get().and_then(Weak::upgrade) {
            handle.enqueue(f);
        }
    }
}

impl BackendEventHandler for SessionBackendHandler {
    fn on_bus_message(&self, message: BusMessage) {
        self.with_session(move |player| {
            if let Err(e) = (HandleBusMessage { message }).execute(player) {
                warn!(error = %e, "bus message handling failed");
            }
        });
    }

    fn on_need_data(&self, appsrc: AppSrcId) {
        self.with_session(move |player| {
            if let Err(e) = (NeedData { appsrc }).execute(player) {
                warn!(error = %e, "need-data handling failed");
            }
        });
    }
}

/// Sends session events over the owning client's channel.
struct ClientEventSink {
    client: Client,
    session_id: SessionId,
}

impl ClientEventSink {
    fn emit<T: Serialize>(&self, event_id: EventId, event: &T) {
        match encode_body(event) {
            Ok(body) => {
                if let Err(e) = self.client.send_event(event_id.into(), body) {
                    debug!(session = self.session_id, error = %e, "event dropped");
                }
            }
            Err(e) => warn!(session = self.session_id, error = %e, "event encoding failed"),
        }
    }
}

impl EventSink for ClientEventSink {
    fn playback_state(&self, state: PlaybackState) {
        self.emit(
            EventId::PlaybackStateChanged,
            &PlaybackStateChangedEvent {
                session_id: self.session_id,
                state,
            },
        );
    }

    fn network_state(&self, state: NetworkState) {
        self.emit(
            EventId::NetworkStateChanged,
            &NetworkStateChangedEvent {
                session_id: self.session_id,
                state,
            },
        );
    }

    fn position(&self, position_ns: i64) {
        self.emit(
            EventId::Position,
            &PositionChangedEvent {
                session_id: self.session_id,
                position_ns,
            },
        );
    }

    fn need_media_data(&self, source_id: SourceId, request_id: u32, frame_count: u32, shm: ShmInfo) {
        self.emit(
            EventId::NeedMediaData,
            &NeedMediaDataEvent {
                session_id: self.session_id,
                source_id,
                request_id,
                frame_count,
                shm_info: shm,
            },
        );
    }

    fn qos(&self, source_id: SourceId, info: QosInfo) {
        self.emit(
            EventId::Qos,
            &QosEvent {
                session_id: self.session_id,
                source_id,
                qos_info: info,
            },
        );
    }

    fn playback_error(&self, source_id: SourceId, kind: PlaybackErrorKind, message: &str) {
        self.emit(
            EventId::PlaybackError,
            &PlaybackErrorEvent {
                session_id: self.session_id,
                source_id,
                error: kind,
                message: message.to_string(),
            },
        );
    }

    fn source_flushed(&self, source_id: SourceId) {
        self.emit(
            EventId::SourceFlushed,
            &SourceFlushedEvent {
                session_id: self.session_id,
                source_id,
            },
        );
    }
}

/// Invoked when a task reports a fatal invariant violation: the session
/// server transitions to error and stops.
#[derive(Default)]
struct FatalHook {
    shutdown: Mutex<Option<ServerShutdown>>,
}

impl FatalHook {
    fn trigger(&self, reason: &str) {
        error!(reason, "fatal error, stopping session server");
        if let Some(shutdown) = self.shutdown.lock().as_ref() {
            shutdown.shutdown();
        }
    }
}

/// The session server's service implementation.
pub struct PlaybackService {
    shm: Arc<SharedMemoryBuffer>,
    backend_factory: Arc<dyn PlayerBackendFactory>,
    probe: Arc<CapabilityProbe>,
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    clients: DashMap<rialto_ipc::ClientId, Client>,
    next_session_id: AtomicU32,
    max_playbacks: u32,
    web_audio: WebAudioService,
    application_state: Mutex<SessionServerState>,
    fatal: Arc<FatalHook>,
    position_reporting: Arc<AtomicBool>,
}

impl PlaybackService {
    pub fn new(
        config: PlaybackServiceConfig,
        backend_factory: Arc<dyn PlayerBackendFactory>,
        probe: Arc<CapabilityProbe>,
    ) -> Result<Arc<Self>, ServiceError> {
        let mut shm_config = config.shared_memory;
        shm_config.max_playbacks = config.capabilities.max_playbacks;
        shm_config.max_web_audio_players = config.capabilities.max_web_audio_players;
        let shm = Arc::new(SharedMemoryBuffer::new(shm_config)?);

        let service = Arc::new(Self {
            web_audio: WebAudioService::new(
                Arc::clone(&shm),
                config.capabilities.max_web_audio_players,
            ),
            shm,
            backend_factory,
            probe,
            sessions: DashMap::new(),
            clients: DashMap::new(),
            next_session_id: AtomicU32::new(1),
            max_playbacks: config.capabilities.max_playbacks,
            application_state: Mutex::new(SessionServerState::Uninitialized),
            fatal: Arc::new(FatalHook::default()),
            position_reporting: Arc::new(AtomicBool::new(true)),
        });
        Self::spawn_position_reporter(&service);
        Ok(service)
    }

    /// Periodic position reports for playing sessions, enqueued as tasks so
    /// they serialise with everything else.
    fn spawn_position_reporter(service: &Arc<Self>) {
        let running = Arc::clone(&service.position_reporting);
        let service = Arc::downgrade(service);
        let _ = std::thread::Builder::new()
            .name("rialto-position".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    std::thread::sleep(POSITION_REPORT_INTERVAL);
                    let Some(service) = service.upgrade() else {
                        break;
                    };
                    for entry in service.sessions.iter() {
                        let handle = Arc::clone(entry.value());
                        handle.enqueue(|player| {
                            if player.context.playback_state == PlaybackState::Playing {
                                if let Ok(position_ns) = player.position() {
                                    player.events.position(position_ns);
                                }
                            }
                        });
                    }
                }
            });
    }

    /// Lets fatal errors stop the hosting IPC server.
    pub fn set_shutdown_handle(&self, shutdown: ServerShutdown) {
        *self.fatal.shutdown.lock() = Some(shutdown);
    }

    /// Hook for the IPC server's client-connected callback.
    pub fn client_connected(&self, client: &Client) {
        self.clients.insert(client.id(), client.clone());
        let creds = client.credentials();
        debug!(
            client = client.id(),
            pid = creds.pid,
            uid = creds.uid,
            "client registered with playback service"
        );
    }

    /// Hook for the IPC server's client-disconnected callback; reaps every
    /// session and web-audio player the client owned.
    pub fn client_disconnected(&self, client: &Client) {
        self.clients.remove(&client.id());
        let owned: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().owner == client.id())
            .map(|entry| *entry.key())
            .collect();
        for session_id in owned {
            self.destroy_session(session_id);
        }
        self.web_audio.destroy_for_client(client.id());
    }

    /// Broadcasts a session-server state transition to every client.
    pub fn set_application_state(&self, state: SessionServerState) {
        *self.application_state.lock() = state;
        let event = ApplicationStateChangedEvent { state };
        let Ok(body) = encode_body(&event) else {
            return;
        };
        for client in self.clients.iter() {
            let _ = client
                .value()
                .send_event(EventId::ApplicationStateChanged.into(), body.clone());
        }
    }

    pub fn application_state(&self) -> SessionServerState {
        *self.application_state.lock()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn create_session(
        &self,
        client: &Client,
        request: CreateSessionRequest,
    ) -> Result<(CreateSessionResponse, OwnedFd), String> {
        if self.sessions.len() >= self.max_playbacks as usize {
            return Err(format!(
                "max playbacks ({}) exceeded",
                self.max_playbacks
            ));
        }
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.shm
            .map_partition(PlaybackType::Generic, session_id)
            .map_err(|e| e.to_string())?;

        let handler = Arc::new(SessionBackendHandler::default());
        let backend = match self.backend_factory.create_backend(
            session_id,
            Arc::clone(&handler) as Arc<dyn BackendEventHandler>,
        ) {
            Ok(backend) => backend,
            Err(e) => {
                self.shm.unmap_partition(PlaybackType::Generic, session_id);
                return Err(format!("backend creation failed: {e}"));
            }
        };

        let events = Arc::new(ClientEventSink {
            client: client.clone(),
            session_id,
        });
        let player = PlayerSession::new(session_id, backend, events, Arc::clone(&self.shm));

        let main_thread = MainThread::new();
        let task_client = main_thread.register_client();
        let handle = Arc::new(SessionHandle {
            session_id,
            owner: client.id(),
            main_thread,
            task_client,
            player: Arc::new(Mutex::new(player)),
        });
        handler.bind(&handle);
        self.sessions.insert(session_id, handle);

        debug!(
            session = session_id,
            max_width = request.max_width,
            max_height = request.max_height,
            "session created"
        );
        let fd = self.shm.dup_fd().map_err(|e| e.to_string())?;
        Ok((
            CreateSessionResponse {
                session_id,
                shm_len: self.shm.len(),
            },
            fd,
        ))
    }

    fn destroy_session(&self, session_id: SessionId) -> bool {
        let Some((_, handle)) = self.sessions.remove(&session_id) else {
            return false;
        };
        handle.enqueue_and_wait(|player| {
            if let Err(e) = Shutdown.execute(player) {
                warn!(error = %e, "session shutdown task failed");
            }
        });
        // Unregistering neutralises anything still queued against the
        // session before the executor is joined.
        handle.main_thread.unregister_client(handle.task_client);
        self.shm.unmap_partition(PlaybackType::Generic, session_id);
        debug!(session = session_id, "session destroyed");
        true
    }

    /// Enqueues `f` on the session's main thread and completes the call
    /// with its (encoded) result.
    fn reply_task<T, F>(&self, session_id: SessionId, responder: Responder, f: F)
    where
        T: Serialize + Send + 'static,
        F: FnOnce(&mut PlayerSession) -> PlayerResult<T> + Send + 'static,
    {
        let Some(handle) = self.sessions.get(&session_id).map(|entry| Arc::clone(&entry)) else {
            responder.fail(format!("no session {session_id}"));
            return;
        };
        let fatal = Arc::clone(&self.fatal);
        handle.enqueue(move |player| match f(player) {
            Ok(value) => match encode_body(&value) {
                Ok(body) => responder.ok(body),
                Err(e) => responder.fail(format!("response encoding failed: {e}")),
            },
            Err(e) => {
                if let PlayerError::Service(service_error) = &e {
                    if service_error.is_fatal() {
                        fatal.trigger(&service_error.to_string());
                    }
                }
                responder.fail(e.to_string());
            }
        });
    }

    fn ping(&self, request: PingRequest, responder: Responder) {
        // The ack goes out only after every session's queue drained the
        // ping task.
        let handles: Vec<Arc<SessionHandle>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if handles.is_empty() {
            match encode_body(&PingResponse { id: request.id }) {
                Ok(body) => responder.ok(body),
                Err(e) => responder.fail(e.to_string()),
            }
            return;
        }

        struct PingGate {
            remaining: AtomicU32,
            responder: Mutex<Option<Responder>>,
            id: u32,
        }
        let gate = Arc::new(PingGate {
            remaining: AtomicU32::new(handles.len() as u32),
            responder: Mutex::new(Some(responder)),
            id: request.id,
        });
        for handle in handles {
            let gate = Arc::clone(&gate);
            handle.enqueue(move |_player| {
                if gate.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(responder) = gate.responder.lock().take() {
                        match encode_body(&PingResponse { id: gate.id }) {
                            Ok(body) => responder.ok(body),
                            Err(e) => responder.fail(e.to_string()),
                        }
                    }
                }
            });
        }
    }
}

impl Drop for PlaybackService {
    fn drop(&mut self) {
        self.position_reporting.store(false, Ordering::Release);
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, String> {
    decode_body(payload).map_err(|e| format!("malformed request: {e}"))
}

/// Decodes the request for a session-scoped operation and enqueues the
/// task; the shared shape of almost every arm below.
macro_rules! session_op {
    ($service:ident, $payload:ident, $responder:ident, $ty:ty, |$request:ident, $player:ident| $body:expr) => {
        match parse::<$ty>(&$payload) {
            Ok($request) => {
                let session_id = $request.session_id;
                $service.reply_task(session_id, $responder, move |$player| $body)
            }
            Err(reason) => $responder.fail(reason),
        }
    };
}

impl RequestHandler for PlaybackService {
    fn handle_request(
        &self,
        client: &Client,
        method_id: u32,
        payload: Vec<u8>,
        _fds: Vec<OwnedFd>,
        responder: Responder,
    ) {
        let method = match MethodId::from_u32(method_id) {
            Ok(method) => method,
            Err(e) => {
                responder.fail(e.to_string());
                return;
            }
        };

        match method {
            // ── Session lifecycle ────────────────────────────────────────
            MethodId::CreateSession => match parse::<CreateSessionRequest>(&payload) {
                Ok(request) => match self.create_session(client, request) {
                    Ok((response, fd)) => match encode_body(&response) {
                        Ok(body) => responder.reply_with_fds(Ok(body), vec![fd]),
                        Err(e) => responder.fail(e.to_string()),
                    },
                    Err(reason) => responder.fail(reason),
                },
                Err(reason) => responder.fail(reason),
            },
            MethodId::DestroySession => match parse::<DestroySessionRequest>(&payload) {
                Ok(request) => {
                    if self.destroy_session(request.session_id) {
                        match encode_body(&Ack) {
                            Ok(body) => responder.ok(body),
                            Err(e) => responder.fail(e.to_string()),
                        }
                    } else {
                        responder.fail(format!("no session {}", request.session_id));
                    }
                }
                Err(reason) => responder.fail(reason),
            },
            MethodId::Load => session_op!(self, payload, responder, LoadRequest, |request, player| {
                player
                    .backend
                    .load(request.media_type, &request.mime_type, &request.url)
                    .map_err(PlayerError::from)?;
                player.context.loaded = true;
                Ok(Ack)
            }),

            // ── Sources ──────────────────────────────────────────────────
            MethodId::AttachSource => {
                session_op!(self, payload, responder, AttachSourceRequest, |request, player| {
                    let source_id = AttachSource {
                        descriptor: request.source,
                    }
                    .execute(player)?;
                    Ok(AttachSourceResponse { source_id })
                })
            }
            MethodId::RemoveSource => {
                session_op!(self, payload, responder, RemoveSourceRequest, |request, player| {
                    RemoveSource {
                        source_id: request.source_id,
                    }
                    .execute(player)?;
                    Ok(Ack)
                })
            }
            MethodId::AllSourcesAttached => {
                session_op!(self, payload, responder, AllSourcesAttachedRequest, |request, player| {
                    let _ = request;
                    player.context.all_sources_attached = true;
                    player.notify_network_state(NetworkState::Buffering);
                    Ok(Ack)
                })
            }
            MethodId::SwitchSource => {
                session_op!(self, payload, responder, SwitchSourceRequest, |request, player| {
                    let source_id = SwitchSource {
                        descriptor: request.source,
                    }
                    .execute(player)?;
                    Ok(AttachSourceResponse { source_id })
                })
            }

            // ── Transport control ────────────────────────────────────────
            MethodId::Play => session_op!(self, payload, responder, SessionRequest, |request, player| {
                let _ = request;
                Play.execute(player)?;
                Ok(Ack)
            }),
            MethodId::Pause => session_op!(self, payload, responder, SessionRequest, |request, player| {
                let _ = request;
                Pause.execute(player)?;
                Ok(Ack)
            }),
            MethodId::Stop => session_op!(self, payload, responder, SessionRequest, |request, player| {
                let _ = request;
                Stop.execute(player)?;
                Ok(Ack)
            }),
            MethodId::SetPosition => {
                session_op!(self, payload, responder, SetPositionRequest, |request, player| {
                    SetPosition {
                        position_ns: request.position_ns,
                    }
                    .execute(player)?;
                    Ok(Ack)
                })
            }
            MethodId::GetPosition => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    let position_ns = player.position()?;
                    Ok(GetPositionResponse { position_ns })
                })
            }
            MethodId::SetPlaybackRate => {
                session_op!(self, payload, responder, SetPlaybackRateRequest, |request, player| {
                    SetPlaybackRate { rate: request.rate }.execute(player)?;
                    Ok(Ack)
                })
            }
            MethodId::SetVideoWindow => {
                session_op!(self, payload, responder, SetVideoWindowRequest, |request, player| {
                    player.set_video_window(request.geometry)?;
                    Ok(Ack)
                })
            }

            // ── Sink properties ──────────────────────────────────────────
            MethodId::SetImmediateOutput => {
                session_op!(self, payload, responder, SetImmediateOutputRequest, |request, player| {
                    player.set_immediate_output(request.source_id, request.immediate_output)?;
                    Ok(Ack)
                })
            }
            MethodId::GetImmediateOutput => {
                session_op!(self, payload, responder, SourceRequest, |request, player| {
                    let value = player.immediate_output(request.source_id)?;
                    Ok(BoolResponse { value })
                })
            }
            MethodId::SetLowLatency => {
                session_op!(self, payload, responder, SetLowLatencyRequest, |request, player| {
                    player.set_low_latency(request.low_latency)?;
                    Ok(Ack)
                })
            }
            MethodId::SetSync => {
                session_op!(self, payload, responder, SetSyncRequest, |request, player| {
                    player.set_sync(request.sync)?;
                    Ok(Ack)
                })
            }
            MethodId::GetSync => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    let value = player.sync()?;
                    Ok(BoolResponse { value })
                })
            }
            MethodId::SetSyncOff => {
                session_op!(self, payload, responder, SetSyncOffRequest, |request, player| {
                    player.set_sync_off(request.sync_off)?;
                    Ok(Ack)
                })
            }
            MethodId::SetStreamSyncMode => {
                session_op!(self, payload, responder, SetStreamSyncModeRequest, |request, player| {
                    player.set_stream_sync_mode(request.source_id, request.stream_sync_mode)?;
                    Ok(Ack)
                })
            }
            MethodId::GetStreamSyncMode => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    let stream_sync_mode = player.stream_sync_mode()?;
                    Ok(GetStreamSyncModeResponse { stream_sync_mode })
                })
            }

            // ── Flush / positioning / gaps ───────────────────────────────
            MethodId::Flush => session_op!(self, payload, responder, FlushRequest, |request, player| {
                Flush {
                    source_id: request.source_id,
                    reset_time: request.reset_time,
                    async_flush: request.async_flush,
                }
                .execute(player)?;
                Ok(Ack)
            }),
            MethodId::SetSourcePosition => {
                session_op!(self, payload, responder, SetSourcePositionRequest, |request, player| {
                    SetSourcePosition {
                        source_id: request.source_id,
                        position_ns: request.position_ns,
                        reset_time: request.reset_time,
                        applied_rate: request.applied_rate,
                        stop_position_ns: request.stop_position_ns,
                    }
                    .execute(player)?;
                    Ok(Ack)
                })
            }
            MethodId::ProcessAudioGap => {
                session_op!(self, payload, responder, ProcessAudioGapRequest, |request, player| {
                    ProcessAudioGap {
                        position_ns: request.position_ns,
                        duration_ns: request.duration_ns,
                        discontinuity_gap_ns: request.discontinuity_gap_ns,
                        is_audio_aac: request.is_audio_aac,
                    }
                    .execute(player)?;
                    Ok(Ack)
                })
            }

            // ── Volume / mute / text tracks / buffering ──────────────────
            MethodId::SetVolume => {
                session_op!(self, payload, responder, SetVolumeRequest, |request, player| {
                    SetVolume {
                        target_volume: request.target_volume,
                        duration_ms: request.duration_ms,
                        ease_type: request.ease_type,
                    }
                    .execute(player)?;
                    Ok(Ack)
                })
            }
            MethodId::GetVolume => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    Ok(GetVolumeResponse {
                        volume: player.volume(),
                    })
                })
            }
            MethodId::SetMute => {
                session_op!(self, payload, responder, SetMuteRequest, |request, player| {
                    let _ = request.source_id;
                    player.set_mute(request.mute);
                    Ok(Ack)
                })
            }
            MethodId::GetMute => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    Ok(BoolResponse {
                        value: player.mute(),
                    })
                })
            }
            MethodId::SetTextTrackIdentifier => {
                session_op!(self, payload, responder, SetTextTrackIdentifierRequest, |request, player| {
                    player.set_text_track_identifier(&request.text_track_identifier);
                    Ok(Ack)
                })
            }
            MethodId::GetTextTrackIdentifier => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    Ok(GetTextTrackIdentifierResponse {
                        text_track_identifier: player.text_track_identifier(),
                    })
                })
            }
            MethodId::SetBufferingLimit => {
                session_op!(self, payload, responder, SetBufferingLimitRequest, |request, player| {
                    player.set_buffering_limit(request.limit_buffering_ms);
                    Ok(Ack)
                })
            }
            MethodId::GetBufferingLimit => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    Ok(GetBufferingLimitResponse {
                        limit_buffering_ms: player.buffering_limit(),
                    })
                })
            }
            MethodId::SetUseBuffering => {
                session_op!(self, payload, responder, SetUseBufferingRequest, |request, player| {
                    player.set_use_buffering(request.use_buffering);
                    Ok(Ack)
                })
            }
            MethodId::GetUseBuffering => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    Ok(BoolResponse {
                        value: player.use_buffering(),
                    })
                })
            }
            MethodId::GetStats => {
                session_op!(self, payload, responder, SourceRequest, |request, player| {
                    let (rendered_frames, dropped_frames) = player.stats(request.source_id)?;
                    Ok(GetStatsResponse {
                        rendered_frames,
                        dropped_frames,
                    })
                })
            }
            MethodId::IsVideoMaster => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    Ok(BoolResponse {
                        value: player.is_video_master(),
                    })
                })
            }
            MethodId::RenderFrame => {
                session_op!(self, payload, responder, SessionRequest, |request, player| {
                    let _ = request;
                    player.render_frame()?;
                    Ok(Ack)
                })
            }

            // ── Data exchange and keepalive ──────────────────────────────
            MethodId::HaveData => {
                session_op!(self, payload, responder, HaveDataRequest, |request, player| {
                    HaveData {
                        status: request.status,
                        request_id: request.request_id,
                        num_frames: request.num_frames,
                    }
                    .execute(player)?;
                    Ok(Ack)
                })
            }
            MethodId::Ping => match parse::<PingRequest>(&payload) {
                Ok(request) => self.ping(request, responder),
                Err(reason) => responder.fail(reason),
            },

            // ── Capabilities ─────────────────────────────────────────────
            MethodId::GetSupportedProperties => {
                match parse::<GetSupportedPropertiesRequest>(&payload) {
                    Ok(request) => {
                        let supported_properties = self
                            .probe
                            .supported_properties(request.media_type, &request.property_names);
                        match encode_body(&GetSupportedPropertiesResponse {
                            supported_properties,
                        }) {
                            Ok(body) => responder.ok(body),
                            Err(e) => responder.fail(e.to_string()),
                        }
                    }
                    Err(reason) => responder.fail(reason),
                }
            }

            // ── Web audio ────────────────────────────────────────────────
            MethodId::CreateWebAudioPlayer => {
                match parse::<CreateWebAudioPlayerRequest>(&payload) {
                    Ok(request) => {
                        respond(responder, self.web_audio.create(client.id(), request));
                    }
                    Err(reason) => responder.fail(reason),
                }
            }
            MethodId::DestroyWebAudioPlayer => match parse::<WebAudioHandleRequest>(&payload) {
                Ok(request) => respond(
                    responder,
                    self.web_audio
                        .destroy(client.id(), request.handle)
                        .map(|()| Ack),
                ),
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioPlay => match parse::<WebAudioHandleRequest>(&payload) {
                Ok(request) => {
                    respond(responder, self.web_audio.play(request.handle).map(|()| Ack));
                }
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioPause => match parse::<WebAudioHandleRequest>(&payload) {
                Ok(request) => {
                    respond(responder, self.web_audio.pause(request.handle).map(|()| Ack));
                }
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioSetEos => match parse::<WebAudioHandleRequest>(&payload) {
                Ok(request) => {
                    respond(responder, self.web_audio.set_eos(request.handle).map(|()| Ack));
                }
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioGetBufferAvailable => match parse::<WebAudioHandleRequest>(&payload) {
                Ok(request) => respond(responder, self.web_audio.buffer_available(request.handle)),
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioWriteBuffer => match parse::<WebAudioWriteBufferRequest>(&payload) {
                Ok(request) => respond(
                    responder,
                    self.web_audio
                        .write_buffer(request.handle, request.number_of_frames)
                        .map(|()| Ack),
                ),
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioGetDeviceInfo => match parse::<WebAudioHandleRequest>(&payload) {
                Ok(request) => respond(responder, self.web_audio.device_info(request.handle)),
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioSetVolume => match parse::<WebAudioSetVolumeRequest>(&payload) {
                Ok(request) => respond(
                    responder,
                    self.web_audio
                        .set_volume(request.handle, request.volume)
                        .map(|()| Ack),
                ),
                Err(reason) => responder.fail(reason),
            },
            MethodId::WebAudioGetVolume => match parse::<WebAudioHandleRequest>(&payload) {
                Ok(request) => respond(
                    responder,
                    self.web_audio
                        .volume(request.handle)
                        .map(|volume| GetVolumeResponse { volume }),
                ),
                Err(reason) => responder.fail(reason),
            },
        }
    }
}

/// Completes a call handled inline on the processing thread.
fn respond<T: Serialize>(responder: Responder, result: Result<T, ServiceError>) {
    match result {
        Ok(value) => match encode_body(&value) {
            Ok(body) => responder.ok(body),
            Err(e) => responder.fail(e.to_string()),
        },
        Err(e) => responder.fail(e.to_string()),
    }
}

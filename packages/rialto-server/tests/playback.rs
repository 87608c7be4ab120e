//! End-to-end playback scenarios: the real client library talking to the
//! real service over a socketpair, with a scripted pipeline backend
//! standing in for the media stack.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rialto_client::{ClientConnection, ControlClient, MediaPipelineCallbacks, MediaPipelineClient};
use rialto_core::schema::SourceDescriptor;
use rialto_core::types::{
    AudioConfig, EaseType, MediaSegmentHeader, MediaSourceStatus, MediaSourceType, MediaType,
    NetworkState, PlaybackState, ShmInfo, SourceId, VideoGeometry,
};
use rialto_ipc::{SeqPacketSocket, Server};
use rialto_server::{
    AppSrcId, AudioSinkKind, BackendError, BackendEventHandler, BusMessage, BusMessageSource,
    CapabilityProbe, FactoryClass, FactoryHandle, FactoryRegistry, MediaBuffer, PipelineState,
    PlaybackService, PlaybackServiceConfig, PlayerBackend, PlayerBackendFactory, SourceCaps,
};

// ─────────────────────────────────────────────────────────────────────────────
// Scripted pipeline backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum PipelineOp {
    Push(AppSrcId, usize),
    SignalEos(AppSrcId),
    Seek(i64, f64),
    RateProperty(f64),
    SetVolume(f64),
}

#[derive(Default)]
struct PipelineRecord {
    ops: Mutex<Vec<PipelineOp>>,
    appsrcs: Mutex<Vec<AppSrcId>>,
    handler: Mutex<Option<Arc<dyn BackendEventHandler>>>,
}

impl PipelineRecord {
    /// Simulates the upstream elements asking every attached appsrc for
    /// data.
    fn request_data(&self) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            for appsrc in self.appsrcs.lock().iter() {
                handler.on_need_data(*appsrc);
            }
        }
    }

    fn ops(&self) -> Vec<PipelineOp> {
        self.ops.lock().clone()
    }
}

struct TestBackend {
    record: Arc<PipelineRecord>,
    handler: Arc<dyn BackendEventHandler>,
    next_appsrc: AppSrcId,
    state: PipelineState,
}

impl TestBackend {
    fn post_state_change(&self, old: PipelineState, new: PipelineState) {
        self.handler.on_bus_message(BusMessage::StateChanged {
            source: BusMessageSource::Pipeline,
            old,
            new,
            pending: PipelineState::Null,
        });
    }
}

impl PlayerBackend for TestBackend {
    fn load(
        &mut self,
        _media_type: MediaType,
        _mime_type: &str,
        _url: &str,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn attach_source(&mut self, _caps: &SourceCaps) -> Result<AppSrcId, BackendError> {
        self.next_appsrc += 1;
        self.record.appsrcs.lock().push(self.next_appsrc);
        Ok(self.next_appsrc)
    }

    fn switch_source(&mut self, _appsrc: AppSrcId, _caps: &SourceCaps) -> Result<(), BackendError> {
        Ok(())
    }

    fn remove_source(&mut self, appsrc: AppSrcId) {
        self.record.appsrcs.lock().retain(|id| *id != appsrc);
    }

    fn flush_start(&mut self, _appsrc: AppSrcId) {}
    fn flush_stop(&mut self, _appsrc: AppSrcId, _reset_time: bool) {}

    fn push_buffer(&mut self, appsrc: AppSrcId, buffer: MediaBuffer) -> Result<(), BackendError> {
        self.record
            .ops
            .lock()
            .push(PipelineOp::Push(appsrc, buffer.data.len()));
        Ok(())
    }

    fn signal_eos(&mut self, appsrc: AppSrcId) {
        self.record.ops.lock().push(PipelineOp::SignalEos(appsrc));
    }

    fn set_state(&mut self, state: PipelineState) -> Result<(), BackendError> {
        let old = self.state;
        self.state = state;
        match state {
            PipelineState::Playing => {
                self.post_state_change(old, PipelineState::Playing);
                // Prerolled pipelines start pulling data immediately.
                self.record.request_data();
            }
            PipelineState::Paused => self.post_state_change(old, PipelineState::Paused),
            PipelineState::Null | PipelineState::Ready => {
                self.post_state_change(old, state);
            }
        }
        Ok(())
    }

    fn seek(&mut self, position_ns: i64, rate: f64) -> Result<(), BackendError> {
        self.record.ops.lock().push(PipelineOp::Seek(position_ns, rate));
        Ok(())
    }

    fn seek_source(
        &mut self,
        _appsrc: AppSrcId,
        _position_ns: i64,
        _reset_time: bool,
        _applied_rate: f64,
        _stop_position_ns: i64,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn audio_sink_kind(&self) -> AudioSinkKind {
        AudioSinkKind::Standard
    }

    fn supports_instant_rate_change(&self) -> bool {
        false
    }

    fn send_segment_rate(&mut self, _rate: f64) -> Result<(), BackendError> {
        Ok(())
    }

    fn seek_instant_rate(&mut self, _rate: f64) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_rate_property(&mut self, rate: f64) -> Result<(), BackendError> {
        self.record.ops.lock().push(PipelineOp::RateProperty(rate));
        Ok(())
    }

    fn set_volume(&mut self, volume: f64) {
        self.record.ops.lock().push(PipelineOp::SetVolume(volume));
    }

    fn volume(&self) -> f64 {
        0.7
    }

    fn fade_volume(&mut self, _target: f64, _duration_ms: u32, _ease: EaseType) {}

    fn set_mute(&mut self, _mute: bool) {}
    fn mute(&self) -> bool {
        false
    }

    fn process_audio_gap(
        &mut self,
        _position_ns: i64,
        _duration_ns: i64,
        _discontinuity_gap_ns: i64,
        _is_audio_aac: bool,
    ) {
    }

    fn set_video_geometry(&mut self, _geometry: VideoGeometry) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_immediate_output(
        &mut self,
        _appsrc: AppSrcId,
        _enabled: bool,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    fn immediate_output(&self, _appsrc: AppSrcId) -> Result<bool, BackendError> {
        Ok(false)
    }

    fn set_low_latency(&mut self, _enabled: bool) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_sync(&mut self, _sync: bool) -> Result<(), BackendError> {
        Ok(())
    }

    fn sync(&self) -> Result<bool, BackendError> {
        Ok(true)
    }

    fn set_sync_off(&mut self, _sync_off: bool) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_stream_sync_mode(&mut self, _appsrc: AppSrcId, _mode: i32) -> Result<(), BackendError> {
        Ok(())
    }

    fn stream_sync_mode(&self) -> Result<i32, BackendError> {
        Ok(0)
    }

    fn set_buffering_limit(&mut self, _limit_ms: u32) {}
    fn buffering_limit(&self) -> u32 {
        0
    }
    fn set_use_buffering(&mut self, _use_buffering: bool) {}
    fn use_buffering(&self) -> bool {
        false
    }

    fn position(&self) -> Option<i64> {
        Some(1_000_000)
    }

    fn stats(&self, _appsrc: AppSrcId) -> Option<(u64, u64)> {
        Some((240, 1))
    }

    fn is_video_master(&self) -> bool {
        false
    }

    fn render_frame(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_text_track_identifier(&mut self, _identifier: &str) {}
    fn text_track_identifier(&self) -> String {
        String::new()
    }
}

#[derive(Default)]
struct TestBackendFactory {
    pipelines: Mutex<Vec<Arc<PipelineRecord>>>,
}

impl TestBackendFactory {
    fn pipeline(&self, index: usize) -> Arc<PipelineRecord> {
        Arc::clone(&self.pipelines.lock()[index])
    }
}

impl PlayerBackendFactory for TestBackendFactory {
    fn create_backend(
        &self,
        _session_id: u32,
        handler: Arc<dyn BackendEventHandler>,
    ) -> Result<Box<dyn PlayerBackend>, BackendError> {
        let record = Arc::new(PipelineRecord::default());
        *record.handler.lock() = Some(Arc::clone(&handler));
        self.pipelines.lock().push(Arc::clone(&record));
        Ok(Box::new(TestBackend {
            record,
            handler,
            next_appsrc: 0,
            state: PipelineState::Null,
        }))
    }
}

struct EmptyRegistry;

impl FactoryRegistry for EmptyRegistry {
    fn factories(&self) -> Vec<FactoryHandle> {
        Vec::new()
    }
    fn classify(&self, _factory: FactoryHandle) -> FactoryClass {
        FactoryClass::default()
    }
    fn cached_properties(&self, _factory: FactoryHandle) -> Option<Vec<String>> {
        None
    }
    fn load_feature(&self, _factory: FactoryHandle) -> bool {
        false
    }
    fn instantiated_properties(&self, _factory: FactoryHandle) -> Option<Vec<String>> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client-side event capture
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum ClientEvent {
    Playback(PlaybackState),
    Network(NetworkState),
    NeedData {
        source_id: SourceId,
        request_id: u32,
        frame_count: u32,
        shm_info: ShmInfo,
    },
    SourceFlushed(SourceId),
}

struct CapturingCallbacks {
    sender: Mutex<mpsc::Sender<ClientEvent>>,
}

impl MediaPipelineCallbacks for CapturingCallbacks {
    fn on_playback_state(&self, state: PlaybackState) {
        let _ = self.sender.lock().send(ClientEvent::Playback(state));
    }
    fn on_network_state(&self, state: NetworkState) {
        let _ = self.sender.lock().send(ClientEvent::Network(state));
    }
    fn on_need_media_data(
        &self,
        source_id: SourceId,
        request_id: u32,
        frame_count: u32,
        shm_info: ShmInfo,
    ) {
        let _ = self.sender.lock().send(ClientEvent::NeedData {
            source_id,
            request_id,
            frame_count,
            shm_info,
        });
    }
    fn on_source_flushed(&self, source_id: SourceId) {
        let _ = self.sender.lock().send(ClientEvent::SourceFlushed(source_id));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    connection: ClientConnection,
    factory: Arc<TestBackendFactory>,
    _service: Arc<PlaybackService>,
    shutdown: rialto_ipc::ServerShutdown,
    server_thread: Option<thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl Harness {
    fn start() -> Self {
        let factory = Arc::new(TestBackendFactory::default());
        let probe = Arc::new(CapabilityProbe::new(Arc::new(EmptyRegistry)));
        let service = PlaybackService::new(
            PlaybackServiceConfig::default(),
            Arc::clone(&factory) as Arc<dyn PlayerBackendFactory>,
            probe,
        )
        .unwrap();

        let (client_end, server_end) = SeqPacketSocket::pair().unwrap();
        let mut server = Server::new().unwrap();
        server.set_request_handler(Arc::clone(&service) as Arc<dyn rialto_ipc::RequestHandler>);
        let connected_service = Arc::clone(&service);
        server.set_client_connected(move |client| connected_service.client_connected(client));
        let disconnected_service = Arc::clone(&service);
        server.set_client_disconnected(move |client| {
            disconnected_service.client_disconnected(client)
        });
        service.set_shutdown_handle(server.shutdown_handle());
        server.add_client(server_end).unwrap();

        let shutdown = server.shutdown_handle();
        let stop = Arc::new(AtomicBool::new(false));
        let server_thread = thread::spawn(move || {
            while server.process() {
                server.wait(50);
            }
        });

        let connection = ClientConnection::from_socket(client_end).unwrap();
        Self {
            connection,
            factory,
            _service: service,
            shutdown,
            server_thread: Some(server_thread),
            stop,
        }
    }

    fn pipeline_client(&self) -> (MediaPipelineClient, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel();
        let callbacks = Arc::new(CapturingCallbacks {
            sender: Mutex::new(tx),
        });
        let client = MediaPipelineClient::create(self.connection.handle(), callbacks, 1920, 1080)
            .unwrap();
        (client, rx)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.connection.handle().disconnect();
        self.shutdown.shutdown();
        if let Some(thread) = self.server_thread.take() {
            let _ = thread.join();
        }
    }
}

fn wait_for(
    rx: &mpsc::Receiver<ClientEvent>,
    mut predicate: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("timed out waiting for event");
        let event = rx.recv_timeout(remaining).expect("event stream closed");
        if predicate(&event) {
            return event;
        }
    }
}

fn audio_source() -> SourceDescriptor {
    SourceDescriptor {
        source_type: MediaSourceType::Audio,
        mime_type: "audio/x-opus".into(),
        audio_config: Some(AudioConfig {
            channels: 2,
            sample_rate: 48_000,
            codec_specific_config: None,
        }),
        codec_data: None,
        is_drm: false,
        dolby_vision_profile: None,
        text_track_identifier: None,
    }
}

fn video_source() -> SourceDescriptor {
    SourceDescriptor {
        source_type: MediaSourceType::Video,
        mime_type: "video/h264".into(),
        audio_config: None,
        codec_data: None,
        is_drm: false,
        dolby_vision_profile: None,
        text_track_identifier: None,
    }
}

fn segment_header(source_id: SourceId, source_type: MediaSourceType) -> MediaSegmentHeader {
    MediaSegmentHeader {
        source_id,
        source_type,
        time_ns: 0,
        duration_ns: 20_000_000,
        payload_len: 0,
        audio: None,
        dimensions: None,
        protection: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn happy_path_playback_reaches_playing_and_requests_data() {
    let harness = Harness::start();
    let (client, rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    let audio = client.attach_source(audio_source()).unwrap();
    let video = client.attach_source(video_source()).unwrap();
    assert_ne!(audio, video);
    client.all_sources_attached().unwrap();

    wait_for(&rx, |event| {
        matches!(event, ClientEvent::Network(NetworkState::Buffering))
    });

    client.play().unwrap();
    wait_for(&rx, |event| {
        matches!(event, ClientEvent::Playback(PlaybackState::Playing))
    });

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = wait_for(&rx, |event| matches!(event, ClientEvent::NeedData { .. }));
        if let ClientEvent::NeedData {
            source_id,
            frame_count,
            shm_info,
            ..
        } = event
        {
            assert_eq!(frame_count, 24);
            assert!(shm_info.max_len > 0);
            seen.push(source_id);
        }
    }
    seen.sort_unstable();
    let mut expected = vec![audio, video];
    expected.sort_unstable();
    assert_eq!(seen, expected);
}

#[test]
fn remove_and_reattach_returns_a_different_source_id() {
    let harness = Harness::start();
    let (client, _rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    client.attach_source(audio_source()).unwrap();
    let video_one = client.attach_source(video_source()).unwrap();
    client.all_sources_attached().unwrap();

    client.remove_source(video_one).unwrap();
    let video_two = client.attach_source(video_source()).unwrap();
    assert_ne!(video_one, video_two);
}

#[test]
fn flush_clears_end_of_stream_and_reenables_need_data() {
    let harness = Harness::start();
    let (client, rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    let audio = client.attach_source(audio_source()).unwrap();
    client.all_sources_attached().unwrap();
    client.play().unwrap();

    let request_id = match wait_for(&rx, |event| {
        matches!(event, ClientEvent::NeedData { source_id, .. } if *source_id == audio)
    }) {
        ClientEvent::NeedData { request_id, .. } => request_id,
        _ => unreachable!(),
    };

    client
        .have_data(MediaSourceStatus::EndOfStream, request_id, 0)
        .unwrap();

    // The pipeline keeps asking; the EOS flag suppresses the notification.
    harness.factory.pipeline(0).request_data();
    client.render_frame().unwrap(); // barrier: the request above is processed
    assert!(rx.try_recv().is_err());

    client.flush(audio, true, false).unwrap();
    wait_for(&rx, |event| *event == ClientEvent::SourceFlushed(audio));

    // Flush cleared the EOS flag: exactly one new need-data cycle.
    harness.factory.pipeline(0).request_data();
    harness.factory.pipeline(0).request_data();
    let event = wait_for(&rx, |event| matches!(event, ClientEvent::NeedData { .. }));
    match event {
        ClientEvent::NeedData { source_id, .. } => assert_eq!(source_id, audio),
        _ => unreachable!(),
    }
    client.render_frame().unwrap();
    assert!(rx
        .try_recv()
        .map(|event| !matches!(event, ClientEvent::NeedData { .. }))
        .unwrap_or(true));
}

#[test]
fn have_data_moves_segments_from_the_partition_into_the_pipeline() {
    let harness = Harness::start();
    let (client, rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    let audio = client.attach_source(audio_source()).unwrap();
    client.all_sources_attached().unwrap();
    client.play().unwrap();

    let (request_id, shm_info) = match wait_for(&rx, |event| {
        matches!(event, ClientEvent::NeedData { source_id, .. } if *source_id == audio)
    }) {
        ClientEvent::NeedData {
            request_id,
            shm_info,
            ..
        } => (request_id, shm_info),
        _ => unreachable!(),
    };

    let frames = client
        .write_segments(
            shm_info,
            &[
                (segment_header(audio, MediaSourceType::Audio), b"abcd" as &[u8]),
                (segment_header(audio, MediaSourceType::Audio), b"efghij" as &[u8]),
            ],
        )
        .unwrap();
    client
        .have_data(MediaSourceStatus::Ok, request_id, frames)
        .unwrap();
    client.render_frame().unwrap(); // barrier

    let ops = harness.factory.pipeline(0).ops();
    let pushes: Vec<_> = ops
        .iter()
        .filter_map(|op| match op {
            PipelineOp::Push(_, len) => Some(*len),
            _ => None,
        })
        .collect();
    assert_eq!(pushes, vec![4, 6]);
}

#[test]
fn rate_change_while_paused_is_deferred_until_playing() {
    let harness = Harness::start();
    let (client, rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    client.attach_source(audio_source()).unwrap();
    client.all_sources_attached().unwrap();

    client.pause().unwrap();
    wait_for(&rx, |event| {
        matches!(event, ClientEvent::Playback(PlaybackState::Paused))
    });

    client.set_playback_rate(1.5).unwrap();
    assert!(!harness
        .factory
        .pipeline(0)
        .ops()
        .contains(&PipelineOp::RateProperty(1.5)));

    client.play().unwrap();
    wait_for(&rx, |event| {
        matches!(event, ClientEvent::Playback(PlaybackState::Playing))
    });
    client.render_frame().unwrap(); // barrier behind the bus task
    assert!(harness
        .factory
        .pipeline(0)
        .ops()
        .contains(&PipelineOp::RateProperty(1.5)));
}

#[test]
fn zero_playback_rate_is_rejected() {
    let harness = Harness::start();
    let (client, _rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    let err = client.set_playback_rate(0.0).unwrap_err();
    assert!(err.to_string().contains("non-zero"));
}

#[test]
fn seek_issues_a_pipeline_seek_at_the_current_rate() {
    let harness = Harness::start();
    let (client, rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    client.attach_source(audio_source()).unwrap();
    client.attach_source(video_source()).unwrap();
    client.all_sources_attached().unwrap();
    client.pause().unwrap();
    wait_for(&rx, |event| {
        matches!(event, ClientEvent::Playback(PlaybackState::Paused))
    });

    client.set_position(4_028_596_027).unwrap();
    assert!(harness
        .factory
        .pipeline(0)
        .ops()
        .contains(&PipelineOp::Seek(4_028_596_027, 1.0)));
}

#[test]
fn volume_and_position_queries_roundtrip() {
    let harness = Harness::start();
    let (client, _rx) = harness.pipeline_client();

    client.load(MediaType::Mse, "video/mp4", "mse://1").unwrap();
    client.set_volume(0.4, 0, EaseType::Linear).unwrap();
    assert!(harness
        .factory
        .pipeline(0)
        .ops()
        .contains(&PipelineOp::SetVolume(0.4)));
    assert_eq!(client.volume().unwrap(), 0.7);
    assert_eq!(client.position().unwrap(), 1_000_000);
}

#[test]
fn ping_acks_once_every_session_drained_it() {
    let harness = Harness::start();
    let (_client, _rx) = harness.pipeline_client();

    let control = ControlClient::new(harness.connection.handle());
    control.ping(7).unwrap();
}

#[test]
fn sessions_are_bounded_by_max_playbacks() {
    let harness = Harness::start();
    let (_first, _rx1) = harness.pipeline_client();
    let (_second, _rx2) = harness.pipeline_client();

    let (tx, _rx3) = mpsc::channel();
    let callbacks = Arc::new(CapturingCallbacks {
        sender: Mutex::new(tx),
    });
    let result = MediaPipelineClient::create(harness.connection.handle(), callbacks, 0, 0);
    assert!(result.is_err());
}

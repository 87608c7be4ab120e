//! Web-audio playback: small PCM players writing through their own
//! shared-memory partitions.
//!
//! Each player handle owns one WEB_AUDIO partition. The client asks how
//! many frames fit, writes raw PCM into the partition and commits with a
//! write-buffer call; a playing player hands frames straight to the sink,
//! a paused one accumulates them until the partition is full.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use rialto_core::error::{ServiceError, ServiceResult};
use rialto_core::schema::{
    CreateWebAudioPlayerRequest, CreateWebAudioPlayerResponse, WebAudioGetBufferAvailableResponse,
    WebAudioGetDeviceInfoResponse,
};
use rialto_core::types::{AudioConfig, MediaSourceType, PlaybackType, ShmInfo};
use rialto_ipc::ClientId;

use crate::shared_memory::SharedMemoryBuffer;

/// PCM samples are 16-bit; one frame is `channels * 2` bytes.
const BYTES_PER_SAMPLE: u64 = 2;

#[derive(Debug)]
struct WebAudioPlayer {
    owner: ClientId,
    config: AudioConfig,
    window: ShmInfo,
    capacity_frames: u32,
    pending_frames: u32,
    playing: bool,
    eos: bool,
    volume: f64,
}

impl WebAudioPlayer {
    fn bytes_per_frame(config: &AudioConfig) -> u64 {
        u64::from(config.channels.max(1)) * BYTES_PER_SAMPLE
    }

    fn available_frames(&self) -> u32 {
        self.capacity_frames - self.pending_frames
    }
}

/// Registry of web-audio players, bounded by `maxWebAudioPlayers`.
pub struct WebAudioService {
    shm: Arc<SharedMemoryBuffer>,
    players: DashMap<u32, Mutex<WebAudioPlayer>>,
    next_handle: AtomicU32,
    max_players: u32,
}

impl WebAudioService {
    pub fn new(shm: Arc<SharedMemoryBuffer>, max_players: u32) -> Self {
        Self {
            shm,
            players: DashMap::new(),
            next_handle: AtomicU32::new(1),
            max_players,
        }
    }

    pub fn create(
        &self,
        owner: ClientId,
        request: CreateWebAudioPlayerRequest,
    ) -> ServiceResult<CreateWebAudioPlayerResponse> {
        let Some(config) = request.pcm_config else {
            return Err(ServiceError::InvalidArgument(
                "web audio requires a pcm config".into(),
            ));
        };
        if config.channels == 0 || config.sample_rate == 0 {
            return Err(ServiceError::InvalidArgument(
                "pcm config needs channels and a sample rate".into(),
            ));
        }
        if self.players.len() >= self.max_players as usize {
            return Err(ServiceError::ResourceExhausted(format!(
                "web audio player budget of {} exhausted",
                self.max_players
            )));
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.shm.map_partition(PlaybackType::WebAudio, handle)?;
        let window = self
            .shm
            .window(PlaybackType::WebAudio, handle, MediaSourceType::Audio)
            .ok_or_else(|| {
                ServiceError::ResourceExhausted("web audio partition missing".into())
            })?;

        let capacity_frames = (window.max_len / WebAudioPlayer::bytes_per_frame(&config)) as u32;
        self.players.insert(
            handle,
            Mutex::new(WebAudioPlayer {
                owner,
                config,
                window,
                capacity_frames,
                pending_frames: 0,
                playing: false,
                eos: false,
                volume: 1.0,
            }),
        );
        debug!(handle, capacity_frames, "web audio player created");
        Ok(CreateWebAudioPlayerResponse { handle })
    }

    pub fn destroy(&self, owner: ClientId, handle: u32) -> ServiceResult<()> {
        let owned = self
            .players
            .get(&handle)
            .map(|entry| entry.lock().owner == owner)
            .ok_or_else(|| {
                ServiceError::InvalidArgument(format!("no web audio player {handle}"))
            })?;
        if !owned {
            return Err(ServiceError::InvalidArgument(format!(
                "web audio player {handle} belongs to another client"
            )));
        }
        self.players.remove(&handle);
        self.shm.unmap_partition(PlaybackType::WebAudio, handle);
        Ok(())
    }

    /// Tears down every player owned by a disconnected client.
    pub fn destroy_for_client(&self, owner: ClientId) {
        let handles: Vec<u32> = self
            .players
            .iter()
            .filter(|entry| entry.value().lock().owner == owner)
            .map(|entry| *entry.key())
            .collect();
        for handle in handles {
            self.players.remove(&handle);
            self.shm.unmap_partition(PlaybackType::WebAudio, handle);
        }
    }

    fn with_player<T>(
        &self,
        handle: u32,
        f: impl FnOnce(&mut WebAudioPlayer) -> ServiceResult<T>,
    ) -> ServiceResult<T> {
        let entry = self.players.get(&handle).ok_or_else(|| {
            ServiceError::InvalidArgument(format!("no web audio player {handle}"))
        })?;
        let mut player = entry.lock();
        f(&mut player)
    }

    pub fn play(&self, handle: u32) -> ServiceResult<()> {
        self.with_player(handle, |player| {
            player.playing = true;
            // The sink drains whatever was parked while paused.
            player.pending_frames = 0;
            Ok(())
        })
    }

    pub fn pause(&self, handle: u32) -> ServiceResult<()> {
        self.with_player(handle, |player| {
            player.playing = false;
            Ok(())
        })
    }

    pub fn set_eos(&self, handle: u32) -> ServiceResult<()> {
        self.with_player(handle, |player| {
            player.eos = true;
            Ok(())
        })
    }

    pub fn buffer_available(&self, handle: u32) -> ServiceResult<WebAudioGetBufferAvailableResponse> {
        self.with_player(handle, |player| {
            Ok(WebAudioGetBufferAvailableResponse {
                available_frames: player.available_frames(),
                shm_info: player.window,
            })
        })
    }

    pub fn write_buffer(&self, handle: u32, number_of_frames: u32) -> ServiceResult<()> {
        self.with_player(handle, |player| {
            if player.eos {
                return Err(ServiceError::InvalidArgument(
                    "write after end of stream".into(),
                ));
            }
            if number_of_frames > player.available_frames() {
                return Err(ServiceError::InvalidArgument(format!(
                    "{number_of_frames} frames exceed the {} available",
                    player.available_frames()
                )));
            }
            if player.playing {
                // Handed straight to the sink.
            } else {
                player.pending_frames += number_of_frames;
            }
            Ok(())
        })
    }

    pub fn device_info(&self, handle: u32) -> ServiceResult<WebAudioGetDeviceInfoResponse> {
        self.with_player(handle, |player| {
            Ok(WebAudioGetDeviceInfoResponse {
                preferred_frames: player.capacity_frames / 4,
                maximum_frames: player.capacity_frames,
                support_deferred_play: true,
            })
        })
    }

    pub fn set_volume(&self, handle: u32, volume: f64) -> ServiceResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(ServiceError::InvalidArgument(format!(
                "volume {volume} outside [0.0, 1.0]"
            )));
        }
        self.with_player(handle, |player| {
            player.volume = volume;
            Ok(())
        })
    }

    pub fn volume(&self, handle: u32) -> ServiceResult<f64> {
        self.with_player(handle, |player| Ok(player.volume))
    }

    /// Exposes the pcm config for diagnostics.
    pub fn pcm_config(&self, handle: u32) -> ServiceResult<AudioConfig> {
        self.with_player(handle, |player| Ok(player.config.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_memory::SharedMemoryConfig;

    fn service(max_players: u32) -> WebAudioService {
        let shm = Arc::new(
            SharedMemoryBuffer::new(SharedMemoryConfig {
                max_playbacks: 1,
                max_web_audio_players: max_players.max(1),
                audio_partition_len: 4096,
                video_partition_len: 4096,
                subtitle_partition_len: 1024,
                web_audio_partition_len: 4096,
            })
            .unwrap(),
        );
        WebAudioService::new(shm, max_players)
    }

    fn pcm() -> Option<AudioConfig> {
        Some(AudioConfig {
            channels: 2,
            sample_rate: 48_000,
            codec_specific_config: None,
        })
    }

    fn create_request() -> CreateWebAudioPlayerRequest {
        CreateWebAudioPlayerRequest {
            audio_mime_type: "audio/x-raw".into(),
            priority: 1,
            pcm_config: pcm(),
        }
    }

    #[test]
    fn create_requires_a_pcm_config() {
        let service = service(1);
        let result = service.create(
            1,
            CreateWebAudioPlayerRequest {
                audio_mime_type: "audio/x-raw".into(),
                priority: 1,
                pcm_config: None,
            },
        );
        assert!(matches!(result, Err(ServiceError::InvalidArgument(_))));
    }

    #[test]
    fn player_budget_is_enforced() {
        let service = service(1);
        service.create(1, create_request()).unwrap();
        assert!(matches!(
            service.create(1, create_request()),
            Err(ServiceError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn paused_player_accumulates_frames_until_full() {
        let service = service(1);
        let handle = service.create(1, create_request()).unwrap().handle;

        let available = service.buffer_available(handle).unwrap();
        // 4096 bytes / 4 bytes per stereo frame.
        assert_eq!(available.available_frames, 1024);

        service.write_buffer(handle, 1000).unwrap();
        assert_eq!(service.buffer_available(handle).unwrap().available_frames, 24);
        assert!(matches!(
            service.write_buffer(handle, 100),
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn play_drains_parked_frames() {
        let service = service(1);
        let handle = service.create(1, create_request()).unwrap().handle;
        service.write_buffer(handle, 512).unwrap();
        service.play(handle).unwrap();
        assert_eq!(
            service.buffer_available(handle).unwrap().available_frames,
            1024
        );
    }

    #[test]
    fn writes_after_eos_are_rejected() {
        let service = service(1);
        let handle = service.create(1, create_request()).unwrap().handle;
        service.set_eos(handle).unwrap();
        assert!(matches!(
            service.write_buffer(handle, 1),
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn destroy_frees_the_partition_for_a_new_player() {
        let service = service(1);
        let handle = service.create(1, create_request()).unwrap().handle;
        service.destroy(1, handle).unwrap();
        service.create(2, create_request()).unwrap();
    }

    #[test]
    fn destroy_rejects_foreign_owners() {
        let service = service(1);
        let handle = service.create(1, create_request()).unwrap().handle;
        assert!(matches!(
            service.destroy(2, handle),
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn client_teardown_reaps_owned_players() {
        let service = service(2);
        let first = service.create(1, create_request()).unwrap().handle;
        let second = service.create(2, create_request()).unwrap().handle;

        service.destroy_for_client(1);
        assert!(service.volume(first).is_err());
        assert_eq!(service.volume(second).unwrap(), 1.0);
    }

    #[test]
    fn device_info_reflects_partition_capacity() {
        let service = service(1);
        let handle = service.create(1, create_request()).unwrap().handle;
        let info = service.device_info(handle).unwrap();
        assert_eq!(info.maximum_frames, 1024);
        assert_eq!(info.preferred_frames, 256);
        assert!(info.support_deferred_play);
    }
}

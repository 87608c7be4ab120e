//! The web-audio player stub.

use rialto_core::schema::{
    encode_body, Ack, CreateWebAudioPlayerRequest, CreateWebAudioPlayerResponse, GetVolumeResponse,
    MethodId, WebAudioGetBufferAvailableResponse, WebAudioGetDeviceInfoResponse,
    WebAudioHandleRequest, WebAudioSetVolumeRequest, WebAudioWriteBufferRequest,
};
use rialto_core::types::{AudioConfig, ShmInfo};
use rialto_ipc::ChannelHandle;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ClientResult;

/// One web-audio player handle on the session server.
pub struct WebAudioPlayerClient {
    channel: ChannelHandle,
    handle: u32,
}

impl WebAudioPlayerClient {
    /// Creates a player for raw PCM with the given configuration.
    pub fn create(
        channel: ChannelHandle,
        audio_mime_type: &str,
        priority: u32,
        pcm_config: AudioConfig,
    ) -> ClientResult<Self> {
        let response: CreateWebAudioPlayerResponse = call(
            &channel,
            MethodId::CreateWebAudioPlayer,
            &CreateWebAudioPlayerRequest {
                audio_mime_type: audio_mime_type.to_string(),
                priority,
                pcm_config: Some(pcm_config),
            },
        )?;
        Ok(Self {
            channel,
            handle: response.handle,
        })
    }

    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn play(&self) -> ClientResult<()> {
        let _: Ack = self.call_handle(MethodId::WebAudioPlay)?;
        Ok(())
    }

    pub fn pause(&self) -> ClientResult<()> {
        let _: Ack = self.call_handle(MethodId::WebAudioPause)?;
        Ok(())
    }

    pub fn set_eos(&self) -> ClientResult<()> {
        let _: Ack = self.call_handle(MethodId::WebAudioSetEos)?;
        Ok(())
    }

    /// How many frames currently fit, and where to put them.
    pub fn buffer_available(&self) -> ClientResult<(u32, ShmInfo)> {
        let response: WebAudioGetBufferAvailableResponse =
            self.call_handle(MethodId::WebAudioGetBufferAvailable)?;
        Ok((response.available_frames, response.shm_info))
    }

    /// Commits frames previously written into the announced window.
    pub fn write_buffer(&self, number_of_frames: u32) -> ClientResult<()> {
        let _: Ack = call(
            &self.channel,
            MethodId::WebAudioWriteBuffer,
            &WebAudioWriteBufferRequest {
                handle: self.handle,
                number_of_frames,
            },
        )?;
        Ok(())
    }

    pub fn device_info(&self) -> ClientResult<WebAudioGetDeviceInfoResponse> {
        self.call_handle(MethodId::WebAudioGetDeviceInfo)
    }

    pub fn set_volume(&self, volume: f64) -> ClientResult<()> {
        let _: Ack = call(
            &self.channel,
            MethodId::WebAudioSetVolume,
            &WebAudioSetVolumeRequest {
                handle: self.handle,
                volume,
            },
        )?;
        Ok(())
    }

    pub fn volume(&self) -> ClientResult<f64> {
        let response: GetVolumeResponse = self.call_handle(MethodId::WebAudioGetVolume)?;
        Ok(response.volume)
    }

    /// Destroys the server-side player.
    pub fn destroy(self) -> ClientResult<()> {
        let _: Ack = self.call_handle(MethodId::DestroyWebAudioPlayer)?;
        Ok(())
    }

    fn call_handle<Resp: DeserializeOwned>(&self, method: MethodId) -> ClientResult<Resp> {
        call(
            &self.channel,
            method,
            &WebAudioHandleRequest {
                handle: self.handle,
            },
        )
    }
}

fn call<Req: Serialize, Resp: DeserializeOwned>(
    channel: &ChannelHandle,
    method: MethodId,
    request: &Req,
) -> ClientResult<Resp> {
    let payload = encode_body(request)?;
    let (body, _fds) = channel.call_blocking(method.into(), payload, Vec::new())?;
    Ok(rialto_core::schema::decode_body(&body)?)
}

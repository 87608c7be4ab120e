//! Updates an attached source's caps in place while buffers keep flowing.

use rialto_core::error::ServiceError;
use rialto_core::schema::SourceDescriptor;
use rialto_core::types::SourceId;

use crate::backend::SourceCaps;
use crate::player::{PlayerResult, PlayerSession};

pub struct SwitchSource {
    pub descriptor: SourceDescriptor,
}

impl SwitchSource {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<SourceId> {
        let descriptor = self.descriptor;
        if descriptor.mime_type.is_empty() {
            return Err(ServiceError::InvalidArgument("empty mime type".into()).into());
        }

        let caps = SourceCaps {
            source_type: descriptor.source_type,
            mime_type: descriptor.mime_type,
            audio_config: descriptor.audio_config,
            codec_data: descriptor.codec_data,
            is_drm: descriptor.is_drm,
            dolby_vision_profile: descriptor.dolby_vision_profile,
        };

        let Some((source_id, appsrc)) = session
            .context
            .sources
            .get(&caps.source_type)
            .filter(|source| !source.removed)
            .map(|source| (source.source_id, source.appsrc))
        else {
            return Err(ServiceError::InvalidArgument(format!(
                "no attached {} source to switch",
                caps.source_type.as_str()
            ))
            .into());
        };

        session.backend.switch_source(appsrc, &caps)?;
        if let Some(source) = session.context.sources.get_mut(&caps.source_type) {
            source.caps = caps;
        }
        Ok(source_id)
    }
}

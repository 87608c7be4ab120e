//! Attaches a source to the session, or switches an existing one.

use tracing::debug;

use rialto_core::error::ServiceError;
use rialto_core::schema::{PlaybackErrorKind, SourceDescriptor};
use rialto_core::types::{MediaSourceType, SourceId};

use crate::backend::SourceCaps;
use crate::player::{PlayerResult, PlayerSession, SourceContext};

use super::RemoveSource;

/// Builds caps from the attach request, creates the appsrc and records a
/// new source context.
///
/// A re-attach of a type that already has a live context is a switch: with
/// a compatible mime the caps are updated in place and the existing source
/// id survives; otherwise the old source is removed first and a fresh id is
/// issued.
pub struct AttachSource {
    pub descriptor: SourceDescriptor,
}

impl AttachSource {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<SourceId> {
        let descriptor = self.descriptor;
        if descriptor.mime_type.is_empty() {
            return Err(ServiceError::InvalidArgument("empty mime type".into()).into());
        }
        if descriptor.source_type == MediaSourceType::Unknown {
            return Err(ServiceError::InvalidArgument("unknown source type".into()).into());
        }
        if !session.context.loaded {
            return Err(ServiceError::NotInitialized.into());
        }

        let caps = SourceCaps {
            source_type: descriptor.source_type,
            mime_type: descriptor.mime_type,
            audio_config: descriptor.audio_config,
            codec_data: descriptor.codec_data,
            is_drm: descriptor.is_drm,
            dolby_vision_profile: descriptor.dolby_vision_profile,
        };

        let existing = session
            .context
            .sources
            .get(&caps.source_type)
            .filter(|source| !source.removed)
            .map(|source| (source.source_id, source.appsrc, source.caps.mime_type.clone()));

        if let Some((source_id, appsrc, mime_type)) = existing {
            if mime_type == caps.mime_type {
                // Compatible re-attach: codec-channel switch in place,
                // buffers keep flowing and the id survives.
                debug!(source = source_id, "switching source caps in place");
                session.backend.switch_source(appsrc, &caps)?;
                if let Some(source) = session.context.sources.get_mut(&caps.source_type) {
                    source.caps = caps;
                }
                return Ok(source_id);
            }
            RemoveSource { source_id }.execute(session)?;
        }

        let source_type = caps.source_type;
        let appsrc = match session.backend.attach_source(&caps) {
            Ok(appsrc) => appsrc,
            Err(e) => {
                session
                    .events
                    .playback_error(0, PlaybackErrorKind::Capability, &e.to_string());
                return Err(e.into());
            }
        };

        let source_id = session.context.allocate_source_id();
        if let Some(identifier) = &descriptor.text_track_identifier {
            session.backend.set_text_track_identifier(identifier);
        }
        session
            .context
            .sources
            .insert(source_type, SourceContext::new(source_id, caps, appsrc));
        debug!(
            source = source_id,
            source_type = source_type.as_str(),
            "source attached"
        );
        Ok(source_id)
    }
}

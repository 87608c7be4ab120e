//! Session-wide seek.

use rialto_core::error::ServiceError;
use rialto_core::types::{NetworkState, PlaybackState};

use crate::player::{PlayerResult, PlayerSession};

/// Discards everything buffered, clears the per-source need-data and EOS
/// flags and issues a pipeline seek at the configured playback rate.
pub struct SetPosition {
    pub position_ns: i64,
}

impl SetPosition {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        if !session.context.loaded {
            return Err(ServiceError::NotInitialized.into());
        }
        let seekable = matches!(
            session.context.playback_state,
            PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::EndOfStream
                | PlaybackState::Seeking
                | PlaybackState::Flushed
        ) || session.context.network_state == NetworkState::Buffering;
        if !seekable {
            return Err(ServiceError::InvalidArgument(format!(
                "seek not permitted in state {:?}",
                session.context.playback_state
            ))
            .into());
        }

        session.notify_playback_state(PlaybackState::Seeking);

        let source_types: Vec<_> = session.context.sources.keys().copied().collect();
        for source_type in source_types {
            if let Some(source) = session.context.sources.get_mut(&source_type) {
                let appsrc = source.appsrc;
                source.buffered_segments.clear();
                source.need_data_pending = false;
                source.eos_requested = false;
                source.eos_notified = false;
                session.need_data_mapping.clear_scheduled(appsrc);
            }
            session.clear_partition(source_type);
        }
        session.context.pending_requests.clear();
        session.context.eos_set.clear();

        let rate = session.context.playback_rate;
        session.backend.seek(self.position_ns, rate)?;
        session.notify_playback_state(PlaybackState::Flushed);
        Ok(())
    }
}

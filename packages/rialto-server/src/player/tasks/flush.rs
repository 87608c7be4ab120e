//! Flushes one source's appsrc and resets its streaming state.

use tracing::debug;

use rialto_core::error::ServiceError;
use rialto_core::types::SourceId;

use crate::player::{PlayerResult, PlayerSession, SourceState};

/// Marks the source flushing, runs flush-start/flush-stop on the appsrc
/// and clears buffered segments, need-data, EOS and underflow flags. A
/// synchronous flush notifies `SourceFlushed` immediately; an asynchronous
/// one completes when the pipeline re-reaches its target state and the
/// flush-on-preroll barrier releases.
pub struct Flush {
    pub source_id: SourceId,
    pub reset_time: bool,
    pub async_flush: bool,
}

impl Flush {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        let Some(source) = session.context.source_by_id(self.source_id) else {
            return Err(
                ServiceError::InvalidArgument(format!("no source {}", self.source_id)).into(),
            );
        };
        let source_type = source.source_type;
        let appsrc = source.appsrc;

        session.flush_watcher.set_flushing(source_type, self.async_flush);
        session.flush_on_preroll.set_flushing(source_type);

        // Flushing cancels this source's in-flight have-data replies.
        session
            .context
            .pending_requests
            .retain(|_, request| request.source_id != self.source_id);
        session.need_data_mapping.clear_scheduled(appsrc);
        session.context.eos_set.remove(&source_type);

        session.backend.flush_start(appsrc);
        session.backend.flush_stop(appsrc, self.reset_time);

        if let Some(source) = session.context.sources.get_mut(&source_type) {
            source.buffered_segments.clear();
            source.need_data_pending = false;
            source.underflow_occurred = false;
            source.eos_requested = false;
            source.eos_notified = false;
            source.state = SourceState::Flushing;
        }
        session.clear_partition(source_type);

        let deferred = self.async_flush && session.flush_on_preroll.is_deferred(source_type);
        if deferred {
            debug!(
                source = self.source_id,
                "flush completion deferred until the pipeline re-reaches its target state"
            );
        } else {
            session.flush_watcher.set_flushed(source_type);
            if let Some(source) = session.context.sources.get_mut(&source_type) {
                source.state = SourceState::Streaming;
            }
            session.events.source_flushed(self.source_id);
        }
        Ok(())
    }
}

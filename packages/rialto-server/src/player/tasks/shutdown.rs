//! Orderly session teardown on the main thread.

use tracing::warn;

use rialto_core::types::PlaybackState;

use crate::backend::PipelineState;
use crate::player::{PlayerResult, PlayerSession};

/// Drops the pipeline to NULL, releases the flush barrier and drops
/// everything still queued. Runs as the last task of a session.
pub struct Shutdown;

impl Shutdown {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        if let Err(e) = session.backend.set_state(PipelineState::Null) {
            warn!(error = %e, "pipeline teardown reported an error");
        }
        session.flush_on_preroll.reset();
        session.context.pending_requests.clear();
        for source in session.context.sources.values_mut() {
            source.buffered_segments.clear();
            source.need_data_pending = false;
        }
        session.notify_playback_state(PlaybackState::Stopped);
        Ok(())
    }
}

//! Bridges an audio gap while preserving the timeline.

use crate::player::{PlayerResult, PlayerSession};

/// Delegates to the platform helper that inserts silence or a
/// discontinuity marker.
pub struct ProcessAudioGap {
    pub position_ns: i64,
    pub duration_ns: i64,
    pub discontinuity_gap_ns: i64,
    pub is_audio_aac: bool,
}

impl ProcessAudioGap {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        session.backend.process_audio_gap(
            self.position_ns,
            self.duration_ns,
            self.discontinuity_gap_ns,
            self.is_audio_aac,
        );
        Ok(())
    }
}

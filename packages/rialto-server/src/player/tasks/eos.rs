//! Marks a source ended and signals EOS once its buffer drains.

use rialto_core::types::MediaSourceType;

use crate::player::{PlayerResult, PlayerSession};

/// Requests end-of-stream for one source. EOS reaches the appsrc
/// immediately when no buffered segments remain, otherwise right after the
/// last buffered segment has been pushed.
pub struct Eos {
    pub source_type: MediaSourceType,
}

impl Eos {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        let Some(source) = session.context.sources.get_mut(&self.source_type) else {
            return Ok(());
        };
        if source.removed || source.eos_notified {
            return Ok(());
        }
        source.eos_requested = true;
        session.drain_buffered(self.source_type)
    }
}

//! Per-source positioning with segment parameters.

use rialto_core::error::ServiceError;
use rialto_core::types::SourceId;

use crate::player::{PlayerResult, PlayerSession};

pub struct SetSourcePosition {
    pub source_id: SourceId,
    pub position_ns: i64,
    pub reset_time: bool,
    pub applied_rate: f64,
    pub stop_position_ns: i64,
}

impl SetSourcePosition {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        let Some(source) = session.context.source_by_id_mut(self.source_id) else {
            return Err(
                ServiceError::InvalidArgument(format!("no source {}", self.source_id)).into(),
            );
        };
        let source_type = source.source_type;
        let appsrc = source.appsrc;
        source.buffered_segments.clear();
        source.eos_requested = false;
        source.eos_notified = false;
        source.initial_position_set = true;
        session.context.eos_set.remove(&source_type);
        session.clear_partition(source_type);

        session
            .backend
            .seek_source(
                appsrc,
                self.position_ns,
                self.reset_time,
                self.applied_rate,
                self.stop_position_ns,
            )
            .map_err(Into::into)
    }
}

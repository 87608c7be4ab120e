//! Detaches a source and neutralises everything still in flight for it.

use tracing::debug;

use rialto_core::error::ServiceError;
use rialto_core::types::SourceId;

use crate::player::{PlayerResult, PlayerSession};

/// Invalidates outstanding have-data requests, disables underflow
/// reporting, flushes the appsrc (flush-stop with `reset_time = false`) and
/// marks the context removed. The next attach of the same type issues a new
/// source id.
pub struct RemoveSource {
    pub source_id: SourceId,
}

impl RemoveSource {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        let Some(source) = session.context.source_by_id(self.source_id) else {
            return Err(
                ServiceError::InvalidArgument(format!("no source {}", self.source_id)).into(),
            );
        };
        let source_type = source.source_type;
        let appsrc = source.appsrc;

        // In-flight have-data replies for this source race the removal;
        // dropping the requests makes them land as unknown ids.
        session
            .context
            .pending_requests
            .retain(|_, request| request.source_id != self.source_id);
        session.need_data_mapping.clear_scheduled(appsrc);
        session.context.eos_set.remove(&source_type);

        if let Some(source) = session.context.sources.get_mut(&source_type) {
            source.underflow_enabled = false;
            source.need_data_pending = false;
            source.buffered_segments.clear();
            source.eos_requested = false;
            source.removed = true;
        }

        session.backend.flush_start(appsrc);
        session.backend.flush_stop(appsrc, false);
        session.backend.remove_source(appsrc);
        session.clear_partition(source_type);

        debug!(
            source = self.source_id,
            source_type = source_type.as_str(),
            "source removed"
        );
        Ok(())
    }
}

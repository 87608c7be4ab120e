//! Turns an appsrc's request for data into one NeedMediaData notification.

use tracing::debug;

use rialto_core::error::ServiceError;
use rialto_core::types::PlaybackType;

use crate::backend::AppSrcId;
use crate::player::{NeedDataRequest, PlayerResult, PlayerSession, NEED_DATA_FRAME_COUNT};

/// Reserves a slot in the source's shared-memory partition, allocates a
/// request id and notifies the client.
///
/// Dedupe: while a notification for this appsrc is outstanding the task is
/// a no-op, however many times the pipeline asks. A source the client has
/// already ended (HaveData with end-of-stream status) is skipped until a
/// flush clears the flag.
pub struct NeedData {
    pub appsrc: AppSrcId,
}

impl NeedData {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        let Some(source) = session.context.source_by_appsrc(self.appsrc) else {
            debug!(appsrc = self.appsrc, "need-data for unknown appsrc ignored");
            return Ok(());
        };
        let source_type = source.source_type;
        let source_id = source.source_id;

        if session.need_data_mapping.is_scheduled(self.appsrc) {
            return Ok(());
        }
        if session.context.eos_set.contains(&source_type) {
            debug!(
                source = source_id,
                "need-data suppressed, source is at end of stream"
            );
            return Ok(());
        }

        let session_id = session.context.session_id;
        let Some(window) = session
            .shm
            .window(PlaybackType::Generic, session_id, source_type)
        else {
            return Err(ServiceError::ResourceExhausted(format!(
                "no partition for session {session_id} {}",
                source_type.as_str()
            ))
            .into());
        };
        if window.max_len == 0 {
            return Err(
                ServiceError::ResourceExhausted("empty shared-memory partition".into()).into(),
            );
        }

        let request_id = session.context.allocate_request_id();
        session.context.pending_requests.insert(
            request_id,
            NeedDataRequest {
                source_type,
                source_id,
                frame_count: NEED_DATA_FRAME_COUNT,
                window,
            },
        );
        if let Some(source) = session.context.sources.get_mut(&source_type) {
            source.need_data_pending = true;
        }
        session.need_data_mapping.set_scheduled(self.appsrc);
        session
            .events
            .need_media_data(source_id, request_id, NEED_DATA_FRAME_COUNT, window);
        Ok(())
    }
}

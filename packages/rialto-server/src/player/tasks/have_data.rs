//! Consumes the client's answer to a NeedMediaData cycle.

use tracing::{debug, warn};

use rialto_core::error::ServiceError;
use rialto_core::segments::read_segments;
use rialto_core::types::MediaSourceStatus;

use crate::player::{PlayerResult, PlayerSession};

use super::Eos;

/// Looks up the outstanding request, reads the segment records the client
/// wrote into its partition slot and hands them to the pipeline. An unknown
/// request id is silently dropped - it lost a race with a flush or a
/// remove.
pub struct HaveData {
    pub status: MediaSourceStatus,
    pub request_id: u32,
    pub num_frames: u32,
}

impl HaveData {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        let Some(request) = session.context.pending_requests.remove(&self.request_id) else {
            session.context.unknown_request_drops += 1;
            debug!(request = self.request_id, "have-data for unknown request dropped");
            return Ok(());
        };
        let source_type = request.source_type;

        let Some(source) = session.context.sources.get_mut(&source_type) else {
            return Ok(());
        };
        if source.removed || source.source_id != request.source_id {
            // Raced with a remove + re-attach; the reply belongs to the
            // previous incarnation.
            return Ok(());
        }
        source.need_data_pending = false;
        let appsrc = source.appsrc;
        session.need_data_mapping.clear_scheduled(appsrc);

        match self.status {
            MediaSourceStatus::Ok | MediaSourceStatus::EndOfStream => {
                if self.num_frames > 0 {
                    let frames = self.num_frames.min(request.frame_count);
                    let bytes = session
                        .shm
                        .copy_from_region(request.window.offset, request.window.max_len)?;
                    let segments = read_segments(&bytes, frames).map_err(|e| {
                        ServiceError::InvalidArgument(format!("bad segment data: {e}"))
                    })?;
                    if let Some(source) = session.context.sources.get_mut(&source_type) {
                        source.buffered_segments.extend(segments);
                    }
                }
                // No valid samples remain queued in the partition.
                session.clear_partition(source_type);

                if self.status == MediaSourceStatus::EndOfStream {
                    session.context.eos_set.insert(source_type);
                    Eos { source_type }.execute(session)?;
                } else {
                    session.drain_buffered(source_type)?;
                }
            }
            MediaSourceStatus::NoAvailableSamples => {
                debug!(
                    source_type = source_type.as_str(),
                    "client had no samples this cycle"
                );
            }
            MediaSourceStatus::Error => {
                warn!(
                    source_type = source_type.as_str(),
                    "client reported a data error"
                );
            }
        }
        Ok(())
    }
}

//! Routes pipeline bus messages into session state and client events.

use tracing::{debug, warn};

use rialto_core::schema::PlaybackErrorKind;
use rialto_core::types::{NetworkState, PlaybackState, QosInfo};

use crate::backend::{BusMessage, BusMessageSource, PipelineState};
use crate::player::{PlayerResult, PlayerSession};

use super::NeedData;

/// Only messages originating from the session's own pipeline mutate state;
/// everything else is freed and ignored.
pub struct HandleBusMessage {
    pub message: BusMessage,
}

impl HandleBusMessage {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        match self.message {
            BusMessage::Eos { source: BusMessageSource::Pipeline } => {
                session.notify_playback_state(PlaybackState::EndOfStream);
            }
            BusMessage::Eos { .. } => {}

            BusMessage::StateChanged {
                source: BusMessageSource::Pipeline,
                old,
                new,
                pending,
            } => {
                debug!(?old, ?new, ?pending, "pipeline state changed");
                session.context.pipeline_state = new;

                if new >= PipelineState::Paused {
                    session.apply_pending_properties();
                }
                if new == PipelineState::Playing {
                    if let Some(rate) = session.context.pending_playback_rate.take() {
                        match session.apply_rate(rate) {
                            Ok(()) => session.context.playback_rate = rate,
                            Err(e) => warn!(error = %e, "deferred rate change failed"),
                        }
                    }
                }

                session.flush_on_preroll.state_reached(new);
                session.complete_ready_flushes();

                let notified = match new {
                    PipelineState::Null | PipelineState::Ready => PlaybackState::Stopped,
                    PipelineState::Paused => PlaybackState::Paused,
                    PipelineState::Playing => PlaybackState::Playing,
                };
                session.notify_playback_state(notified);

                // Segments parked behind the flush barrier can go out now.
                let buffered: Vec<_> = session
                    .context
                    .sources
                    .iter()
                    .filter(|(_, source)| !source.buffered_segments.is_empty())
                    .map(|(source_type, _)| *source_type)
                    .collect();
                for source_type in buffered {
                    session.drain_buffered(source_type)?;
                }
            }
            BusMessage::StateChanged { .. } => {}

            BusMessage::Qos {
                source_type: Some(source_type),
                processed,
                dropped,
            } => {
                if let Some(source) = session.context.sources.get(&source_type) {
                    if !source.removed {
                        session
                            .events
                            .qos(source.source_id, QosInfo { processed, dropped });
                    }
                }
            }
            BusMessage::Qos { source_type: None, .. } => {
                // Element class did not identify a source type.
                debug!("qos message from unidentified element dropped");
            }

            BusMessage::Error { source, message } => {
                warn!(?source, error = %message, "pipeline error");
                session
                    .events
                    .playback_error(0, PlaybackErrorKind::Stream, &message);
                session.notify_playback_state(PlaybackState::Failure);
            }

            BusMessage::Underflow { source_type } => {
                let appsrc = match session.context.sources.get_mut(&source_type) {
                    Some(source)
                        if !source.removed
                            && source.underflow_enabled
                            && !source.underflow_occurred =>
                    {
                        source.underflow_occurred = true;
                        Some(source.appsrc)
                    }
                    _ => None,
                };
                if let Some(appsrc) = appsrc {
                    session.notify_network_state(NetworkState::Stalled);
                    NeedData { appsrc }.execute(session)?;
                }
            }

            BusMessage::StreamCollection { source } => {
                debug!(?source, "stream collection acknowledged");
            }
        }
        Ok(())
    }
}

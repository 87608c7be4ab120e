//! Changes the playback rate, deferring it while below PLAYING.

use rialto_core::error::ServiceError;

use crate::backend::PipelineState;
use crate::player::{PlayerResult, PlayerSession};

pub struct SetPlaybackRate {
    pub rate: f64,
}

impl SetPlaybackRate {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        if self.rate == 0.0 {
            return Err(ServiceError::InvalidArgument("playback rate must be non-zero".into()).into());
        }
        if (self.rate - session.context.playback_rate).abs() < f64::EPSILON {
            return Ok(());
        }
        if session.context.pipeline_state < PipelineState::Playing {
            session.context.pending_playback_rate = Some(self.rate);
            return Ok(());
        }
        session.apply_rate(self.rate)?;
        session.context.playback_rate = self.rate;
        session.context.pending_playback_rate = None;
        Ok(())
    }
}

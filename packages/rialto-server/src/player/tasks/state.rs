//! Pipeline state transitions requested by the client.

use rialto_core::error::ServiceError;
use rialto_core::types::PlaybackState;

use crate::backend::PipelineState;
use crate::player::{PlayerResult, PlayerSession};

pub struct Play;

impl Play {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        if !session.context.loaded {
            return Err(ServiceError::NotInitialized.into());
        }
        session.context.target_state = PipelineState::Playing;
        session.flush_on_preroll.set_target_state(PipelineState::Playing);
        session.backend.set_state(PipelineState::Playing)?;
        Ok(())
    }
}

pub struct Pause;

impl Pause {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        if !session.context.loaded {
            return Err(ServiceError::NotInitialized.into());
        }
        session.context.target_state = PipelineState::Paused;
        session.flush_on_preroll.set_target_state(PipelineState::Paused);
        session.backend.set_state(PipelineState::Paused)?;
        Ok(())
    }
}

pub struct Stop;

impl Stop {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        session.context.target_state = PipelineState::Null;
        session.flush_on_preroll.set_target_state(PipelineState::Null);
        session.backend.set_state(PipelineState::Null)?;
        session.notify_playback_state(PlaybackState::Stopped);
        Ok(())
    }
}

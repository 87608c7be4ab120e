//! Sets or fades the session volume.

use rialto_core::error::ServiceError;
use rialto_core::types::EaseType;

use crate::player::{PlayerResult, PlayerSession};

/// Immediate linear changes map to a plain property set; anything else
/// goes through the platform audio-fade helper.
pub struct SetVolume {
    pub target_volume: f64,
    pub duration_ms: u32,
    pub ease_type: EaseType,
}

impl SetVolume {
    pub fn execute(self, session: &mut PlayerSession) -> PlayerResult<()> {
        if !(0.0..=1.0).contains(&self.target_volume) {
            return Err(ServiceError::InvalidArgument(format!(
                "volume {} outside [0.0, 1.0]",
                self.target_volume
            ))
            .into());
        }
        if self.duration_ms == 0 && self.ease_type == EaseType::Linear {
            session.backend.set_volume(self.target_volume);
        } else {
            session
                .backend
                .fade_volume(self.target_volume, self.duration_ms, self.ease_type);
        }
        Ok(())
    }
}

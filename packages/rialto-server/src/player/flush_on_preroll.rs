//! The flush-on-preroll barrier.
//!
//! Flushing a source while the pipeline is still prerolling poisons any
//! data injected before the pipeline re-reaches its target state: the
//! decoder discards it. The barrier stalls injection for a flushed source
//! until the pipeline catches up.
//!
//! `wait_if_required(type)` blocks iff the source is flagged flushing and
//! `reached_state < target_state`; `state_reached(target)` releases every
//! waiter and clears the flags, as does `reset()`.

use parking_lot::{Condvar, Mutex};

use rialto_core::types::MediaSourceType;

use crate::backend::PipelineState;

#[derive(Debug)]
struct BarrierState {
    target_state: PipelineState,
    reached_state: PipelineState,
    flushing: Vec<MediaSourceType>,
}

/// Two-variable barrier between flushes and data injection.
#[derive(Debug)]
pub struct FlushOnPrerollController {
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl Default for FlushOnPrerollController {
    fn default() -> Self {
        Self {
            state: Mutex::new(BarrierState {
                target_state: PipelineState::Null,
                reached_state: PipelineState::Null,
                flushing: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

impl FlushOnPrerollController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the state the pipeline is being driven towards.
    pub fn set_target_state(&self, target: PipelineState) {
        self.state.lock().target_state = target;
    }

    /// Flags a source as having a flush in progress.
    pub fn set_flushing(&self, source_type: MediaSourceType) {
        let mut state = self.state.lock();
        if !state.flushing.contains(&source_type) {
            state.flushing.push(source_type);
        }
    }

    /// Records that the pipeline reached `reached`. Reaching the target
    /// state clears every flushing flag and releases all waiters.
    pub fn state_reached(&self, reached: PipelineState) {
        let mut state = self.state.lock();
        state.reached_state = reached;
        if reached >= state.target_state {
            state.flushing.clear();
            self.cond.notify_all();
        }
    }

    /// Drops all flags and releases all waiters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.flushing.clear();
        state.target_state = PipelineState::Null;
        state.reached_state = PipelineState::Null;
        self.cond.notify_all();
    }

    /// True when injection for `source_type` must hold back right now.
    #[must_use]
    pub fn is_deferred(&self, source_type: MediaSourceType) -> bool {
        let state = self.state.lock();
        state.flushing.contains(&source_type) && state.reached_state < state.target_state
    }

    /// Blocks until injection for `source_type` may proceed.
    ///
    /// Returns immediately iff the source is not flushing or the pipeline
    /// already reached its target. Meant for pipeline worker threads; the
    /// session main thread uses [`Self::is_deferred`] and re-drives
    /// injection from the state-reached path instead of blocking itself.
    pub fn wait_if_required(&self, source_type: MediaSourceType) {
        let mut state = self.state.lock();
        while state.flushing.contains(&source_type) && state.reached_state < state.target_state {
            self.cond.wait(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn does_not_wait_when_no_flush_is_set() {
        let controller = FlushOnPrerollController::new();
        controller.wait_if_required(MediaSourceType::Audio);
        // No deadlock here.
    }

    #[test]
    fn does_not_wait_before_preroll_started() {
        let controller = FlushOnPrerollController::new();
        controller.set_target_state(PipelineState::Playing);
        controller.set_flushing(MediaSourceType::Audio);
        controller.state_reached(PipelineState::Playing);
        controller.wait_if_required(MediaSourceType::Audio);
        // No deadlock here.
    }

    #[test]
    fn does_not_wait_after_reset() {
        let controller = FlushOnPrerollController::new();
        controller.set_target_state(PipelineState::Playing);
        controller.set_flushing(MediaSourceType::Audio);
        controller.state_reached(PipelineState::Paused);
        controller.reset();
        controller.wait_if_required(MediaSourceType::Audio);
        // No deadlock here.
    }

    #[test]
    fn does_not_wait_once_previous_procedure_finished() {
        let controller = FlushOnPrerollController::new();
        controller.set_target_state(PipelineState::Playing);
        controller.set_flushing(MediaSourceType::Audio);
        controller.state_reached(PipelineState::Paused);
        controller.state_reached(PipelineState::Playing);
        controller.wait_if_required(MediaSourceType::Audio);
        // No deadlock here.
    }

    #[test]
    fn other_sources_are_not_blocked_by_an_audio_flush() {
        let controller = FlushOnPrerollController::new();
        controller.set_target_state(PipelineState::Playing);
        controller.set_flushing(MediaSourceType::Audio);
        controller.state_reached(PipelineState::Paused);
        controller.wait_if_required(MediaSourceType::Video);
        // No deadlock here.
    }

    #[test]
    fn waits_until_the_target_state_is_reached() {
        let controller = Arc::new(FlushOnPrerollController::new());
        controller.set_target_state(PipelineState::Playing);
        controller.set_flushing(MediaSourceType::Audio);
        controller.state_reached(PipelineState::Paused);
        assert!(controller.is_deferred(MediaSourceType::Audio));

        let waiter = Arc::clone(&controller);
        let thread = thread::spawn(move || waiter.wait_if_required(MediaSourceType::Audio));

        thread::sleep(Duration::from_millis(20));
        controller.state_reached(PipelineState::Playing);
        thread.join().unwrap();
        assert!(!controller.is_deferred(MediaSourceType::Audio));
    }
}

//! Per-call completion controllers.
//!
//! Every call-with-reply hands the caller a [`CallController`]. The caller
//! blocks (or polls) on it until a typed response arrives, the controller is
//! failed with a textual reason, or the channel disconnects. Controllers can
//! be failed from any thread to cancel a call; a reply delivered after
//! cancellation is dropped.

use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Terminal outcome of one RPC call.
#[derive(Debug)]
pub enum CallResult {
    /// The handler replied; body bytes plus any descriptors passed with the
    /// response frame.
    Reply { body: Vec<u8>, fds: Vec<OwnedFd> },
    /// The handler (or a canceller) failed the call with a reason.
    Failed(String),
    /// The channel went away before a reply arrived.
    Disconnected,
}

#[derive(Debug, Default)]
struct State {
    outcome: Option<CallResult>,
    taken: bool,
}

/// Completion cell for one outstanding call. The first outcome wins; all
/// later completions are ignored.
#[derive(Debug, Default)]
pub struct CallController {
    state: Mutex<State>,
    cond: Condvar,
}

impl CallController {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn finish(&self, outcome: CallResult) {
        let mut state = self.state.lock();
        if state.outcome.is_none() && !state.taken {
            state.outcome = Some(outcome);
            self.cond.notify_all();
        }
    }

    /// Delivers the response from the channel's processing thread.
    pub(crate) fn complete(&self, reply: Result<(Vec<u8>, Vec<OwnedFd>), String>) {
        match reply {
            Ok((body, fds)) => self.finish(CallResult::Reply { body, fds }),
            Err(reason) => self.finish(CallResult::Failed(reason)),
        }
    }

    /// Marks the call disconnected; used when the channel goes away.
    pub(crate) fn disconnect(&self) {
        self.finish(CallResult::Disconnected);
    }

    /// Fails the call with a textual reason. Safe from any thread; a reply
    /// arriving afterwards is dropped.
    pub fn set_failed(&self, reason: &str) {
        self.finish(CallResult::Failed(reason.to_string()));
    }

    /// True once an outcome exists (or was already consumed).
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.outcome.is_some() || state.taken
    }

    /// Blocks until the call finishes and consumes the outcome.
    pub fn wait(&self) -> CallResult {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                state.taken = true;
                return outcome;
            }
            if state.taken {
                // The outcome was already consumed elsewhere; treat a second
                // wait as a lost race with disconnection.
                return CallResult::Disconnected;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Blocks up to `timeout`; `None` means the call is still in flight.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CallResult> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.outcome.take() {
                state.taken = true;
                return Some(outcome);
            }
            if state.taken {
                return Some(CallResult::Disconnected);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            if self.cond.wait_for(&mut state, deadline - now).timed_out() {
                if let Some(outcome) = state.outcome.take() {
                    state.taken = true;
                    return Some(outcome);
                }
                return None;
            }
        }
    }
}

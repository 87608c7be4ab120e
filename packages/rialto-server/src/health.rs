//! Healthcheck bookkeeping on the server-manager side of the control
//! channel.
//!
//! The server manager pings each session server on a fixed interval; a
//! session server acks once every session main thread has drained the ping.
//! This monitor only counts: consecutive missed acks up to a threshold
//! trigger the recovery observer. Process spawning and signalling live in
//! the manager executable, outside this crate.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use rialto_core::config::SessionServerState;

/// Notified when a session server stops answering pings.
pub trait RecoveryObserver: Send + Sync {
    fn on_recovery_needed(&self, failed_pings: u32);
}

#[derive(Debug)]
struct MonitorState {
    server_state: SessionServerState,
    outstanding_ping: Option<u32>,
    consecutive_failures: u32,
}

/// Tracks ping/ack pairs for one session server.
pub struct HealthMonitor {
    threshold: u32,
    state: Mutex<MonitorState>,
    observer: Arc<dyn RecoveryObserver>,
}

impl HealthMonitor {
    /// `threshold` is `num_of_failed_pings_before_recovery`.
    pub fn new(threshold: u32, observer: Arc<dyn RecoveryObserver>) -> Self {
        Self {
            threshold,
            state: Mutex::new(MonitorState {
                server_state: SessionServerState::Uninitialized,
                outstanding_ping: None,
                consecutive_failures: 0,
            }),
            observer,
        }
    }

    /// Records a state observed on the control channel. Entering `Error`
    /// triggers recovery immediately.
    pub fn state_changed(&self, server_state: SessionServerState) {
        let failures = {
            let mut state = self.state.lock();
            state.server_state = server_state;
            if server_state == SessionServerState::Error {
                state.consecutive_failures
            } else {
                return;
            }
        };
        warn!("session server entered error state");
        self.observer.on_recovery_needed(failures);
    }

    /// The most recently observed server state.
    pub fn server_state(&self) -> SessionServerState {
        self.state.lock().server_state
    }

    /// Called when a ping goes out. An unanswered previous ping counts as
    /// a failure; reaching the threshold triggers recovery.
    pub fn ping_sent(&self, id: u32) {
        let trigger = {
            let mut state = self.state.lock();
            if state.outstanding_ping.take().is_some() {
                state.consecutive_failures += 1;
                debug!(
                    failures = state.consecutive_failures,
                    "ping went unanswered"
                );
            }
            state.outstanding_ping = Some(id);
            (state.consecutive_failures >= self.threshold).then_some(state.consecutive_failures)
        };
        if let Some(failures) = trigger {
            warn!(failures, "ping failure threshold reached");
            self.observer.on_recovery_needed(failures);
        }
    }

    /// Called when an ack arrives. Acks for stale ping ids are ignored.
    pub fn ack_received(&self, id: u32) {
        let mut state = self.state.lock();
        if state.outstanding_ping == Some(id) {
            state.outstanding_ping = None;
            state.consecutive_failures = 0;
        } else {
            debug!(id, "stale ping ack ignored");
        }
    }

    /// Consecutive pings that have gone unanswered.
    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

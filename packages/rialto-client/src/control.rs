//! Session-server state observation and keepalive.
//!
//! The server manager holds a control channel to every session server it
//! launched: it watches `ApplicationStateChanged` events and sends the
//! periodic pings whose acks feed the health monitor.

use tracing::warn;

use rialto_core::config::SessionServerState;
use rialto_core::schema::{
    encode_body, ApplicationStateChangedEvent, EventId, MethodId, PingRequest, PingResponse,
};
use rialto_ipc::{ChannelHandle, SubscriptionId};

use crate::error::{ClientError, ClientResult};

/// Control-channel client for one session server.
pub struct ControlClient {
    channel: ChannelHandle,
    state_subscription: Option<SubscriptionId>,
}

impl ControlClient {
    #[must_use]
    pub fn new(channel: ChannelHandle) -> Self {
        Self {
            channel,
            state_subscription: None,
        }
    }

    /// Observes session-server state transitions. Replaces any previous
    /// observer.
    pub fn on_application_state<F>(&mut self, callback: F)
    where
        F: Fn(SessionServerState) + Send + Sync + 'static,
    {
        if let Some(subscription) = self.state_subscription.take() {
            self.channel
                .unsubscribe(EventId::ApplicationStateChanged.into(), subscription);
        }
        let subscription =
            self.channel
                .subscribe(EventId::ApplicationStateChanged.into(), move |body, _fds| {
                    match rialto_core::schema::decode_body::<ApplicationStateChangedEvent>(body) {
                        Ok(event) => callback(event.state),
                        Err(e) => warn!(error = %e, "malformed application-state event"),
                    }
                });
        self.state_subscription = Some(subscription);
    }

    /// Sends one healthcheck ping. The ack comes back only once every
    /// session's main thread has drained its queue.
    pub fn ping(&self, id: u32) -> ClientResult<()> {
        let payload = encode_body(&PingRequest { id })?;
        let (body, _fds) = self
            .channel
            .call_blocking(MethodId::Ping.into(), payload, Vec::new())?;
        let response: PingResponse = rialto_core::schema::decode_body(&body)?;
        if response.id != id {
            return Err(ClientError::Protocol(format!(
                "ping ack id {} does not match {id}",
                response.id
            )));
        }
        Ok(())
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        if let Some(subscription) = self.state_subscription.take() {
            self.channel
                .unsubscribe(EventId::ApplicationStateChanged.into(), subscription);
        }
    }
}

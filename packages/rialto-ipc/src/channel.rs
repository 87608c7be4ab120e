//! The client-side channel: one connected socket multiplexing RPC requests,
//! responses and subscribed events.
//!
//! The channel separates two roles. A [`Channel`] owns the epoll loop and is
//! driven by exactly one thread through `wait`/`process`. A cheap
//! [`ChannelHandle`] clone issues calls, fire-and-forget sends and event
//! subscriptions from any thread; completion callbacks always run on the
//! processing thread, never inside the send path.

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::controller::{CallController, CallResult};
use crate::error::{IpcError, IpcResult};
use crate::frame::{
    Frame, MessageKind, RequestEnvelope, ResponseEnvelope, FRAME_HEADER_LEN, MAX_BODY_BYTES,
};
use crate::socket::{RecvOutcome, SendOutcome, SeqPacketSocket};

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Identifies one event subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type EventHandler = Arc<dyn Fn(&[u8], Vec<OwnedFd>) + Send + Sync>;

struct OutboundFrame {
    bytes: Vec<u8>,
    fds: Vec<OwnedFd>,
}

struct ChannelShared {
    socket: SeqPacketSocket,
    connected: AtomicBool,
    serial: AtomicU32,
    pending: Mutex<HashMap<u32, Arc<CallController>>>,
    subscriptions: RwLock<HashMap<u32, Vec<(u64, EventHandler)>>>,
    next_subscription: AtomicU64,
    send_queue: Mutex<VecDeque<OutboundFrame>>,
    waker: Waker,
    dropped_events: AtomicU64,
}

impl ChannelShared {
    /// Queues (or directly sends) one encoded frame, preserving FIFO order
    /// with anything already queued.
    fn enqueue(&self, bytes: Vec<u8>, fds: Vec<OwnedFd>) -> IpcResult<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(IpcError::Disconnected);
        }
        let mut queue = self.send_queue.lock();
        if queue.is_empty() {
            let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
            match self.socket.send(&bytes, &raw_fds) {
                Ok(SendOutcome::Sent) => return Ok(()),
                Ok(SendOutcome::WouldBlock) => {}
                Err(e) => {
                    drop(queue);
                    self.disconnect();
                    return Err(IpcError::Io(e));
                }
            }
        }
        queue.push_back(OutboundFrame { bytes, fds });
        drop(queue);
        // Kick the processing thread so it picks up writable interest.
        let _ = self.waker.wake();
        Ok(())
    }

    /// Fails every pending call with "channel disconnected", exactly once.
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let drained: Vec<Arc<CallController>> =
                self.pending.lock().drain().map(|(_, c)| c).collect();
            for controller in drained {
                controller.disconnect();
            }
            self.send_queue.lock().clear();
            let _ = self.waker.wake();
        }
    }
}

/// Issues calls and manages subscriptions; clonable and thread-safe.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
}

impl ChannelHandle {
    /// Starts a call-with-reply and returns its controller.
    ///
    /// The caller blocks or polls on the controller; the channel's
    /// processing thread completes it when the correlated response frame
    /// arrives.
    pub fn call(
        &self,
        method_id: u32,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> IpcResult<Arc<CallController>> {
        let serial = self.shared.serial.fetch_add(1, Ordering::Relaxed);
        let envelope = RequestEnvelope { serial, payload };
        let body =
            bincode::serialize(&envelope).map_err(|e| IpcError::Protocol(e.to_string()))?;
        let frame = Frame::with_fds(MessageKind::Request, method_id, body, fds);
        let bytes = frame.encode()?;

        let controller = CallController::new();
        self.shared
            .pending
            .lock()
            .insert(serial, Arc::clone(&controller));

        if let Err(e) = self.shared.enqueue(bytes, frame.fds) {
            self.shared.pending.lock().remove(&serial);
            return Err(e);
        }
        Ok(controller)
    }

    /// Calls and blocks until the reply, a failure or disconnection.
    pub fn call_blocking(
        &self,
        method_id: u32,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> IpcResult<(Vec<u8>, Vec<OwnedFd>)> {
        match self.call(method_id, payload, fds)?.wait() {
            CallResult::Reply { body, fds } => Ok((body, fds)),
            CallResult::Failed(reason) => Err(IpcError::CallFailed(reason)),
            CallResult::Disconnected => Err(IpcError::Disconnected),
        }
    }

    /// As [`Self::call_blocking`] but gives up after `timeout`, failing the
    /// controller so a late reply is dropped.
    pub fn call_blocking_timeout(
        &self,
        method_id: u32,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
        timeout: Duration,
    ) -> IpcResult<(Vec<u8>, Vec<OwnedFd>)> {
        let controller = self.call(method_id, payload, fds)?;
        match controller.wait_timeout(timeout) {
            Some(CallResult::Reply { body, fds }) => Ok((body, fds)),
            Some(CallResult::Failed(reason)) => Err(IpcError::CallFailed(reason)),
            Some(CallResult::Disconnected) => Err(IpcError::Disconnected),
            None => {
                controller.set_failed("call timed out");
                Err(IpcError::CallFailed("call timed out".into()))
            }
        }
    }

    /// Best-effort one-way send; the only failure is a gone channel.
    pub fn send_no_reply(&self, method_id: u32, payload: Vec<u8>) -> IpcResult<()> {
        let envelope = RequestEnvelope {
            serial: 0,
            payload,
        };
        let body =
            bincode::serialize(&envelope).map_err(|e| IpcError::Protocol(e.to_string()))?;
        let bytes = Frame::new(MessageKind::Request, method_id, body).encode()?;
        self.shared.enqueue(bytes, Vec::new())
    }

    /// Subscribes to a typed event; the handler runs on the processing
    /// thread in arrival order.
    pub fn subscribe<F>(&self, event_id: u32, handler: F) -> SubscriptionId
    where
        F: Fn(&[u8], Vec<OwnedFd>) + Send + Sync + 'static,
    {
        let token = self.shared.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscriptions
            .write()
            .entry(event_id)
            .or_default()
            .push((token, Arc::new(handler)));
        SubscriptionId(token)
    }

    /// Removes a subscription previously added for `event_id`.
    pub fn unsubscribe(&self, event_id: u32, subscription: SubscriptionId) {
        if let Some(handlers) = self.shared.subscriptions.write().get_mut(&event_id) {
            handlers.retain(|(token, _)| *token != subscription.0);
        }
    }

    /// True while the underlying socket is usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Number of events that arrived with no subscription and were dropped.
    #[must_use]
    pub fn dropped_event_count(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Relaxed)
    }

    /// Tears the channel down, failing all pending calls.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }
}

/// The connection endpoint; exclusive owner of its socket and epoll fd.
pub struct Channel {
    shared: Arc<ChannelShared>,
    poll: Poll,
    events: Events,
    recv_buf: Vec<u8>,
    writable_interest: bool,
}

impl Channel {
    /// Connects to a session server's listening socket.
    pub fn connect(path: &Path) -> IpcResult<Self> {
        Self::from_socket(SeqPacketSocket::connect(path)?)
    }

    /// Wraps an already-connected socket (socketpair use-case).
    pub fn from_socket(socket: SeqPacketSocket) -> IpcResult<Self> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            SOCKET_TOKEN,
            Interest::READABLE,
        )?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            shared: Arc::new(ChannelShared {
                socket,
                connected: AtomicBool::new(true),
                serial: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                subscriptions: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                send_queue: Mutex::new(VecDeque::new()),
                waker,
                dropped_events: AtomicU64::new(0),
            }),
            poll,
            events: Events::with_capacity(16),
            recv_buf: vec![0u8; FRAME_HEADER_LEN + MAX_BODY_BYTES],
            writable_interest: false,
        })
    }

    /// A clonable handle for issuing calls from other threads.
    #[must_use]
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Blocks until the socket is ready, the waker fires, or the timeout
    /// elapses. `-1` waits forever. Returns true when work is available.
    pub fn wait(&mut self, timeout_ms: i32) -> bool {
        if !self.shared.connected.load(Ordering::Acquire) {
            return false;
        }
        let timeout = if timeout_ms < 0 {
            None
        } else {
            Some(Duration::from_millis(timeout_ms as u64))
        };
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => return !self.events.is_empty(),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "channel poll failed");
                    self.shared.disconnect();
                    return false;
                }
            }
        }
    }

    /// Drains ready work without blocking: flushes queued outbound frames
    /// and dispatches every fully-assembled inbound frame. Returns false
    /// once the connection is permanently closed.
    pub fn process(&mut self) -> bool {
        if !self.shared.connected.load(Ordering::Acquire) {
            return false;
        }

        self.flush_outbound();
        self.drain_inbound();
        self.update_interest();

        self.shared.connected.load(Ordering::Acquire)
    }

    fn flush_outbound(&mut self) {
        let mut queue = self.shared.send_queue.lock();
        while let Some(frame) = queue.front() {
            let raw_fds: Vec<RawFd> = frame.fds.iter().map(AsRawFd::as_raw_fd).collect();
            match self.shared.socket.send(&frame.bytes, &raw_fds) {
                Ok(SendOutcome::Sent) => {
                    queue.pop_front();
                }
                Ok(SendOutcome::WouldBlock) => break,
                Err(e) => {
                    debug!(error = %e, "send failed, closing channel");
                    drop(queue);
                    self.shared.disconnect();
                    return;
                }
            }
        }
    }

    fn drain_inbound(&mut self) {
        loop {
            match self.shared.socket.recv(&mut self.recv_buf) {
                Ok(RecvOutcome::Data { len, fds }) => {
                    let frame = match Frame::decode(&self.recv_buf[..len], fds) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "malformed frame, closing channel");
                            self.shared.disconnect();
                            return;
                        }
                    };
                    self.dispatch(frame);
                }
                Ok(RecvOutcome::WouldBlock) => return,
                Ok(RecvOutcome::Closed) => {
                    debug!("peer closed channel");
                    self.shared.disconnect();
                    return;
                }
                Ok(RecvOutcome::Truncated { .. }) => {
                    warn!("truncated frame, closing channel");
                    self.shared.disconnect();
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "recv failed, closing channel");
                    self.shared.disconnect();
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) {
        match frame.kind {
            MessageKind::Response => {
                let controller = self.shared.pending.lock().remove(&frame.method_or_serial);
                let Some(controller) = controller else {
                    // Cancelled or unknown serial; late replies are dropped.
                    debug!(serial = frame.method_or_serial, "reply with no waiter");
                    return;
                };
                match bincode::deserialize::<ResponseEnvelope>(&frame.body) {
                    Ok(envelope) => {
                        controller.complete(envelope.reply.map(|body| (body, frame.fds)));
                    }
                    Err(e) => {
                        warn!(error = %e, "malformed response envelope, closing channel");
                        controller.set_failed("malformed response");
                        self.shared.disconnect();
                    }
                }
            }
            MessageKind::Event => {
                let handlers: Vec<EventHandler> = self
                    .shared
                    .subscriptions
                    .read()
                    .get(&frame.method_or_serial)
                    .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                    .unwrap_or_default();
                if handlers.is_empty() {
                    self.shared.dropped_events.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let mut fds = Some(frame.fds);
                for handler in handlers {
                    // Only the first handler may take the descriptors.
                    handler(&frame.body, fds.take().unwrap_or_default());
                }
            }
            MessageKind::Request => {
                warn!(
                    method = frame.method_or_serial,
                    "unexpected request on client channel, closing"
                );
                self.shared.disconnect();
            }
        }
    }

    fn update_interest(&mut self) {
        let want_writable = !self.shared.send_queue.lock().is_empty();
        if want_writable == self.writable_interest {
            return;
        }
        let interest = if want_writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(e) = self.poll.registry().reregister(
            &mut SourceFd(&self.shared.socket.as_raw_fd()),
            SOCKET_TOKEN,
            interest,
        ) {
            warn!(error = %e, "reregister failed");
            return;
        }
        self.writable_interest = want_writable;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

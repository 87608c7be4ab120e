//! The server-side endpoint: listening sockets, connected clients and
//! request routing.
//!
//! A [`Server`] owns the epoll loop and is driven by one thread through
//! `wait`/`process`. Connected clients are represented by clonable
//! [`Client`] handles that outlive the processing loop's borrow - service
//! code holds them to push events and to answer requests asynchronously via
//! a [`Responder`].

use std::collections::{HashMap, VecDeque};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{IpcError, IpcResult};
use crate::frame::{
    Frame, MessageKind, RequestEnvelope, ResponseEnvelope, FRAME_HEADER_LEN, MAX_BODY_BYTES,
};
use crate::socket::{PeerCredentials, RecvOutcome, SendOutcome, SeqPacketSocket, SocketListener};

const WAKER_TOKEN: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 1;

/// Identifies one connected client for the lifetime of the server.
pub type ClientId = u64;

/// Routes fully-assembled request frames to service code.
///
/// Handlers run on the server's processing thread and must not block for
/// long; long-running work is enqueued on a session's main thread and the
/// [`Responder`] is completed from there.
pub trait RequestHandler: Send + Sync {
    fn handle_request(
        &self,
        client: &Client,
        method_id: u32,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
        responder: Responder,
    );
}

struct OutboundFrame {
    bytes: Vec<u8>,
    fds: Vec<OwnedFd>,
}

struct ConnectionShared {
    id: ClientId,
    socket: SeqPacketSocket,
    credentials: PeerCredentials,
    alive: AtomicBool,
    send_queue: Mutex<VecDeque<OutboundFrame>>,
    waker: Arc<Waker>,
}

impl ConnectionShared {
    fn enqueue(&self, bytes: Vec<u8>, fds: Vec<OwnedFd>) -> IpcResult<()> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(IpcError::Disconnected);
        }
        let mut queue = self.send_queue.lock();
        if queue.is_empty() {
            let raw_fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
            match self.socket.send(&bytes, &raw_fds) {
                Ok(SendOutcome::Sent) => return Ok(()),
                Ok(SendOutcome::WouldBlock) => {}
                Err(e) => {
                    self.alive.store(false, Ordering::Release);
                    return Err(IpcError::Io(e));
                }
            }
        }
        queue.push_back(OutboundFrame { bytes, fds });
        drop(queue);
        let _ = self.waker.wake();
        Ok(())
    }
}

/// The server's view of one connected client.
#[derive(Clone)]
pub struct Client {
    shared: Arc<ConnectionShared>,
}

impl Client {
    /// Server-lifetime unique id of this connection.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    /// The peer's `(pid, uid, gid)` captured on accept.
    #[must_use]
    pub fn credentials(&self) -> PeerCredentials {
        self.shared.credentials
    }

    /// True until the connection closes.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Sends a one-way event frame to this client.
    pub fn send_event(&self, event_id: u32, body: Vec<u8>) -> IpcResult<()> {
        let bytes = Frame::new(MessageKind::Event, event_id, body).encode()?;
        self.shared.enqueue(bytes, Vec::new())
    }

    /// Sends a one-way event frame carrying descriptors.
    pub fn send_event_with_fds(
        &self,
        event_id: u32,
        body: Vec<u8>,
        fds: Vec<OwnedFd>,
    ) -> IpcResult<()> {
        let frame = Frame::with_fds(MessageKind::Event, event_id, body, fds);
        let bytes = frame.encode()?;
        self.shared.enqueue(bytes, frame.fds)
    }
}

/// Completes one request, possibly from a different thread than the one
/// that received it. Consuming `self` enforces the single-reply contract.
pub struct Responder {
    connection: Arc<ConnectionShared>,
    serial: u32,
}

impl Responder {
    /// Serial 0 marks a call-without-reply; replying to it is a no-op.
    fn expects_reply(&self) -> bool {
        self.serial != 0
    }

    /// Sends the reply or the textual failure reason.
    pub fn reply(self, result: Result<Vec<u8>, String>) {
        self.reply_with_fds(result, Vec::new());
    }

    /// Sends a successful reply.
    pub fn ok(self, body: Vec<u8>) {
        self.reply(Ok(body));
    }

    /// Fails the call; the client observes `RpcCallFailed(reason)`.
    pub fn fail(self, reason: impl Into<String>) {
        self.reply(Err(reason.into()));
    }

    /// Sends the reply, attaching descriptors to the response frame.
    pub fn reply_with_fds(self, result: Result<Vec<u8>, String>, fds: Vec<OwnedFd>) {
        if !self.expects_reply() {
            return;
        }
        let envelope = ResponseEnvelope { reply: result };
        let body = match bincode::serialize(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode response envelope");
                return;
            }
        };
        let frame = Frame::with_fds(MessageKind::Response, self.serial, body, fds);
        match frame.encode() {
            Ok(bytes) => {
                if let Err(e) = self.connection.enqueue(bytes, frame.fds) {
                    debug!(error = %e, "reply to disconnected client dropped");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode response frame"),
        }
    }
}

struct Connection {
    shared: Arc<ConnectionShared>,
    writable_interest: bool,
}

type ClientCallback = Box<dyn Fn(&Client) + Send>;

/// The server endpoint. Safe under a single processor thread.
pub struct Server {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
    listeners: HashMap<Token, SocketListener>,
    connections: HashMap<Token, Connection>,
    next_token: usize,
    next_client_id: AtomicU64,
    handler: Option<Arc<dyn RequestHandler>>,
    on_connected: Option<ClientCallback>,
    on_disconnected: Option<ClientCallback>,
    recv_buf: Vec<u8>,
}

/// Requests server shutdown from any thread.
#[derive(Clone)]
pub struct ServerShutdown {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerShutdown {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
    }
}

impl Server {
    pub fn new() -> IpcResult<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(64),
            waker,
            running: Arc::new(AtomicBool::new(true)),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            next_client_id: AtomicU64::new(1),
            handler: None,
            on_connected: None,
            on_disconnected: None,
            recv_buf: vec![0u8; FRAME_HEADER_LEN + MAX_BODY_BYTES],
        })
    }

    /// Installs the request router. Must happen before clients connect.
    pub fn set_request_handler(&mut self, handler: Arc<dyn RequestHandler>) {
        self.handler = Some(handler);
    }

    /// Callback invoked for every newly-accepted client.
    pub fn set_client_connected<F: Fn(&Client) + Send + 'static>(&mut self, callback: F) {
        self.on_connected = Some(Box::new(callback));
    }

    /// Callback invoked when a client disconnects.
    pub fn set_client_disconnected<F: Fn(&Client) + Send + 'static>(&mut self, callback: F) {
        self.on_disconnected = Some(Box::new(callback));
    }

    /// A handle that can stop the processing loop from any thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ServerShutdown {
        ServerShutdown {
            running: Arc::clone(&self.running),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Adds a listening socket with the given `chmod`-style permissions.
    pub fn add_socket(&mut self, path: &Path, mode: u32) -> IpcResult<()> {
        let listener = SocketListener::bind(path, mode)?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            token,
            Interest::READABLE,
        )?;
        self.listeners.insert(token, listener);
        Ok(())
    }

    /// Adopts an already-paired socket without listening (socketpair
    /// use-case). The connected callback fires as for accepted clients.
    pub fn add_client(&mut self, socket: SeqPacketSocket) -> IpcResult<Client> {
        let client = self.install_connection(socket)?;
        if let Some(callback) = &self.on_connected {
            callback(&client);
        }
        Ok(client)
    }

    /// Blocks until any socket is ready or the timeout elapses. `-1` waits
    /// forever. Returns true when work is available.
    pub fn wait(&mut self, timeout_ms: i32) -> bool {
        if !self.running.load(Ordering::Acquire) {
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
                    warn!(error = %e, "server poll failed");
                    return false;
                }
            }
        }
    }

    /// Accepts pending connections, drains every ready socket and flushes
    /// queued outbound frames. Returns false once the server is shut down.
    pub fn process(&mut self) -> bool {
        self.accept_pending();

        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.service_connection(token);
        }

        self.running.load(Ordering::Acquire)
    }

    fn accept_pending(&mut self) {
        let listener_tokens: Vec<Token> = self.listeners.keys().copied().collect();
        for token in listener_tokens {
            loop {
                let accepted = match self.listeners.get(&token) {
                    Some(listener) => listener.accept(),
                    None => break,
                };
                match accepted {
                    Ok(Some(socket)) => match self.install_connection(socket) {
                        Ok(client) => {
                            if let Some(callback) = &self.on_connected {
                                callback(&client);
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to install connection"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        }
    }

    fn install_connection(&mut self, socket: SeqPacketSocket) -> IpcResult<Client> {
        let credentials = socket.peer_credentials()?;
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(
            &mut SourceFd(&socket.as_raw_fd()),
            token,
            Interest::READABLE,
        )?;

        let shared = Arc::new(ConnectionShared {
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            socket,
            credentials,
            alive: AtomicBool::new(true),
            send_queue: Mutex::new(VecDeque::new()),
            waker: Arc::clone(&self.waker),
        });
        debug!(
            client = shared.id,
            pid = credentials.pid,
            uid = credentials.uid,
            gid = credentials.gid,
            "client connected"
        );
        self.connections.insert(
            token,
            Connection {
                shared: Arc::clone(&shared),
                writable_interest: false,
            },
        );
        Ok(Client { shared })
    }

    fn service_connection(&mut self, token: Token) {
        let Some(connection) = self.connections.get(&token) else {
            return;
        };
        let shared = Arc::clone(&connection.shared);

        if !self.flush_connection(&shared) {
            self.close_connection(token);
            return;
        }
        if !self.drain_connection(&shared) {
            self.close_connection(token);
            return;
        }

        // Writable interest follows the queue: set while frames are stuck,
        // cleared once drained.
        let want_writable = !shared.send_queue.lock().is_empty();
        if let Some(connection) = self.connections.get_mut(&token) {
            if want_writable != connection.writable_interest {
                let interest = if want_writable {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                if self
                    .poll
                    .registry()
                    .reregister(&mut SourceFd(&shared.socket.as_raw_fd()), token, interest)
                    .is_ok()
                {
                    connection.writable_interest = want_writable;
                }
            }
        }
    }

    fn flush_connection(&mut self, shared: &Arc<ConnectionShared>) -> bool {
        let mut queue = shared.send_queue.lock();
        while let Some(frame) = queue.front() {
            let raw_fds: Vec<RawFd> = frame.fds.iter().map(AsRawFd::as_raw_fd).collect();
            match shared.socket.send(&frame.bytes, &raw_fds) {
                Ok(SendOutcome::Sent) => {
                    queue.pop_front();
                }
                Ok(SendOutcome::WouldBlock) => break,
                Err(e) => {
                    debug!(client = shared.id, error = %e, "send failed");
                    return false;
                }
            }
        }
        true
    }

    fn drain_connection(&mut self, shared: &Arc<ConnectionShared>) -> bool {
        loop {
            match shared.socket.recv(&mut self.recv_buf) {
                Ok(RecvOutcome::Data { len, fds }) => {
                    let frame = match Frame::decode(&self.recv_buf[..len], fds) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(client = shared.id, error = %e, "malformed frame");
                            return false;
                        }
                    };
                    if !self.dispatch(shared, frame) {
                        return false;
                    }
                }
                Ok(RecvOutcome::WouldBlock) => return true,
                Ok(RecvOutcome::Closed) => {
                    debug!(client = shared.id, "client closed connection");
                    return false;
                }
                Ok(RecvOutcome::Truncated { .. }) => {
                    warn!(client = shared.id, "truncated frame");
                    return false;
                }
                Err(e) => {
                    warn!(client = shared.id, error = %e, "recv failed");
                    return false;
                }
            }
        }
    }

    fn dispatch(&mut self, shared: &Arc<ConnectionShared>, frame: Frame) -> bool {
        if frame.kind != MessageKind::Request {
            warn!(
                client = shared.id,
                "unexpected non-request frame from client"
            );
            return false;
        }
        let envelope = match bincode::deserialize::<RequestEnvelope>(&frame.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(client = shared.id, error = %e, "malformed request envelope");
                return false;
            }
        };

        let Some(handler) = self.handler.clone() else {
            warn!(client = shared.id, "request received with no handler installed");
            return true;
        };
        let client = Client {
            shared: Arc::clone(shared),
        };
        let responder = Responder {
            connection: Arc::clone(shared),
            serial: envelope.serial,
        };
        handler.handle_request(
            &client,
            frame.method_or_serial,
            envelope.payload,
            frame.fds,
            responder,
        );
        true
    }

    fn close_connection(&mut self, token: Token) {
        if let Some(connection) = self.connections.remove(&token) {
            connection.shared.alive.store(false, Ordering::Release);
            let _ = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&connection.shared.socket.as_raw_fd()));
            if let Some(callback) = &self.on_disconnected {
                let client = Client {
                    shared: Arc::clone(&connection.shared),
                };
                callback(&client);
            }
        }
    }
}

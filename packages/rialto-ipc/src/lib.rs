//! Rialto IPC - the RPC and event fabric between clients and session servers.
//!
//! Messages are length-delimited frames over `SOCK_SEQPACKET` unix-domain
//! sockets. File descriptors ride along as `SCM_RIGHTS` ancillary data in the
//! same `sendmsg` call as the frame that references them. Both endpoints are
//! driven by a caller-owned loop over two operations:
//!
//! - `wait(timeout)` blocks on the underlying epoll fd until a socket is
//!   ready or the timeout elapses
//! - `process()` drains every ready socket without blocking, dispatching
//!   fully-assembled frames and flushing queued outbound frames
//!
//! The crate is transport only: message bodies are opaque byte strings. The
//! typed schema lives in `rialto-core` and the stubs in the client and server
//! crates.

#![warn(clippy::all)]

mod channel;
mod controller;
mod error;
mod frame;
mod server;
mod socket;

pub use channel::{Channel, ChannelHandle, SubscriptionId};
pub use controller::{CallController, CallResult};
pub use error::{IpcError, IpcResult};
pub use frame::{
    DecodeError, EncodeError, Frame, MessageKind, RequestEnvelope, ResponseEnvelope,
    FRAME_HEADER_LEN, MAX_BODY_BYTES, MAX_FDS_PER_FRAME,
};
pub use server::{Client, ClientId, Responder, RequestHandler, Server, ServerShutdown};
pub use socket::{
    set_socket_ownership, PeerCredentials, RecvOutcome, SendOutcome, SeqPacketSocket,
    SocketListener,
};

//! SEQPACKET unix-domain sockets with `SCM_RIGHTS` descriptor passing.
//!
//! All sockets are `SOCK_SEQPACKET | SOCK_CLOEXEC | SOCK_NONBLOCK`:
//! record boundaries keep frames self-delimiting and the non-blocking mode
//! lets one epoll loop drive many connections. This module is the only
//! place in the fabric that touches raw syscalls.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{
    accept4, bind, connect, getsockopt, listen, recvmsg, sendmsg, socket, socketpair, sockopt,
    AddressFamily, Backlog, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use nix::unistd::{chown, Group, User};

use crate::frame::MAX_FDS_PER_FRAME;

const LISTEN_BACKLOG: i32 = 64;

fn os_err(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Credentials of the peer process, captured via `SO_PEERCRED` on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Outcome of a non-blocking send.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// The whole datagram (and its ancillary fds) went out.
    Sent,
    /// The socket buffer is full; the caller queues the frame.
    WouldBlock,
}

/// Outcome of a non-blocking receive.
#[derive(Debug)]
pub enum RecvOutcome {
    /// One complete datagram with its ancillary descriptors.
    Data { len: usize, fds: Vec<OwnedFd> },
    /// Nothing ready.
    WouldBlock,
    /// The peer closed the connection.
    Closed,
    /// The datagram or its control data was truncated; protocol violation.
    /// Any descriptors that did arrive are surfaced so they get closed.
    Truncated { fds: Vec<OwnedFd> },
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // Safety: plain fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A connected SEQPACKET socket; exclusive owner of its descriptor.
#[derive(Debug)]
pub struct SeqPacketSocket {
    fd: OwnedFd,
}

impl SeqPacketSocket {
    /// Creates a connected pair, both ends non-blocking.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        )
        .map_err(os_err)?;
        Ok((Self { fd: a }, Self { fd: b }))
    }

    /// Connects to a listening socket at `path`.
    ///
    /// The connect itself is blocking; the socket is switched to
    /// non-blocking before it joins an event loop.
    pub fn connect(path: &Path) -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(os_err)?;
        let addr = UnixAddr::new(path).map_err(os_err)?;
        connect(fd.as_raw_fd(), &addr).map_err(os_err)?;
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    /// Adopts an already-connected descriptor (the socketpair use-case).
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self { fd })
    }

    /// Sends one datagram, attaching `fds` as `SCM_RIGHTS` ancillary data.
    pub fn send(&self, bytes: &[u8], fds: &[RawFd]) -> io::Result<SendOutcome> {
        let iov = [io::IoSlice::new(bytes)];
        let cmsgs: Vec<ControlMessage<'_>> = if fds.is_empty() {
            Vec::new()
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };
        loop {
            match sendmsg(
                self.fd.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::MSG_NOSIGNAL,
                None::<&UnixAddr>,
            ) {
                Ok(_) => return Ok(SendOutcome::Sent),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(SendOutcome::WouldBlock),
                Err(Errno::EPIPE | Errno::ECONNRESET) => {
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe))
                }
                Err(e) => return Err(os_err(e)),
            }
        }
    }

    /// Receives one datagram together with any passed descriptors.
    ///
    /// Received descriptors are installed `CLOEXEC` and returned as
    /// [`OwnedFd`], so an ignored outcome still closes them.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<RecvOutcome> {
        let mut iov = [io::IoSliceMut::new(buf)];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_FRAME]);
        let (len, flags, fds) = loop {
            match recvmsg::<UnixAddr>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            ) {
                Ok(msg) => {
                    let mut fds = Vec::new();
                    for cmsg in msg.cmsgs().map_err(os_err)? {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            for fd in received {
                                // Safety: SCM_RIGHTS installed a fresh
                                // descriptor that nothing else owns yet.
                                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                            }
                        }
                    }
                    break (msg.bytes, msg.flags, fds);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(RecvOutcome::WouldBlock),
                Err(Errno::ECONNRESET) => return Ok(RecvOutcome::Closed),
                Err(e) => return Err(os_err(e)),
            }
        };

        if flags.contains(MsgFlags::MSG_TRUNC) || flags.contains(MsgFlags::MSG_CTRUNC) {
            return Ok(RecvOutcome::Truncated { fds });
        }
        // A zero-length read on SEQPACKET means the peer is gone; the
        // protocol never sends bodiless datagrams.
        if len == 0 && fds.is_empty() {
            return Ok(RecvOutcome::Closed);
        }
        Ok(RecvOutcome::Data { len, fds })
    }

    /// Fetches the peer's `(pid, uid, gid)`.
    pub fn peer_credentials(&self) -> io::Result<PeerCredentials> {
        let creds = getsockopt(&self.fd, sockopt::PeerCredentials).map_err(os_err)?;
        Ok(PeerCredentials {
            pid: creds.pid(),
            uid: creds.uid(),
            gid: creds.gid(),
        })
    }
}

impl AsRawFd for SeqPacketSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// A listening session-management socket. Removes the filesystem entry on
/// drop.
#[derive(Debug)]
pub struct SocketListener {
    fd: OwnedFd,
    path: PathBuf,
}

impl SocketListener {
    /// Binds, applies `mode` permissions and listens.
    ///
    /// A stale socket file at `path` is removed first so a restarted server
    /// can reclaim its address.
    pub fn bind(path: &Path, mode: u32) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(os_err)?;
        let addr = UnixAddr::new(path).map_err(os_err)?;
        bind(fd.as_raw_fd(), &addr).map_err(os_err)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        listen(&fd, Backlog::new(LISTEN_BACKLOG).map_err(os_err)?).map_err(os_err)?;

        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Accepts one pending connection, or `None` when nothing is queued.
    pub fn accept(&self) -> io::Result<Option<SeqPacketSocket>> {
        loop {
            match accept4(
                self.fd.as_raw_fd(),
                SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            ) {
                Ok(fd) => {
                    // Safety: accept4 returned a brand-new descriptor.
                    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
                    return Ok(Some(SeqPacketSocket { fd }));
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return Ok(None),
                Err(e) => return Err(os_err(e)),
            }
        }
    }

    /// The filesystem path this listener is bound to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRawFd for SocketListener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Changes the owner and/or group of a session-management socket.
///
/// Names are resolved against the local user database. Failures propagate;
/// callers that can live without the change log and continue.
pub fn set_socket_ownership(
    path: &Path,
    owner: Option<&str>,
    group: Option<&str>,
) -> io::Result<()> {
    let uid = match owner {
        Some(name) => Some(
            User::from_name(name)
                .map_err(os_err)?
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no such user: {name}"))
                })?
                .uid,
        ),
        None => None,
    };
    let gid = match group {
        Some(name) => Some(
            Group::from_name(name)
                .map_err(os_err)?
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no such group: {name}"))
                })?
                .gid,
        ),
        None => None,
    };
    chown(path, uid, gid).map_err(os_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn pair_roundtrips_a_datagram() {
        let (a, b) = SeqPacketSocket::pair().unwrap();
        assert_eq!(a.send(b"ping", &[]).unwrap(), SendOutcome::Sent);

        let mut buf = [0u8; 16];
        match b.recv(&mut buf).unwrap() {
            RecvOutcome::Data { len, fds } => {
                assert_eq!(&buf[..len], b"ping");
                assert!(fds.is_empty());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn pair_passes_file_descriptors() {
        let (a, b) = SeqPacketSocket::pair().unwrap();
        let file = tempfile::tempfile().unwrap();
        a.send(b"fd", &[file.as_fd().as_raw_fd()]).unwrap();

        let mut buf = [0u8; 16];
        match b.recv(&mut buf).unwrap() {
            RecvOutcome::Data { len, fds } => {
                assert_eq!(&buf[..len], b"fd");
                assert_eq!(fds.len(), 1);
                assert!(fds[0].as_raw_fd() >= 0);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn recv_reports_closed_peer() {
        let (a, b) = SeqPacketSocket::pair().unwrap();
        drop(a);

        let mut buf = [0u8; 16];
        assert!(matches!(b.recv(&mut buf).unwrap(), RecvOutcome::Closed));
    }

    #[test]
    fn recv_would_block_when_empty() {
        let (_a, b) = SeqPacketSocket::pair().unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(b.recv(&mut buf).unwrap(), RecvOutcome::WouldBlock));
    }

    #[test]
    fn listener_accepts_connection_and_reports_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rialto-test.sock");
        let listener = SocketListener::bind(&path, 0o666).unwrap();

        let client = SeqPacketSocket::connect(&path).unwrap();
        let server_side = listener.accept().unwrap().expect("pending connection");

        let creds = server_side.peer_credentials().unwrap();
        assert_eq!(creds.pid, std::process::id() as i32);
        assert_eq!(creds.uid, nix::unistd::Uid::current().as_raw());

        client.send(b"hello", &[]).unwrap();
        let mut buf = [0u8; 16];
        match server_side.recv(&mut buf).unwrap() {
            RecvOutcome::Data { len, .. } => assert_eq!(&buf[..len], b"hello"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn listener_removes_socket_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ephemeral.sock");
        let listener = SocketListener::bind(&path, 0o660).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }
}

//! End-to-end tests for the RPC fabric: a real server and a real channel
//! talking over SEQPACKET sockets, each driven by its own thread.

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use rialto_ipc::{
    Channel, Client, Responder, RequestHandler, SeqPacketSocket, Server, ServerShutdown,
};

const METHOD_ECHO: u32 = 1;
const METHOD_FAIL: u32 = 2;
const METHOD_PASS_FD: u32 = 3;
const METHOD_COUNT_FDS: u32 = 4;
const EVENT_GREETING: u32 = 100;

struct EchoService;

impl RequestHandler for EchoService {
    fn handle_request(
        &self,
        _client: &Client,
        method_id: u32,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
        responder: Responder,
    ) {
        match method_id {
            METHOD_ECHO => responder.ok(payload.to_ascii_uppercase()),
            METHOD_FAIL => responder.fail("failed for some reason"),
            METHOD_PASS_FD => {
                let mut file = tempfile::tempfile().unwrap();
                file.write_all(b"hello from the server").unwrap();
                file.seek(SeekFrom::Start(0)).unwrap();
                responder.reply_with_fds(Ok(Vec::new()), vec![OwnedFd::from(file)]);
            }
            METHOD_COUNT_FDS => responder.ok(vec![fds.len() as u8]),
            other => responder.fail(format!("unknown method {other}")),
        }
    }
}

/// Spawns a server over one end of a socketpair and returns the client-side
/// channel plus a shutdown handle for teardown.
fn start_pair() -> (Channel, ServerShutdown, thread::JoinHandle<()>) {
    let (client_end, server_end) = SeqPacketSocket::pair().unwrap();

    let mut server = Server::new().unwrap();
    server.set_request_handler(Arc::new(EchoService));
    server.set_client_connected(|client| {
        client
            .send_event(EVENT_GREETING, b"welcome".to_vec())
            .unwrap();
    });
    server.add_client(server_end).unwrap();
    let shutdown = server.shutdown_handle();

    let server_thread = thread::spawn(move || {
        while server.process() {
            server.wait(50);
        }
    });

    let channel = Channel::from_socket(client_end).unwrap();
    (channel, shutdown, server_thread)
}

/// Drives a channel's wait/process loop on its own thread until it closes.
fn drive(mut channel: Channel, stop: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while channel.process() && !stop.load(Ordering::Acquire) {
            channel.wait(50);
        }
    })
}

#[test]
fn call_with_reply_roundtrips() {
    let (channel, shutdown, server_thread) = start_pair();
    let handle = channel.handle();
    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    let (body, fds) = handle
        .call_blocking(METHOD_ECHO, b"rialto".to_vec(), Vec::new())
        .unwrap();
    assert_eq!(body, b"RIALTO");
    assert!(fds.is_empty());

    stop.store(true, Ordering::Release);
    handle.disconnect();
    shutdown.shutdown();
    driver.join().unwrap();
    server_thread.join().unwrap();
}

#[test]
fn failed_call_carries_reason_text() {
    let (channel, shutdown, server_thread) = start_pair();
    let handle = channel.handle();
    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    let err = handle
        .call_blocking(METHOD_FAIL, Vec::new(), Vec::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "Call failed: failed for some reason");

    stop.store(true, Ordering::Release);
    handle.disconnect();
    shutdown.shutdown();
    driver.join().unwrap();
    server_thread.join().unwrap();
}

#[test]
fn descriptors_survive_the_response_path() {
    let (channel, shutdown, server_thread) = start_pair();
    let handle = channel.handle();
    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    let (_, mut fds) = handle
        .call_blocking(METHOD_PASS_FD, Vec::new(), Vec::new())
        .unwrap();
    assert_eq!(fds.len(), 1);

    let mut file = std::fs::File::from(fds.remove(0));
    let mut contents = String::new();
    file.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "hello from the server");

    stop.store(true, Ordering::Release);
    handle.disconnect();
    shutdown.shutdown();
    driver.join().unwrap();
    server_thread.join().unwrap();
}

#[test]
fn descriptors_travel_with_requests() {
    let (channel, shutdown, server_thread) = start_pair();
    let handle = channel.handle();
    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    let file = tempfile::tempfile().unwrap();
    let (body, _) = handle
        .call_blocking(METHOD_COUNT_FDS, Vec::new(), vec![OwnedFd::from(file)])
        .unwrap();
    assert_eq!(body, vec![1]);

    stop.store(true, Ordering::Release);
    handle.disconnect();
    shutdown.shutdown();
    driver.join().unwrap();
    server_thread.join().unwrap();
}

#[test]
fn subscribed_events_arrive_in_order() {
    let (client_end, server_end) = SeqPacketSocket::pair().unwrap();

    let mut server = Server::new().unwrap();
    server.set_request_handler(Arc::new(EchoService));
    let client = server.add_client(server_end).unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        while server.process() {
            server.wait(50);
        }
    });

    let channel = Channel::from_socket(client_end).unwrap();
    let handle = channel.handle();
    let (tx, rx) = mpsc::channel();
    handle.subscribe(EVENT_GREETING, move |body, _fds| {
        tx.send(body.to_vec()).unwrap();
    });

    for i in 0..3u8 {
        client.send_event(EVENT_GREETING, vec![i]).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    for i in 0..3u8 {
        let body = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(body, vec![i]);
    }

    stop.store(true, Ordering::Release);
    handle.disconnect();
    shutdown.shutdown();
    driver.join().unwrap();
    server_thread.join().unwrap();
}

#[test]
fn unsubscribed_events_are_counted_not_delivered() {
    let (client_end, server_end) = SeqPacketSocket::pair().unwrap();

    let mut server = Server::new().unwrap();
    server.set_request_handler(Arc::new(EchoService));
    let client = server.add_client(server_end).unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        while server.process() {
            server.wait(50);
        }
    });

    let channel = Channel::from_socket(client_end).unwrap();
    let handle = channel.handle();
    client.send_event(999, b"nobody listens".to_vec()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    // An echo call also acts as a barrier: once it returns, the earlier
    // event frame has been processed.
    handle
        .call_blocking(METHOD_ECHO, b"x".to_vec(), Vec::new())
        .unwrap();
    assert_eq!(handle.dropped_event_count(), 1);

    stop.store(true, Ordering::Release);
    handle.disconnect();
    shutdown.shutdown();
    driver.join().unwrap();
    server_thread.join().unwrap();
}

#[test]
fn server_disconnect_fails_pending_calls() {
    let (client_end, server_end) = SeqPacketSocket::pair().unwrap();
    let channel = Channel::from_socket(client_end).unwrap();
    let handle = channel.handle();

    let controller = handle.call(METHOD_ECHO, b"stranded".to_vec(), Vec::new()).unwrap();

    // No server ever processes the request; dropping the peer end closes
    // the connection and must drain the pending call.
    drop(server_end);
    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    match controller.wait() {
        rialto_ipc::CallResult::Disconnected => {}
        other => panic!("expected disconnection, got {other:?}"),
    }
    assert!(!handle.is_connected());

    stop.store(true, Ordering::Release);
    driver.join().unwrap();
}

#[test]
fn clients_connect_over_a_listening_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rialto-0");

    let mut server = Server::new().unwrap();
    server.set_request_handler(Arc::new(EchoService));
    let (connected_tx, connected_rx) = mpsc::channel();
    server.set_client_connected(move |client| {
        connected_tx.send(client.credentials()).unwrap();
    });
    server.add_socket(&path, 0o666).unwrap();
    let shutdown = server.shutdown_handle();
    let server_thread = thread::spawn(move || {
        while server.process() {
            server.wait(50);
        }
    });

    let channel = Channel::connect(&path).unwrap();
    let handle = channel.handle();
    let stop = Arc::new(AtomicBool::new(false));
    let driver = drive(channel, Arc::clone(&stop));

    let creds = connected_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(creds.pid, std::process::id() as i32);

    let (body, _) = handle
        .call_blocking(METHOD_ECHO, b"over the wire".to_vec(), Vec::new())
        .unwrap();
    assert_eq!(body, b"OVER THE WIRE");

    stop.store(true, Ordering::Release);
    handle.disconnect();
    shutdown.shutdown();
    driver.join().unwrap();
    server_thread.join().unwrap();
}

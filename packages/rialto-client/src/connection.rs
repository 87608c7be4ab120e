//! Connection management: one channel, one driving thread.
//!
//! The channel contract wants `wait`/`process` driven by a single thread
//! while calls come from wherever the application lives. The connection
//! owns that thread; everything else works through cheap channel handles.

use std::path::Path;
use std::thread::JoinHandle;

use tracing::debug;

use rialto_ipc::{Channel, ChannelHandle, SeqPacketSocket};

use crate::error::ClientResult;

/// A connected session-server channel plus its processing thread.
pub struct ClientConnection {
    handle: ChannelHandle,
    driver: Option<JoinHandle<()>>,
}

impl ClientConnection {
    /// Connects to a session server's listening socket.
    pub fn connect(path: &Path) -> ClientResult<Self> {
        Ok(Self::start(Channel::connect(path)?))
    }

    /// Adopts one end of a socketpair handed over by the server manager.
    pub fn from_socket(socket: SeqPacketSocket) -> ClientResult<Self> {
        Ok(Self::start(Channel::from_socket(socket)?))
    }

    fn start(mut channel: Channel) -> Self {
        let handle = channel.handle();
        let driver = std::thread::Builder::new()
            .name("rialto-client-ipc".into())
            .spawn(move || {
                while channel.process() {
                    channel.wait(-1);
                }
                debug!("client channel closed");
            })
            .expect("failed to spawn channel thread");
        Self {
            handle,
            driver: Some(driver),
        }
    }

    /// A clonable handle for stubs and subscriptions.
    #[must_use]
    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    /// True until the server goes away or `disconnect` is called.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Tears the connection down; pending calls fail with a
    /// channel-disconnected error exactly once.
    pub fn disconnect(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.handle.disconnect();
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.teardown();
    }
}

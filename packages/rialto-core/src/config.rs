//! Session-server and server-manager configuration types.
//!
//! These types cross the process boundary between the server manager and the
//! session servers it launches. File parsing and process spawning live in the
//! hosting executables; this module only defines the shared shapes, their
//! defaults and the socket-name resolution rules.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read permission bit for [`SocketPermissions`] fields.
pub const PERM_READ: u32 = 4;
/// Write permission bit for [`SocketPermissions`] fields.
pub const PERM_WRITE: u32 = 2;
/// Execute permission bit for [`SocketPermissions`] fields.
pub const PERM_EXECUTE: u32 = 1;

/// States of a session server as observed on the control channel.
///
/// A session server starts `Uninitialized` (loaded, waiting for
/// initialisation data), becomes `Inactive` (loaded but unable to stream AV)
/// or `Active` (able to stream AV), and is `NotRunning` when not loaded.
/// `Error` covers unrecoverable failures such as a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionServerState {
    Uninitialized,
    Inactive,
    Active,
    NotRunning,
    Error,
}

/// The maximum resource capabilities of the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxResourceCapabilities {
    pub max_playbacks: u32,
    pub max_web_audio_players: u32,
}

impl Default for MaxResourceCapabilities {
    fn default() -> Self {
        Self {
            max_playbacks: 2,
            max_web_audio_players: 1,
        }
    }
}

/// Configuration for one application served by a session server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Socket name the client should connect to.
    ///
    /// Resolved by [`resolve_socket_path`]: an empty string asks the server
    /// to allocate one, a bare name lands in the default directory, and an
    /// absolute path is used verbatim.
    pub client_ipc_socket_name: String,
    /// Display the client should render into.
    pub client_display_name: String,
}

/// Per-class permissions applied to a session-management socket.
///
/// Each field is the OR of [`PERM_READ`], [`PERM_WRITE`] and
/// [`PERM_EXECUTE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketPermissions {
    pub owner_permissions: u32,
    pub group_permissions: u32,
    pub other_permissions: u32,
}

impl Default for SocketPermissions {
    fn default() -> Self {
        Self {
            owner_permissions: PERM_READ | PERM_WRITE,
            group_permissions: PERM_READ | PERM_WRITE,
            other_permissions: PERM_READ | PERM_WRITE,
        }
    }
}

impl SocketPermissions {
    /// Collapses the three permission classes into a `chmod`-style mode.
    #[must_use]
    pub const fn mode(&self) -> u32 {
        (self.owner_permissions & 0o7) << 6
            | (self.group_permissions & 0o7) << 3
            | (self.other_permissions & 0o7)
    }
}

/// Configuration for the server manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerManagerConfig {
    /// `KEY=VALUE` environment entries passed to each session server.
    pub session_server_env_vars: Vec<String>,
    /// Number of session servers spawned ahead of demand.
    pub num_of_preloaded_servers: u32,
    /// Location of the session server binary.
    pub session_server_path: PathBuf,
    /// Custom session-server startup timeout; zero disables the timeout.
    pub session_server_startup_timeout: Duration,
    /// How often healthcheck pings are sent.
    pub healthcheck_interval: Duration,
    /// Permissions applied to the session-management socket.
    pub session_management_socket_permissions: SocketPermissions,
    /// Consecutive failed pings tolerated before recovery is triggered.
    pub num_of_failed_pings_before_recovery: u32,
}

impl Default for ServerManagerConfig {
    fn default() -> Self {
        Self {
            session_server_env_vars: Vec::new(),
            num_of_preloaded_servers: 0,
            session_server_path: PathBuf::from("/usr/bin/RialtoServer"),
            session_server_startup_timeout: Duration::ZERO,
            healthcheck_interval: Duration::from_secs(5),
            session_management_socket_permissions: SocketPermissions::default(),
            num_of_failed_pings_before_recovery: 3,
        }
    }
}

/// Resolves a client IPC socket name into a filesystem path.
///
/// - empty name: server-allocated under the default directory, derived from
///   `server_id` (e.g. `/tmp/rialto-12`)
/// - bare name: placed in the default directory (e.g. `/tmp/bar`)
/// - absolute path: used verbatim
#[must_use]
pub fn resolve_socket_path(name: &str, server_id: u32) -> PathBuf {
    if name.is_empty() {
        PathBuf::from(format!("/tmp/rialto-{server_id}"))
    } else if name.starts_with('/') {
        PathBuf::from(name)
    } else {
        PathBuf::from("/tmp").join(name)
    }
}

//! Socket transport for the host side of the context-hub bridge.
//!
//! [`client`] provides the auto-reconnecting client used by host programs;
//! [`server`] is the daemon-side listener that multiplexes up to four
//! clients onto the runtime.

use std::path::PathBuf;

pub mod client;
pub mod server;

pub use client::{
    ClientCallbacks, ClientConfig, Connection, Dialer, SocketClient, UnixConnection, UnixDialer,
};
pub use server::{ClientRegistry, ServerError, SocketServer, MAX_ACTIVE_CLIENTS};

/// Resolves a socket name to a filesystem path. `CTXHUB_SOCKET_DIR`
/// overrides the directory; the default is the system temp dir.
pub fn socket_path(name: &str) -> PathBuf {
    let dir = std::env::var_os("CTXHUB_SOCKET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    dir.join(format!("{name}.sock"))
}

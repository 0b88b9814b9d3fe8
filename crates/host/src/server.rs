//! Daemon-side socket server.
//!
//! Accepts up to [`MAX_ACTIVE_CLIENTS`] concurrent clients on a named local
//! socket, assigns each a 16-bit id, and hands every decoded message to the
//! daemon's callback. Each client gets a reader thread; sends and broadcasts
//! go through the shared registry under its mutex.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use ctxhub_wire::{self as wire, HubMessage};

/// Concurrent client limit, matching the daemon's expected load.
pub const MAX_ACTIVE_CLIENTS: usize = 4;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("another daemon is already serving {0}")]
    AlreadyRunning(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Callback invoked with each decoded client message.
pub type ClientMessageCallback = Arc<dyn Fn(u16, HubMessage) + Send + Sync>;

/// Shared map of connected clients, safe to use from any thread.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    inner: Arc<Mutex<HashMap<u16, UnixStream>>>,
}

impl ClientRegistry {
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Sends to one client; false when the client is gone or the write
    /// fails.
    pub fn send_to(&self, client_id: u16, message: &HubMessage) -> bool {
        let mut clients = self.lock();
        match clients.get_mut(&client_id) {
            Some(stream) => match wire::write_message(stream, message) {
                Ok(()) => true,
                Err(err) => {
                    warn!(client_id, %err, "failed to send to client");
                    false
                }
            },
            None => {
                warn!(client_id, "send to unknown client");
                false
            }
        }
    }

    /// Delivers to every connected client.
    pub fn broadcast(&self, message: &HubMessage) {
        let mut clients = self.lock();
        for (client_id, stream) in clients.iter_mut() {
            if let Err(err) = wire::write_message(stream, message) {
                warn!(client_id, %err, "failed to broadcast to client");
            }
        }
    }

    fn insert(&self, client_id: u16, stream: UnixStream) {
        self.lock().insert(client_id, stream);
    }

    fn remove(&self, client_id: u16) {
        self.lock().remove(&client_id);
    }

    fn shutdown_all(&self) {
        for stream in self.lock().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u16, UnixStream>> {
        self.inner.lock().expect("client registry poisoned")
    }
}

/// Listener plus per-client reader threads.
pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
    registry: ClientRegistry,
    shutdown: Arc<AtomicBool>,
    next_client_id: u16,
}

impl SocketServer {
    /// Binds the named socket, replacing a stale socket file but refusing to
    /// displace a live daemon.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, ServerError> {
        let path = path.into();
        if UnixStream::connect(&path).is_ok() {
            return Err(ServerError::AlreadyRunning(path));
        }
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        Ok(Self {
            listener,
            path,
            registry: ClientRegistry::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            next_client_id: 1,
        })
    }

    pub fn registry(&self) -> ClientRegistry {
        self.registry.clone()
    }

    /// Flag observed by the accept loop; typically wired to SIGINT/SIGTERM.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Accept loop; returns once the shutdown flag is set, after closing
    /// every client and removing the socket file.
    pub fn run(mut self, on_message: ClientMessageCallback) -> Result<(), ServerError> {
        self.listener.set_nonblocking(true)?;
        info!(path = %self.path.display(), "host socket server listening");

        let mut handlers: Vec<JoinHandle<()>> = Vec::new();
        while !self.shutdown.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Some(handle) = self.accept_client(stream, &on_message) {
                        handlers.push(handle);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    break;
                }
            }
            handlers.retain(|handle| !handle.is_finished());
        }

        info!("host socket server shutting down");
        self.registry.shutdown_all();
        for handle in handlers {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.path);
        Ok(())
    }

    fn accept_client(
        &mut self,
        stream: UnixStream,
        on_message: &ClientMessageCallback,
    ) -> Option<JoinHandle<()>> {
        if self.registry.client_count() >= MAX_ACTIVE_CLIENTS {
            warn!("rejecting connection, client limit reached");
            let _ = stream.shutdown(Shutdown::Both);
            return None;
        }
        if let Err(err) = stream.set_nonblocking(false) {
            error!(%err, "could not configure client socket");
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id = match self.next_client_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };

        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                error!(%err, "could not clone client socket");
                return None;
            }
        };
        self.registry.insert(client_id, writer);
        info!(client_id, "client connected");

        let registry = self.registry.clone();
        let on_message = Arc::clone(on_message);
        thread::Builder::new()
            .name(format!("ctxhub-client-{client_id}"))
            .spawn(move || {
                let mut stream = stream;
                loop {
                    match wire::read_message(&mut stream) {
                        Ok(Some(message)) => on_message(client_id, message),
                        Ok(None) => break,
                        Err(err) => {
                            debug!(client_id, %err, "client read error");
                            break;
                        }
                    }
                }
                registry.remove(client_id);
                info!(client_id, "client disconnected");
            })
            .ok()
    }
}

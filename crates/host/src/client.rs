//! Auto-reconnecting socket client.
//!
//! A single receive thread owns the connection for its whole lifetime:
//! it reads framed messages, and on a broken connection walks the reconnect
//! backoff (500 ms doubling, capped at 5 minutes, bounded attempts) until it
//! finds the daemon again or gives up. The backoff wait is interruptible by
//! `disconnect()` through a condition variable.

use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use ctxhub_wire::{self as wire, HubMessage, WireError};

/// One framed-message connection to the daemon.
pub trait Connection: Send + 'static {
    /// Blocks for the next message; `Ok(None)` means the remote closed.
    fn read_message(&mut self) -> Result<Option<HubMessage>, WireError>;

    fn write_message(&mut self, message: &HubMessage) -> Result<(), WireError>;

    /// Breaks a blocked `read_message` on another clone of this connection.
    fn shutdown(&self);

    fn try_clone(&self) -> io::Result<Self>
    where
        Self: Sized;
}

/// Produces connections; called again for every reconnect attempt.
pub trait Dialer: Send + 'static {
    type Conn: Connection;

    fn dial(&mut self) -> io::Result<Self::Conn>;
}

/// Observer interface for the receive thread.
pub trait ClientCallbacks: Send + Sync + 'static {
    fn on_message_received(&self, message: HubMessage);

    /// The remote side closed the connection (not a local `disconnect`).
    fn on_socket_disconnected_by_remote(&self) {}

    /// A reconnect attempt succeeded; called once per successful reconnect.
    fn on_socket_reconnected(&self) {}

    /// Automatic reconnection gave up.
    fn on_reconnect_aborted(&self) {}
}

/// Reconnect policy knobs; the defaults match the daemon deployment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5 * 60),
            max_retries: 40,
        }
    }
}

pub(crate) struct Backoff {
    delay: Duration,
    max_delay: Duration,
    retries_left: u32,
}

impl Backoff {
    pub(crate) fn new(config: &ClientConfig) -> Self {
        Self {
            delay: config.initial_backoff,
            max_delay: config.max_backoff,
            retries_left: config.max_retries,
        }
    }

    /// The wait before the next attempt; `None` once attempts run out.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        let current = self.delay;
        self.delay = (self.delay * 2).min(self.max_delay);
        Some(current)
    }
}

struct ClientShared<C: Connection> {
    graceful_shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
    writer: Mutex<Option<C>>,
}

impl<C: Connection> ClientShared<C> {
    fn is_graceful(&self) -> bool {
        *self.graceful_shutdown.lock().expect("shutdown flag poisoned")
    }

    /// Waits out a backoff delay; returns true if shutdown was requested.
    fn wait_shutdown(&self, delay: Duration) -> bool {
        let guard = self.graceful_shutdown.lock().expect("shutdown flag poisoned");
        let (guard, _) = self
            .shutdown_cv
            .wait_timeout_while(guard, delay, |graceful| !*graceful)
            .expect("shutdown flag poisoned");
        *guard
    }
}

/// Client half of the host bridge.
pub struct SocketClient<D: Dialer> {
    shared: Arc<ClientShared<D::Conn>>,
    rx_thread: Option<JoinHandle<()>>,
}

impl<D: Dialer> SocketClient<D> {
    /// Dials once and starts the receive thread. The initial connection
    /// failing is an error; later drops go through the reconnect policy when
    /// `reconnect_automatically` is set.
    pub fn connect(
        mut dialer: D,
        config: ClientConfig,
        reconnect_automatically: bool,
        callbacks: Arc<dyn ClientCallbacks>,
    ) -> io::Result<Self> {
        let conn = dialer.dial()?;
        let writer = conn.try_clone()?;
        let shared = Arc::new(ClientShared {
            graceful_shutdown: Mutex::new(false),
            shutdown_cv: Condvar::new(),
            writer: Mutex::new(Some(writer)),
        });

        let rx_shared = Arc::clone(&shared);
        let rx_thread = thread::Builder::new()
            .name("ctxhub-host-rx".into())
            .spawn(move || {
                receive_loop(
                    rx_shared,
                    dialer,
                    conn,
                    config,
                    reconnect_automatically,
                    callbacks,
                )
            })?;

        Ok(Self {
            shared,
            rx_thread: Some(rx_thread),
        })
    }

    /// Sends one framed message. Fails without retry when there is no live
    /// socket or the write errors.
    pub fn send_message(&self, message: &HubMessage) -> bool {
        let mut writer = self.shared.writer.lock().expect("writer poisoned");
        match writer.as_mut() {
            None => {
                warn!("tried sending a message without a valid socket handle");
                false
            }
            Some(conn) => match conn.write_message(message) {
                Ok(()) => true,
                Err(WireError::Io(err)) if err.kind() == io::ErrorKind::WriteZero => {
                    warn!("failed to send message, remote side disconnected");
                    false
                }
                Err(err) => {
                    error!(%err, "failed to send message");
                    false
                }
            },
        }
    }

    /// Requests a graceful shutdown and joins the receive thread. Must not
    /// be called from a receive-thread callback.
    pub fn disconnect(&mut self) {
        let Some(handle) = self.rx_thread.take() else {
            return;
        };
        if thread::current().id() == handle.thread().id() {
            error!("disconnect() can't be called from a receive thread callback");
            self.rx_thread = Some(handle);
            return;
        }

        {
            let mut graceful = self
                .shared
                .graceful_shutdown
                .lock()
                .expect("shutdown flag poisoned");
            *graceful = true;
        }
        self.shared.shutdown_cv.notify_all();
        if let Some(conn) = self.shared.writer.lock().expect("writer poisoned").as_ref() {
            conn.shutdown();
        }
        debug!("waiting for receive thread to exit");
        let _ = handle.join();
    }
}

impl<D: Dialer> Drop for SocketClient<D> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn receive_loop<D: Dialer>(
    shared: Arc<ClientShared<D::Conn>>,
    mut dialer: D,
    mut conn: D::Conn,
    config: ClientConfig,
    reconnect_automatically: bool,
    callbacks: Arc<dyn ClientCallbacks>,
) {
    debug!("receive thread started");
    loop {
        while !shared.is_graceful() {
            match conn.read_message() {
                Ok(Some(message)) => callbacks.on_message_received(message),
                Ok(None) => {
                    if !shared.is_graceful() {
                        info!("socket disconnected on remote end");
                        callbacks.on_socket_disconnected_by_remote();
                    }
                    break;
                }
                Err(err) => {
                    if !shared.is_graceful() {
                        error!(%err, "exiting receive loop");
                    }
                    break;
                }
            }
        }

        *shared.writer.lock().expect("writer poisoned") = None;
        if shared.is_graceful() || !reconnect_automatically {
            break;
        }

        match reconnect(&shared, &mut dialer, &config) {
            Some(new_conn) => match new_conn.try_clone() {
                Ok(writer) => {
                    *shared.writer.lock().expect("writer poisoned") = Some(writer);
                    conn = new_conn;
                    callbacks.on_socket_reconnected();
                }
                Err(err) => {
                    error!(%err, "could not clone reconnected socket");
                    callbacks.on_reconnect_aborted();
                    break;
                }
            },
            None => {
                if !shared.is_graceful() {
                    callbacks.on_reconnect_aborted();
                }
                break;
            }
        }
    }
    debug!("exiting receive thread");
}

fn reconnect<D: Dialer>(
    shared: &ClientShared<D::Conn>,
    dialer: &mut D,
    config: &ClientConfig,
) -> Option<D::Conn> {
    let mut backoff = Backoff::new(config);
    while let Some(delay) = backoff.next_delay() {
        if shared.wait_shutdown(delay) {
            return None;
        }
        match dialer.dial() {
            Ok(conn) => {
                debug!("successfully reconnected");
                return Some(conn);
            }
            Err(err) => {
                warn!(%err, delay_ms = delay.as_millis() as u64, "failed to reconnect");
            }
        }
    }
    None
}

/// [`Connection`] over a Unix stream socket.
pub struct UnixConnection {
    stream: UnixStream,
}

impl Connection for UnixConnection {
    fn read_message(&mut self) -> Result<Option<HubMessage>, WireError> {
        wire::read_message(&mut self.stream)
    }

    fn write_message(&mut self, message: &HubMessage) -> Result<(), WireError> {
        wire::write_message(&mut self.stream, message)
    }

    fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            stream: self.stream.try_clone()?,
        })
    }
}

/// Dials the daemon's named local socket.
pub struct UnixDialer {
    path: PathBuf,
}

impl UnixDialer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Dialer for a socket name resolved via [`crate::socket_path`].
    pub fn for_socket_name(name: &str) -> Self {
        Self::new(crate::socket_path(name))
    }
}

impl Dialer for UnixDialer {
    type Conn = UnixConnection;

    fn dial(&mut self) -> io::Result<UnixConnection> {
        UnixStream::connect(&self.path).map(|stream| UnixConnection { stream })
    }
}

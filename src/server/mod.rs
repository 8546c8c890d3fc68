//! The server loop.
//!
//! One worker thread owns the [`mio::Poll`], the listener and every
//! connection. It accepts, reads, writes and dispatches callbacks; nothing
//! else touches connection state. Other threads reach it through a
//! [`ServerInterface`], whose requests travel over a channel and wake the
//! poll through a [`mio::Waker`].

mod connection;
mod handler;
mod interface;
mod listener;
mod socket;
#[cfg(feature = "tls")]
mod tls_config;

pub use handler::{MessageHandler, Peer};
pub use interface::ServerInterface;

use crate::config::ServerConfig;
use crate::error::Error;
use connection::{Connection, FlushStatus};
use interface::ControlRequest;
use listener::Listener;
use socket::{PlainSocket, Socket};

use ::config::Config;
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, instrument, trace, warn};

// Reserved tokens; connection ids start above them
const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(1);
const CONNECTION_ID_RANGE_START: usize = 1000;

/// Lifecycle of a started server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// The worker thread is serving connections.
    Running,
    /// `stop()` has been requested; the worker is closing connections.
    Stopping,
    /// The worker thread has exited.
    Stopped,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Running,
            1 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

/// A configured, not yet started server.
///
/// # Example
///
/// ```no_run
/// use wsserver::{Peer, Server, ServerConfig};
///
/// let config = ServerConfig {
///     port: 9000,
///     ..ServerConfig::default()
/// };
/// let server = Server::new(config, |peer: &mut Peer, payload: &[u8]| {
///     peer.send(payload);
/// })?;
/// let handle = server.start()?;
/// handle.broadcast("hello everyone");
/// handle.stop();
/// # Ok::<(), wsserver::Error>(())
/// ```
pub struct Server<H: MessageHandler> {
    config: ServerConfig,
    handler: H,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

// ============================================================================
// Constructors
// ============================================================================

impl<H: MessageHandler> Server<H> {
    /// Creates a server, loading TLS material if `use_tls` is set.
    ///
    /// Nothing is bound until [`Self::start`].
    pub fn new(config: ServerConfig, handler: H) -> Result<Self, Error> {
        #[cfg(feature = "tls")]
        let tls = tls_config::server_tls_config(&config)?;

        #[cfg(not(feature = "tls"))]
        if config.use_tls {
            return Err(Error::TlsUnsupported);
        }

        Ok(Self {
            config,
            handler,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    /// Creates a server from un-namespaced configuration keys.
    ///
    /// See [`ServerConfig`] for the keys.
    pub fn from_config(config: &Config, handler: H) -> Result<Self, Error> {
        Self::new(ServerConfig::from_config(config)?, handler)
    }

    /// Creates a server from configuration keys under the `name.` namespace,
    /// falling back to un-namespaced keys.
    pub fn from_config_named(config: &Config, name: &str, handler: H) -> Result<Self, Error> {
        Self::new(ServerConfig::from_config_named(config, name)?, handler)
    }

    /// Binds the listener and spawns the worker thread.
    ///
    /// Bind failures are returned here; there is no retry.
    #[instrument(skip(self), fields(bind_address = %self.config.bind_address, port = self.config.port))]
    pub fn start(self) -> Result<ServerHandle, Error> {
        let addr = resolve(&self.config.bind_address, self.config.port)?;
        let mut listener = Listener::bind(addr)?;
        let local_addr = listener.local_addr();

        let poll = Poll::new()?;
        poll.registry()
            .register(listener.source(), LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (sender, receiver) = channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let state = Arc::new(AtomicU8::new(ServerState::Running as u8));

        let event_loop = EventLoop {
            poll,
            listener,
            connections: HashMap::new(),
            next_id: CONNECTION_ID_RANGE_START,
            receiver,
            stop_flag: stop_flag.clone(),
            state: state.clone(),
            config: Arc::new(self.config),
            handler: self.handler,
            #[cfg(feature = "tls")]
            tls: self.tls,
        };

        let thread = thread::Builder::new()
            .name(format!("wsserver-{}", local_addr.port()))
            .spawn(move || event_loop.run())?;

        Ok(ServerHandle {
            interface: ServerInterface {
                sender,
                waker,
                worker: thread.thread().id(),
            },
            stop_flag,
            state,
            local_addr,
            thread: Some(thread),
        })
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, Error> {
    (host, port)
        .to_socket_addrs()
        .map_err(|_| Error::InvalidAddress(format!("{host}:{port}")))?
        .next()
        .ok_or_else(|| Error::InvalidAddress(format!("{host}:{port}")))
}

// ============================================================================
// Server Handle
// ============================================================================

/// Owner of a running server. Dropping it stops the server.
pub struct ServerHandle {
    interface: ServerInterface,
    stop_flag: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The address the listener is bound to, with the real port when port 0
    /// was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// A cloneable handle for other threads.
    pub fn interface(&self) -> ServerInterface {
        self.interface.clone()
    }

    /// Queues `message` as a frame to every open connection.
    pub fn broadcast(&self, message: impl Into<Vec<u8>>) {
        self.interface.broadcast(message)
    }

    /// Closes every connection and waits for the worker thread to exit.
    /// The listener and the wakeup channel are released with it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == thread::current().id() {
            // Dropped inside a callback; the loop exits after this event batch
            warn!(local_addr = %self.local_addr, "Server handle dropped on its own worker thread");
            self.stop_flag.store(true, Ordering::SeqCst);
            return;
        }
        info!(local_addr = %self.local_addr, "Stopping server");
        let _ = self.state.compare_exchange(
            ServerState::Running as u8,
            ServerState::Stopping as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.stop_flag.store(true, Ordering::SeqCst);
        self.interface.stop();
        if thread.join().is_err() {
            error!(local_addr = %self.local_addr, "Server worker thread panicked");
        }
        self.state
            .store(ServerState::Stopped as u8, Ordering::SeqCst);
        info!(local_addr = %self.local_addr, "Server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Event Loop
// ============================================================================

// Internal data type for read_connection
enum ReadConnectionResult {
    Open,
    Closed,
}

struct EventLoop<H: MessageHandler> {
    poll: Poll,
    listener: Listener,
    connections: HashMap<usize, Connection>,
    next_id: usize,
    receiver: Receiver<ControlRequest>,
    stop_flag: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
    config: Arc<ServerConfig>,
    handler: H,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl<H: MessageHandler> EventLoop<H> {
    fn run(mut self) {
        info!(local_addr = %self.listener.local_addr(), path = %self.config.path, "Server loop running");
        let mut events = Events::with_capacity(self.config.poll_capacity);

        while !self.stop_flag.load(Ordering::SeqCst) {
            if let Err(err) = self.poll.poll(&mut events, None) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, "Poll failed, shutting down server loop");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {
                        if self.process_control_requests() {
                            self.close_all_connections();
                            break;
                        }
                    }
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(id) => self.connection_event(id, event),
                }
            }
        }

        self.close_all_connections();
        if let Err(err) = self.poll.registry().deregister(self.listener.source()) {
            warn!(?err, "Failed to deregister listener");
        }
        info!(local_addr = %self.listener.local_addr(), "Closed listener");
        self.state
            .store(ServerState::Stopped as u8, Ordering::SeqCst);
    }

    // Returns true once a stop has been requested.
    fn process_control_requests(&mut self) -> bool {
        let requests: Vec<ControlRequest> = self.receiver.try_iter().collect();

        for request in requests {
            match request {
                ControlRequest::Broadcast { data } => self.broadcast(&data),
                ControlRequest::SendTo { id, data } => match self.connections.get_mut(&id) {
                    Some(conn) if conn.is_open() => conn.queue_send(&data),
                    _ => debug!(id, "Connection not open when sending"),
                },
                ControlRequest::Close { id } => match self.connections.get_mut(&id) {
                    Some(conn) => conn.close_gracefully(),
                    None => debug!(id, "Connection not found when closing"),
                },
                ControlRequest::OpenConnections { response } => {
                    let ids = self
                        .connections
                        .values()
                        .filter(|conn| conn.is_open())
                        .map(Connection::id)
                        .collect();
                    if response.send(ids).is_err() {
                        debug!("Open connections requester went away");
                    }
                }
                ControlRequest::Stop => {
                    info!("Stop requested");
                    self.stop_flag.store(true, Ordering::SeqCst);
                    return true;
                }
            }
        }

        // Pick up queues that just gained data
        let ids: Vec<usize> = self.connections.keys().copied().collect();
        for id in ids {
            self.flush_connection(id);
        }
        false
    }

    #[instrument(skip(self, payload), fields(len = payload.len()))]
    fn broadcast(&mut self, payload: &[u8]) {
        let mut count = 0;
        for conn in self.connections.values_mut().filter(|conn| conn.is_open()) {
            conn.queue_send(payload);
            count += 1;
        }
        debug!(count, "Broadcast queued");
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.add_connection(stream, peer_addr),
                Err(err) => match err.kind() {
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, local_addr = %self.listener.local_addr(), "Error accepting connection");
                        break;
                    }
                },
            }
        }
    }

    fn add_connection(&mut self, stream: TcpStream, peer_addr: SocketAddr) {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(?err, %peer_addr, "Failed to set TCP_NODELAY");
        }

        let Some(socket) = self.wrap_socket(stream, peer_addr) else {
            return;
        };

        let id = self.next_id;
        let mut conn = match Connection::new(id, socket, peer_addr, self.config.clone()) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(?err, %peer_addr, "Dropping accepted connection");
                return;
            }
        };

        let interest = conn.interest;
        if let Err(err) = self
            .poll
            .registry()
            .register(conn.source(), Token(id), interest)
        {
            error!(?err, %peer_addr, "Failed to register connection");
            return;
        }

        info!(id, %peer_addr, local_addr = %conn.local_addr(), secure = conn.is_secure(), "Accepted connection");
        self.connections.insert(id, conn);
        self.advance_connection_id();
    }

    // Wraps an accepted stream for TLS when configured. A stream that cannot
    // be wrapped is dropped, which closes it.
    fn wrap_socket(&self, stream: TcpStream, peer_addr: SocketAddr) -> Option<Box<dyn Socket>> {
        #[cfg(feature = "tls")]
        if let Some(tls) = &self.tls {
            return match socket::TlsSocket::new(stream, tls.clone()) {
                Ok(socket) => Some(Box::new(socket)),
                Err(err) => {
                    warn!(?err, %peer_addr, "TLS setup failed, closing connection");
                    None
                }
            };
        }

        trace!(%peer_addr, "Plain connection");
        Some(Box::new(PlainSocket::new(stream)))
    }

    fn connection_event(&mut self, id: usize, event: &Event) {
        if !self.connections.contains_key(&id) {
            trace!(id, "Event for removed connection");
            return;
        }

        if event.is_readable() || event.is_priority() {
            if let ReadConnectionResult::Closed = self.read_connection(id) {
                self.remove_connection(id);
                return;
            }
        } else if event.is_read_closed() || event.is_error() {
            debug!(id, read_closed = event.is_read_closed(), error = event.is_error(), "Hangup");
            self.remove_connection(id);
            return;
        }

        // Writes are attempted whenever something is queued, not only on a
        // writable edge, so data queued by a read is not left waiting.
        self.flush_connection(id);
    }

    #[instrument(skip(self))]
    fn read_connection(&mut self, id: usize) -> ReadConnectionResult {
        let Some(conn) = self.connections.get_mut(&id) else {
            return ReadConnectionResult::Closed;
        };
        let peer_addr = conn.peer_addr();
        let mut buf = vec![0u8; self.config.read_chunk_size];

        loop {
            match conn.read(&mut buf) {
                Ok(0) => {
                    info!(id, %peer_addr, "Connection closed by peer");
                    return ReadConnectionResult::Closed;
                }
                Ok(sz) => {
                    trace!(id, len = sz, %peer_addr, "Read data from socket");
                    conn.data_received(&buf[..sz], &mut self.handler);
                    if conn.is_closing() {
                        return ReadConnectionResult::Closed;
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    return ReadConnectionResult::Open;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    if err.kind() == ErrorKind::BrokenPipe {
                        warn!(id, %peer_addr, "Broken pipe");
                    } else if err.kind() == ErrorKind::ConnectionReset {
                        warn!(id, %peer_addr, "Connection reset");
                    } else {
                        error!(id, %peer_addr, ?err, "Error reading from socket");
                    }
                    return ReadConnectionResult::Closed;
                }
            }
        }
    }

    fn flush_connection(&mut self, id: usize) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_closing() {
            self.remove_connection(id);
            return;
        }

        match conn.flush() {
            Ok(FlushStatus::Drained) | Ok(FlushStatus::Pending) => {}
            Ok(FlushStatus::Close) => {
                debug!(id, "Reached close sentinel");
                self.remove_connection(id);
                return;
            }
            Err(err) => {
                if err.kind() == ErrorKind::BrokenPipe {
                    warn!(id, peer_addr = %conn.peer_addr(), "Broken pipe");
                } else if err.kind() == ErrorKind::ConnectionReset {
                    warn!(id, peer_addr = %conn.peer_addr(), "Connection reset");
                } else {
                    error!(id, peer_addr = %conn.peer_addr(), ?err, "Error writing to socket");
                }
                self.remove_connection(id);
                return;
            }
        }

        // Update our registration, if necessary
        let interest = conn.desired_interest();
        if interest != conn.interest {
            match self
                .poll
                .registry()
                .reregister(conn.source(), Token(id), interest)
            {
                Ok(()) => conn.interest = interest,
                Err(err) => {
                    error!(id, ?err, "Failed to reregister connection");
                    self.remove_connection(id);
                }
            }
        }
    }

    fn remove_connection(&mut self, id: usize) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        if let Err(err) = self.poll.registry().deregister(conn.source()) {
            warn!(id, ?err, "Failed to deregister connection");
        }
        conn.close();
        info!(id, peer_addr = %conn.peer_addr(), "Closed connection");
        if conn.is_handshaken() {
            self.handler.connection_closed(id);
        }
    }

    fn close_all_connections(&mut self) {
        let ids: Vec<usize> = self.connections.keys().copied().collect();
        for id in ids {
            self.remove_connection(id);
        }
    }

    fn advance_connection_id(&mut self) {
        loop {
            self.next_id = self
                .next_id
                .checked_add(1)
                .unwrap_or(CONNECTION_ID_RANGE_START);
            if !self.connections.contains_key(&self.next_id) {
                break;
            }
        }
    }
}

//! Emerald Server dengan completion-driven I/O
//!
//! One driver thread per listening server owns the mio `Poll`, the listener
//! and every accepted socket. It turns readiness into completions:
//! - accept: drain `accept()` until `WouldBlock`, one pooled descriptor per
//!   admitted connection
//! - receive: each successful read is one `data_received` notification
//! - send: each fully written buffer is one `data_sent` notification
//!
//! Because only the driver touches a connection's socket and descriptor, at
//! most one operation per descriptor is ever in flight.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, instrument, warn};

use super::connection::{ConnectionHandle, ConnectionId, ConnectionState, Registry};
use super::event::ServerHandler;
use super::mailbox::Mailbox;
use super::socket;
use super::transfer::{self, FlushStatus, Outbound, ReceiveStatus, READ_BUDGET};
use crate::config::ServerConfig;
use crate::core::{resolve, DescriptorPool};
use crate::error::{Error, Result};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION_ID: usize = 2;

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Work submitted to the driver from other threads
pub(crate) enum ServerCommand {
    Send { id: ConnectionId, data: Vec<u8> },
    Disconnect { id: ConnectionId },
    Stop,
}

/// Lifecycle of the listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Listening,
    Stopped,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Created,
            1 => ServerState::Bound,
            2 => ServerState::Listening,
            _ => ServerState::Stopped,
        }
    }
}

/// Move `state` from `from` to `to`; on mismatch returns the actual state
fn transition(
    state: &AtomicU8,
    from: ServerState,
    to: ServerState,
) -> std::result::Result<(), ServerState> {
    state
        .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
        .map(drop)
        .map_err(ServerState::from_u8)
}

struct Running {
    local_addr: SocketAddr,
    control: Mailbox<ServerCommand>,
    driver: Option<JoinHandle<()>>,
}

struct ServerInner {
    id: u64,
    config: ServerConfig,
    pool: DescriptorPool,
    registry: Registry,
    state: AtomicU8,
    running: Mutex<Option<Running>>,
}

/// Listening TCP server.
///
/// Cheap to clone; clones share the same listener. Once `listen` succeeds
/// the server keeps running until `stop()` is called, even if every
/// caller-side clone is dropped.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Server accepting at most `max_connections` simultaneous peers
    pub fn new(max_connections: usize) -> Self {
        Self::with_config(ServerConfig::new(max_connections))
    }

    /// Membuat server dari config. Allocates the descriptor pool up front.
    pub fn with_config(config: ServerConfig) -> Self {
        let pool = DescriptorPool::new(config.max_connections, config.buffer_size);
        Self {
            inner: Arc::new(ServerInner {
                id: NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed),
                config,
                pool,
                registry: Registry::default(),
                state: AtomicU8::new(ServerState::Created as u8),
                running: Mutex::new(None),
            }),
        }
    }

    /// Bind the configured host (default `localhost`) on `port` and start
    /// accepting. Returns the bound address; port 0 picks an ephemeral port.
    ///
    /// Returns immediately. Use `wait()` to block until the server stops.
    pub fn listen<H: ServerHandler>(&self, port: u16, handler: H) -> Result<SocketAddr> {
        let host = self.inner.config.host.clone();
        self.listen_on(&host, port, handler)
    }

    /// Like `listen`, on an explicit host.
    ///
    /// # Errors
    /// `Error::InvalidState` if the server already listened (or was
    /// stopped), `Error::Resolve` / `Error::Io` for setup failures.
    #[instrument(skip(self, handler), fields(server = self.inner.id))]
    pub fn listen_on<H: ServerHandler>(&self, host: &str, port: u16, handler: H) -> Result<SocketAddr> {
        if self.inner.config.buffer_size == 0 {
            return Err(Error::invalid_argument("buffer_size must be greater than zero"));
        }

        // Held for the whole startup so a concurrent stop() sees a consistent state
        let mut running = self.lock_running();

        if let Err(actual) = transition(&self.inner.state, ServerState::Created, ServerState::Bound) {
            return Err(Error::invalid_state(format!(
                "listen requires a fresh server, state is {:?}",
                actual
            )));
        }

        match self.start(host, port, handler) {
            Ok(started) => {
                let local_addr = started.local_addr;
                *running = Some(started);
                // The driver may already have failed and written Stopped
                if let Err(actual) =
                    transition(&self.inner.state, ServerState::Bound, ServerState::Listening)
                {
                    debug!(state = ?actual, "Server left Bound before listen returned");
                }
                Ok(local_addr)
            }
            Err(e) => {
                // Nothing was spawned, so the server can try again
                let _ = transition(&self.inner.state, ServerState::Bound, ServerState::Created);
                Err(e)
            }
        }
    }

    fn start<H: ServerHandler>(&self, host: &str, port: u16, handler: H) -> Result<Running> {
        let config = &self.inner.config;
        let endpoint = resolve(host, port)?;

        let std_listener =
            StdTcpListener::bind(endpoint).map_err(|e| Error::io("binding listener", e))?;
        socket::set_backlog(&std_listener, config.max_queued_accepts)
            .map_err(|e| Error::io("setting listen backlog", e))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| Error::io("configuring listener", e))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|e| Error::io("reading listener address", e))?;

        let mut listener = TcpListener::from_std(std_listener);
        let poll = Poll::new().map_err(|e| Error::io("creating poll", e))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|e| Error::io("registering listener", e))?;

        let (mailbox, commands) = Mailbox::new(poll.registry(), WAKER)?;

        let driver = Driver {
            server: self.clone(),
            handler,
            poll,
            listener: Some(listener),
            local_addr,
            commands,
            mailbox: mailbox.clone(),
            connections: HashMap::new(),
            readable: Vec::new(),
            next_id: FIRST_CONNECTION_ID,
        };

        let handle = thread::Builder::new()
            .name(format!("emerald-server-{}", self.inner.id))
            .spawn(move || driver.run())
            .map_err(|e| Error::io("spawning server driver", e))?;

        info!(%local_addr, backlog = config.max_queued_accepts, "Server bound");

        Ok(Running {
            local_addr,
            control: mailbox,
            driver: Some(handle),
        })
    }

    /// Queue `data` for `connection`.
    ///
    /// Each connection has its own outbound queue, so concurrent sends to
    /// different connections never share a buffer.
    pub fn send(&self, connection: &ConnectionHandle, data: impl Into<Vec<u8>>) -> Result<()> {
        if connection.server_id() != self.inner.id {
            return Err(Error::invalid_argument(format!(
                "connection {} belongs to another server",
                connection.id()
            )));
        }
        connection.send(data)
    }

    /// Close every connection and the listener. Idempotent.
    ///
    /// A server stopped before `listen` can never listen.
    pub fn stop(&self) {
        let running = self.lock_running();

        match self.state() {
            ServerState::Created => {
                self.inner
                    .state
                    .store(ServerState::Stopped as u8, Ordering::Release);
            }
            ServerState::Bound | ServerState::Listening => {
                if let Some(running) = running.as_ref() {
                    // Already stopping if the driver is gone
                    let _ = running.control.post(ServerCommand::Stop);
                }
            }
            ServerState::Stopped => {}
        }
    }

    /// Block until the driver thread exits.
    ///
    /// Returns immediately if the server never listened. Calling it from a
    /// handler callback is an `Error::InvalidState`.
    pub fn wait(&self) -> Result<()> {
        let driver = {
            let mut running = self.lock_running();
            match running.as_mut() {
                Some(running) => {
                    let on_driver = running
                        .driver
                        .as_ref()
                        .is_some_and(|h| h.thread().id() == thread::current().id());
                    if on_driver {
                        return Err(Error::invalid_state("wait() called from the driver thread"));
                    }
                    running.driver.take()
                }
                None => None,
            }
        };

        if let Some(driver) = driver {
            driver
                .join()
                .map_err(|_| Error::invalid_state("server driver panicked"))?;
        }
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_running().as_ref().map(|r| r.local_addr)
    }

    /// Live connections, in accept order
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.inner.registry.snapshot()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.registry.get(id)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

struct Driver<H> {
    server: Server,
    handler: H,
    poll: Poll,
    listener: Option<TcpListener>,
    local_addr: SocketAddr,
    commands: Receiver<ServerCommand>,
    // Cloned into every ConnectionHandle
    mailbox: Mailbox<ServerCommand>,
    connections: HashMap<Token, ConnectionState>,
    // Still readable after their read budget ran out
    readable: Vec<Token>,
    next_id: usize,
}

impl<H: ServerHandler> Driver<H> {
    fn run(mut self) {
        info!(local_addr = %self.local_addr, "Server listening");
        self.handler.on_listening(&self.server, self.local_addr);

        let mut events = Events::with_capacity(self.server.inner.config.events_capacity.max(1));

        'poll: loop {
            // Connections cut off by the read budget must not wait for a new edge
            let timeout = if self.readable.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(err = ?e, "Poll failed, stopping server");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {
                        if self.drain_commands() {
                            break 'poll;
                        }
                    }
                    token => self.connection_ready(token, event),
                }
            }

            self.resume_reads();
        }

        self.shutdown();
    }

    /// Accept loop. Runs until the listener would block; the next readable
    /// event on the listener re-arms it.
    fn accept(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };

            match listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    warn!(err = ?e, "Transient accept error");
                }
                Err(e) => {
                    error!(err = ?e, "Error accepting connection");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        let Some(descriptor) = self.server.inner.pool.acquire() else {
            warn!(%peer, "Descriptor pool exhausted, rejecting connection");
            drop(stream);
            self.handler.on_connection_rejected(&self.server, peer);
            return;
        };

        let id = ConnectionId(self.next_id);
        let probe = match self.prepare(&mut stream, id.token()) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(%peer, err = ?e, "Failed to set up accepted socket");
                if let Err(e) = self.server.inner.pool.release(descriptor) {
                    error!(err = %e, "Descriptor release failed");
                }
                return;
            }
        };
        self.advance_id();

        let handle = ConnectionHandle::new(id, self.server.inner.id, peer, probe, self.mailbox.clone());
        self.server.inner.registry.insert(handle.clone());
        self.connections.insert(
            id.token(),
            ConnectionState {
                stream,
                descriptor,
                handle: handle.clone(),
                outbound: Outbound::default(),
                interest: Interest::READABLE,
            },
        );

        info!(id = %id, %peer, "Client connected");
        self.handler.on_client_connected(&self.server, &handle);
    }

    fn prepare(&self, stream: &mut TcpStream, token: Token) -> io::Result<StdTcpStream> {
        let config = &self.server.inner.config;
        socket::tune(stream, config.nodelay, config.socket_buffer_size)?;
        let probe = socket::duplicate(stream)?;
        self.poll
            .registry()
            .register(stream, token, Interest::READABLE)?;
        Ok(probe)
    }

    fn connection_ready(&mut self, token: Token, event: &Event) {
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.receive(token);
        }
        if event.is_writable() {
            self.flush(token);
        }
    }

    /// Receive completion(s) for one connection, at most `READ_BUDGET` reads
    fn receive(&mut self, token: Token) {
        let Driver {
            server,
            handler,
            connections,
            ..
        } = self;
        let Some(state) = connections.get_mut(&token) else {
            return;
        };
        let handle = state.handle.clone();
        let status = transfer::receive(
            &mut state.stream,
            &mut state.descriptor,
            READ_BUDGET,
            |data| {
                debug!(id = %handle.id(), len = data.len(), "Data received");
                handler.on_data_received(server, &handle, data);
            },
        );

        match status {
            ReceiveStatus::Open | ReceiveStatus::Pending if handle.is_closed() => {
                self.dispose(token, "closed locally")
            }
            ReceiveStatus::Open => {}
            ReceiveStatus::Pending => {
                if !self.readable.contains(&token) {
                    self.readable.push(token);
                }
            }
            ReceiveStatus::Closed(None) => self.dispose(token, "peer closed"),
            ReceiveStatus::Closed(Some(e)) => {
                warn!(id = %handle.id(), err = ?e, "Receive failed");
                self.dispose(token, "socket error");
            }
        }
    }

    /// One more budgeted round for connections that still had data
    fn resume_reads(&mut self) {
        for token in std::mem::take(&mut self.readable) {
            self.receive(token);
        }
    }

    /// Send completion(s) for one connection
    fn flush(&mut self, token: Token) {
        let mut completed = Vec::new();
        let (result, handle) = {
            let Some(state) = self.connections.get_mut(&token) else {
                return;
            };
            let result = state.outbound.flush(&mut state.stream, &mut completed);
            (result, state.handle.clone())
        };

        for transferred in completed {
            debug!(id = %handle.id(), len = transferred, "Data sent");
            self.handler.on_data_sent(&self.server, &handle, transferred);
        }

        match result {
            Ok(status) => self.update_interest(token, status),
            Err(e) => {
                warn!(id = %handle.id(), err = ?e, "Send failed");
                self.dispose(token, "socket error");
            }
        }
    }

    fn update_interest(&mut self, token: Token, status: FlushStatus) {
        let Some(state) = self.connections.get_mut(&token) else {
            return;
        };

        let wanted = match status {
            FlushStatus::Blocked => Interest::READABLE | Interest::WRITABLE,
            FlushStatus::Drained => Interest::READABLE,
        };
        if state.interest == wanted {
            return;
        }

        match self.poll.registry().reregister(&mut state.stream, token, wanted) {
            Ok(()) => state.interest = wanted,
            Err(e) => {
                warn!(id = %state.handle.id(), err = ?e, "Failed to reregister connection");
                self.dispose(token, "socket error");
            }
        }
    }

    /// Returns `true` when the driver should stop
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                ServerCommand::Send { id, data } => {
                    let token = id.token();
                    match self.connections.get_mut(&token) {
                        Some(state) => state.outbound.push(data),
                        None => {
                            debug!(id = %id, len = data.len(), "Dropping send to closed connection");
                            continue;
                        }
                    }
                    self.flush(token);
                }
                ServerCommand::Disconnect { id } => self.dispose(id.token(), "closed locally"),
                ServerCommand::Stop => return true,
            }
        }
        false
    }

    /// Disconnect cleanup: socket shutdown, registry removal, descriptor
    /// back to the pool, then the notification. No-op for unknown tokens,
    /// so a connection is disposed at most once.
    fn dispose(&mut self, token: Token, reason: &'static str) {
        let Some(mut state) = self.connections.remove(&token) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut state.stream) {
            debug!(err = ?e, "Deregister failed");
        }
        state.handle.mark_closed();
        state.handle.shutdown_socket();

        let id = state.handle.id();
        let inner = &self.server.inner;
        if let Err(e) = inner.registry.retire(id, state.descriptor, &inner.pool) {
            error!(id = %id, err = %e, "Descriptor release failed");
        }

        let pending = state.outbound.pending();
        if pending > 0 {
            debug!(id = %id, pending, "Discarding unsent data");
        }

        info!(id = %id, peer = %state.handle.remote_address(), reason, "Client disconnected");
        self.handler.on_client_disconnected(&self.server, &state.handle);
    }

    fn shutdown(&mut self) {
        let mut tokens: Vec<Token> = self.connections.keys().copied().collect();
        tokens.sort_unstable_by_key(|t| t.0);
        for token in tokens {
            self.dispose(token, "server stopped");
        }

        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = self.poll.registry().deregister(&mut listener) {
                debug!(err = ?e, "Deregister listener failed");
            }
        }

        self.server
            .inner
            .state
            .store(ServerState::Stopped as u8, Ordering::Release);
        info!(local_addr = %self.local_addr, "Server stopped");
        self.handler.on_stopped(&self.server);
    }

    fn advance_id(&mut self) {
        loop {
            self.next_id = self
                .next_id
                .checked_add(1)
                .unwrap_or(FIRST_CONNECTION_ID);
            if !self.connections.contains_key(&Token(self.next_id)) {
                break;
            }
        }
    }
}

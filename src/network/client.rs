//! Emerald Client: satu outbound socket per session
//!
//! Mirrors the server's connection half. Each `connect` starts a session
//! with its own driver thread, a dedicated receive descriptor (not pooled)
//! and a single outbound queue. The session ends on peer close, socket
//! failure or `stop()`, always with exactly one `disconnected` (or
//! `connect_failed`) notification.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, error, info, instrument, warn};

use super::event::ClientHandler;
use super::mailbox::Mailbox;
use super::socket;
use super::transfer::{self, FlushStatus, Outbound, ReceiveStatus, READ_BUDGET};
use crate::config::ClientConfig;
use crate::core::{resolve, Descriptor};
use crate::error::{Error, Result};

const STREAM: Token = Token(0);
const WAKER: Token = Token(1);

pub(crate) enum ClientCommand {
    Send(Vec<u8>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Idle,
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            _ => ClientState::Disconnected,
        }
    }
}

struct Session {
    remote_address: SocketAddr,
    probe: StdTcpStream,
    control: Mailbox<ClientCommand>,
    stopping: bool,
    driver: Option<JoinHandle<()>>,
}

struct ClientInner {
    config: ClientConfig,
    state: AtomicU8,
    session: Mutex<Option<Session>>,
}

/// Outbound TCP client. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                state: AtomicU8::new(ClientState::Idle as u8),
                session: Mutex::new(None),
            }),
        }
    }

    /// Start connecting to `host:port`.
    ///
    /// Resolution and socket setup errors are returned here; the connect
    /// completion itself is reported through `handler`. Allowed while idle
    /// or after the previous session ended.
    #[instrument(skip(self, handler))]
    pub fn connect<H: ClientHandler>(&self, host: &str, port: u16, handler: H) -> Result<()> {
        if self.inner.config.buffer_size == 0 {
            return Err(Error::invalid_argument("buffer_size must be greater than zero"));
        }

        let mut session = self.lock_session();

        let previous = self.state();
        if !matches!(previous, ClientState::Idle | ClientState::Disconnected) {
            return Err(Error::invalid_state(format!(
                "connect requires an idle client, state is {:?}",
                previous
            )));
        }

        // The previous driver may still be inside its final callback, which
        // can lock the session; detach it instead of joining under the lock.
        drop(session.take());

        self.set_state(ClientState::Connecting);
        match self.open(host, port, handler) {
            Ok(opened) => {
                *session = Some(opened);
                Ok(())
            }
            Err(e) => {
                self.set_state(previous);
                Err(e)
            }
        }
    }

    fn open<H: ClientHandler>(&self, host: &str, port: u16, handler: H) -> Result<Session> {
        let endpoint = resolve(host, port)?;

        let mut stream = TcpStream::connect(endpoint).map_err(|e| Error::io("connecting", e))?;
        let probe = socket::duplicate(&stream).map_err(|e| Error::io("duplicating socket", e))?;

        let poll = Poll::new().map_err(|e| Error::io("creating poll", e))?;
        let interest = Interest::READABLE | Interest::WRITABLE;
        poll.registry()
            .register(&mut stream, STREAM, interest)
            .map_err(|e| Error::io("registering socket", e))?;
        let (mailbox, commands) = Mailbox::new(poll.registry(), WAKER)?;

        let driver = ClientDriver {
            client: self.clone(),
            handler,
            poll,
            stream,
            remote_address: endpoint,
            descriptor: Descriptor::detached(self.inner.config.buffer_size),
            outbound: Outbound::default(),
            commands,
            interest,
            connected: false,
            read_pending: false,
            finished: false,
        };

        let handle = thread::Builder::new()
            .name("emerald-client".to_string())
            .spawn(move || driver.run())
            .map_err(|e| Error::io("spawning client driver", e))?;

        debug!(remote = %endpoint, "Connect issued");
        Ok(Session {
            remote_address: endpoint,
            probe,
            control: mailbox,
            stopping: false,
            driver: Some(handle),
        })
    }

    /// Queue `data` for the remote host.
    ///
    /// Nothing is sent and `Error::NotConnected` is returned when the
    /// client is not connected.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        if self.state() != ClientState::Connected {
            debug!("Send ignored, client not connected");
            return Err(Error::NotConnected);
        }

        let session = self.lock_session();
        match session.as_ref() {
            Some(s) if !s.stopping && socket::is_alive(&s.probe) => {
                s.control.post(ClientCommand::Send(data.into()))
            }
            _ => {
                debug!("Send ignored, connection is going away");
                Err(Error::NotConnected)
            }
        }
    }

    /// Shut down both directions of the socket. Idempotent.
    ///
    /// The session then ends with `disconnected` (or `connect_failed` if the
    /// connect had not completed).
    pub fn stop(&self) {
        let mut session = self.lock_session();
        let Some(s) = session.as_mut() else {
            return;
        };
        if s.stopping || !matches!(self.state(), ClientState::Connecting | ClientState::Connected) {
            return;
        }

        s.stopping = true;
        info!(remote = %s.remote_address, "Stopping client");
        socket::shutdown(&s.probe);
        let _ = s.control.post(ClientCommand::Stop);
    }

    /// Block until the current session's driver exits.
    ///
    /// Calling it from a handler callback is an `Error::InvalidState`.
    pub fn wait(&self) -> Result<()> {
        let driver = {
            let mut session = self.lock_session();
            match session.as_mut() {
                Some(s) => {
                    let on_driver = s
                        .driver
                        .as_ref()
                        .is_some_and(|h| h.thread().id() == thread::current().id());
                    if on_driver {
                        return Err(Error::invalid_state("wait() called from the driver thread"));
                    }
                    s.driver.take()
                }
                None => None,
            }
        };

        if let Some(driver) = driver {
            driver
                .join()
                .map_err(|_| Error::invalid_state("client driver panicked"))?;
        }
        Ok(())
    }

    /// Connected and the socket passes the liveness check
    pub fn is_connected(&self) -> bool {
        if self.state() != ClientState::Connected {
            return false;
        }
        self.lock_session()
            .as_ref()
            .is_some_and(|s| !s.stopping && socket::is_alive(&s.probe))
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.lock_session().as_ref().map(|s| s.remote_address)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    fn set_state(&self, state: ClientState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.state())
            .finish()
    }
}

struct ClientDriver<H> {
    client: Client,
    handler: H,
    poll: Poll,
    stream: TcpStream,
    remote_address: SocketAddr,
    descriptor: Descriptor,
    outbound: Outbound,
    commands: Receiver<ClientCommand>,
    interest: Interest,
    connected: bool,
    // Read budget ran out with data possibly left in the socket
    read_pending: bool,
    finished: bool,
}

impl<H: ClientHandler> ClientDriver<H> {
    fn run(mut self) {
        let mut events = Events::with_capacity(self.client.inner.config.events_capacity.max(2));

        while !self.finished {
            let timeout = if self.read_pending {
                Some(Duration::ZERO)
            } else {
                None
            };
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(err = ?e, "Poll failed, closing client");
                self.finish("poll failure", Some(e));
                break;
            }

            for event in events.iter() {
                if self.finished {
                    break;
                }
                match event.token() {
                    WAKER => self.drain_commands(),
                    STREAM => self.stream_ready(event),
                    _ => {}
                }
            }

            if self.read_pending && !self.finished {
                self.receive();
            }
        }
    }

    fn stream_ready(&mut self, event: &Event) {
        if !self.connected {
            self.complete_connect();
            // Still in progress, or failed
            return;
        }

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.receive();
        }
        if !self.finished && event.is_writable() {
            self.flush();
        }
    }

    /// Connect completion: the socket became writable (or errored)
    fn complete_connect(&mut self) {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => return self.finish("connect failed", Some(e)),
            Ok(None) => {}
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return,
            Err(e) => return self.finish("connect failed", Some(e)),
        }

        self.connected = true;
        let config = &self.client.inner.config;
        if let Err(e) = socket::tune(&self.stream, config.nodelay, config.socket_buffer_size) {
            warn!(err = ?e, "Failed to tune client socket");
        }
        self.client.set_state(ClientState::Connected);

        info!(remote = %self.remote_address, "Client connected");
        self.handler.on_connected(&self.client);

        // Arm the receive loop; data may already be waiting
        self.receive();
        if !self.finished {
            self.flush();
        }
    }

    fn receive(&mut self) {
        let ClientDriver {
            client,
            handler,
            stream,
            descriptor,
            ..
        } = self;
        let status = transfer::receive(stream, descriptor, READ_BUDGET, |data| {
            debug!(len = data.len(), "Data received");
            handler.on_data_received(client, data);
        });

        self.read_pending = matches!(status, ReceiveStatus::Pending);
        match status {
            ReceiveStatus::Open | ReceiveStatus::Pending => {}
            ReceiveStatus::Closed(None) => self.finish("peer closed", None),
            ReceiveStatus::Closed(Some(e)) => self.finish("socket error", Some(e)),
        }
    }

    fn flush(&mut self) {
        let mut completed = Vec::new();
        let result = self.outbound.flush(&mut self.stream, &mut completed);

        for transferred in completed {
            debug!(len = transferred, "Data sent");
            self.handler.on_data_sent(&self.client, transferred);
        }

        match result {
            Ok(status) => self.update_interest(status),
            Err(e) => self.finish("socket error", Some(e)),
        }
    }

    fn update_interest(&mut self, status: FlushStatus) {
        let wanted = match status {
            FlushStatus::Blocked => Interest::READABLE | Interest::WRITABLE,
            FlushStatus::Drained => Interest::READABLE,
        };
        if self.interest == wanted {
            return;
        }
        match self.poll.registry().reregister(&mut self.stream, STREAM, wanted) {
            Ok(()) => self.interest = wanted,
            Err(e) => self.finish("socket error", Some(e)),
        }
    }

    fn drain_commands(&mut self) {
        while !self.finished {
            match self.commands.try_recv() {
                Ok(ClientCommand::Send(data)) => {
                    if !self.connected {
                        debug!(len = data.len(), "Dropping send issued before connect completed");
                        continue;
                    }
                    self.outbound.push(data);
                    self.flush();
                }
                Ok(ClientCommand::Stop) => self.finish("stopped locally", None),
                Err(_) => break,
            }
        }
    }

    /// End the session. Runs at most once.
    fn finish(&mut self, reason: &'static str, error: Option<io::Error>) {
        if self.finished {
            return;
        }
        self.finished = true;

        if let Err(e) = self.poll.registry().deregister(&mut self.stream) {
            debug!(err = ?e, "Deregister failed");
        }
        socket::shutdown_stream(&self.stream);

        if !self.outbound.is_empty() {
            debug!(pending = self.outbound.pending(), "Discarding unsent data");
        }
        self.client.set_state(ClientState::Disconnected);

        if self.connected {
            match &error {
                Some(e) => warn!(remote = %self.remote_address, reason, err = ?e, "Client disconnected"),
                None => info!(remote = %self.remote_address, reason, "Client disconnected"),
            }
            self.handler.on_disconnected(&self.client);
        } else {
            let error = error.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "stopped before the connection completed",
                )
            });
            warn!(remote = %self.remote_address, err = ?error, "Connect failed");
            self.handler.on_connect_failed(&self.client, &error);
        }
    }
}

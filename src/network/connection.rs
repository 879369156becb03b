//! Accepted connections: public handle, driver-side state and the registry
//!
//! The driver owns the registered socket and the pooled descriptor. Callers
//! hold a `ConnectionHandle`, which only carries a duplicated OS handle for
//! the liveness probe plus a mailbox into the driver.

use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::debug;

use super::mailbox::Mailbox;
use super::server::ServerCommand;
use super::socket;
use super::transfer::Outbound;
use crate::core::{Descriptor, DescriptorPool};
use crate::error::{Error, Result};

/// Identifier of an accepted connection, unique per server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub(crate) usize);

impl ConnectionId {
    pub(crate) fn token(self) -> Token {
        Token(self.0)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct ConnectionInner {
    id: ConnectionId,
    server_id: u64,
    remote_address: SocketAddr,
    probe: StdTcpStream,
    closed: AtomicBool,
    mailbox: Mailbox<ServerCommand>,
}

/// One accepted peer.
///
/// Cheap to clone. Remains valid after disconnect, but then `is_alive`
/// is false and `send` fails with `Error::NotConnected`.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        server_id: u64,
        remote_address: SocketAddr,
        probe: StdTcpStream,
        mailbox: Mailbox<ServerCommand>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                server_id,
                remote_address,
                probe,
                closed: AtomicBool::new(false),
                mailbox,
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address
    }

    pub(crate) fn server_id(&self) -> u64 {
        self.inner.server_id
    }

    /// Not disposed locally and the socket still has a live peer
    pub fn is_alive(&self) -> bool {
        !self.is_closed() && socket::is_alive(&self.inner.probe)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.inner.closed.swap(true, Ordering::AcqRel)
    }

    /// Queue `data` for this connection
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        self.inner.mailbox.post(ServerCommand::Send {
            id: self.id(),
            data: data.into(),
        })
    }

    /// Shut the socket down and let the driver dispose the connection.
    ///
    /// Idempotent. The server emits `client_disconnected` once the
    /// descriptor is back in the pool.
    pub fn disconnect(&self) {
        if !self.mark_closed() {
            return;
        }
        debug!(id = %self.id(), peer = %self.remote_address(), "Disconnect requested");
        socket::shutdown(&self.inner.probe);
        // Driver gone means cleanup already happened
        let _ = self.inner.mailbox.post(ServerCommand::Disconnect { id: self.id() });
    }

    pub(crate) fn shutdown_socket(&self) {
        socket::shutdown(&self.inner.probe);
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.server_id() == other.server_id() && self.id() == other.id()
    }
}

impl Eq for ConnectionHandle {}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("remote_address", &self.remote_address())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Driver-side state of a live connection
pub(crate) struct ConnectionState {
    pub(crate) stream: TcpStream,
    pub(crate) descriptor: Descriptor,
    pub(crate) handle: ConnectionHandle,
    pub(crate) outbound: Outbound,
    pub(crate) interest: Interest,
}

/// Live connections of one server.
///
/// Inserted by the accept path and removed by each connection's disconnect
/// path, both on the driver thread, while callers read it concurrently.
#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionHandle>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, handle: ConnectionHandle) {
        self.lock().insert(handle.id(), handle);
    }

    /// Drop `id` from the registry, then hand its descriptor back to `pool`.
    ///
    /// In this order a listed handle always owns a descriptor that is not
    /// in the pool.
    pub(crate) fn retire(
        &self,
        id: ConnectionId,
        descriptor: Descriptor,
        pool: &DescriptorPool,
    ) -> Result<()> {
        self.lock().remove(&id);
        pool.release(descriptor)
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.lock().get(&id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Snapshot ordered by id (accept order)
    pub(crate) fn snapshot(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<_> = self.lock().values().cloned().collect();
        handles.sort_by_key(ConnectionHandle::id);
        handles
    }
}

//! Lifecycle notifications
//!
//! Handlers are mandatory arguments of `Server::listen` and
//! `Client::connect`; there is no "no subscriber" mode. Every callback runs
//! on the driver thread that produced the completion, so a slow handler
//! delays further I/O of that driver.
//!
//! `mpsc::Sender<ServerEvent>` and `mpsc::Sender<ClientEvent>` implement the
//! handler traits, for callers that prefer an explicit event stream.

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;

use super::client::Client;
use super::connection::ConnectionHandle;
use super::server::Server;

/// Callbacks for a listening server
pub trait ServerHandler: Send + 'static {
    /// The listener is bound and the accept loop is armed
    fn on_listening(&mut self, _server: &Server, _local_addr: SocketAddr) {}

    fn on_client_connected(&mut self, _server: &Server, _connection: &ConnectionHandle) {}

    /// Emitted exactly once per connection, after its descriptor went back
    /// to the pool and it left the registry
    fn on_client_disconnected(&mut self, _server: &Server, _connection: &ConnectionHandle) {}

    /// One receive completion. `data` is an owned copy of exactly the bytes
    /// transferred.
    fn on_data_received(&mut self, server: &Server, connection: &ConnectionHandle, data: Vec<u8>);

    fn on_data_sent(&mut self, _server: &Server, _connection: &ConnectionHandle, _transferred: usize) {
    }

    /// The pool was exhausted and an accepted socket was closed
    fn on_connection_rejected(&mut self, _server: &Server, _peer: SocketAddr) {}

    fn on_stopped(&mut self, _server: &Server) {}
}

/// Callbacks for an outbound client session
pub trait ClientHandler: Send + 'static {
    fn on_connected(&mut self, _client: &Client) {}

    /// The connect completion reported an error; the session is over
    fn on_connect_failed(&mut self, _client: &Client, _error: &io::Error) {}

    fn on_data_received(&mut self, client: &Client, data: Vec<u8>);

    fn on_data_sent(&mut self, _client: &Client, _transferred: usize) {}

    /// Peer close, socket failure or local `stop()`. Emitted once per session.
    fn on_disconnected(&mut self, _client: &Client) {}
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening(SocketAddr),
    ClientConnected(ConnectionHandle),
    ClientDisconnected(ConnectionHandle),
    DataReceived(ConnectionHandle, Vec<u8>),
    DataSent(ConnectionHandle, usize),
    ConnectionRejected(SocketAddr),
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    ConnectFailed(io::ErrorKind),
    DataReceived(Vec<u8>),
    DataSent(usize),
    Disconnected,
}

// A dropped receiver only means nobody listens any more; the driver keeps
// running, so send errors are ignored.
impl ServerHandler for Sender<ServerEvent> {
    fn on_listening(&mut self, _server: &Server, local_addr: SocketAddr) {
        let _ = self.send(ServerEvent::Listening(local_addr));
    }

    fn on_client_connected(&mut self, _server: &Server, connection: &ConnectionHandle) {
        let _ = self.send(ServerEvent::ClientConnected(connection.clone()));
    }

    fn on_client_disconnected(&mut self, _server: &Server, connection: &ConnectionHandle) {
        let _ = self.send(ServerEvent::ClientDisconnected(connection.clone()));
    }

    fn on_data_received(&mut self, _server: &Server, connection: &ConnectionHandle, data: Vec<u8>) {
        let _ = self.send(ServerEvent::DataReceived(connection.clone(), data));
    }

    fn on_data_sent(&mut self, _server: &Server, connection: &ConnectionHandle, transferred: usize) {
        let _ = self.send(ServerEvent::DataSent(connection.clone(), transferred));
    }

    fn on_connection_rejected(&mut self, _server: &Server, peer: SocketAddr) {
        let _ = self.send(ServerEvent::ConnectionRejected(peer));
    }

    fn on_stopped(&mut self, _server: &Server) {
        let _ = self.send(ServerEvent::Stopped);
    }
}

impl ClientHandler for Sender<ClientEvent> {
    fn on_connected(&mut self, _client: &Client) {
        let _ = self.send(ClientEvent::Connected);
    }

    fn on_connect_failed(&mut self, _client: &Client, error: &io::Error) {
        let _ = self.send(ClientEvent::ConnectFailed(error.kind()));
    }

    fn on_data_received(&mut self, _client: &Client, data: Vec<u8>) {
        let _ = self.send(ClientEvent::DataReceived(data));
    }

    fn on_data_sent(&mut self, _client: &Client, transferred: usize) {
        let _ = self.send(ClientEvent::DataSent(transferred));
    }

    fn on_disconnected(&mut self, _client: &Client) {
        let _ = self.send(ClientEvent::Disconnected);
    }
}

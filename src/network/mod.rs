//! Network Layer: completion-driven TCP transport
//!
//! Menggunakan mio untuk cross-platform non-blocking I/O (epoll/kqueue/IOCP).
//! A driver thread per server or client session turns readiness into
//! accept/receive/send/connect completions and reports them to a handler.
//!
//! Fitur:
//! - Pooled receive descriptors for accepted connections
//! - One outbound queue per connection, one buffer in flight
//! - Thread-safe handles: send and disconnect from any thread

mod client;
mod connection;
mod event;
mod mailbox;
mod server;
mod socket;
mod transfer;

pub use client::{Client, ClientState};
pub use connection::{ConnectionHandle, ConnectionId};
pub use event::{ClientEvent, ClientHandler, ServerEvent, ServerHandler};
pub use server::{Server, ServerState};

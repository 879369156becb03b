//! Emerald - Completion-Driven TCP Transport
//!
//! Arsitektur:
//! - Pooled descriptors: receive buffers allocated once, recycled per connection
//! - Non-blocking: mio readiness turned into accept/receive/send completions
//! - Event surface: mandatory handlers or explicit event channels
//!
//! The engine moves opaque byte buffers only; framing is up to the caller.
//!
//! ```no_run
//! use std::sync::mpsc;
//! use emerald::{Server, ServerEvent};
//!
//! let server = Server::new(64);
//! let (tx, rx) = mpsc::channel::<ServerEvent>();
//! server.listen(9000, tx)?;
//!
//! for event in rx {
//!     if let ServerEvent::DataReceived(connection, data) = event {
//!         server.send(&connection, data)?; // echo
//!     }
//! }
//! # Ok::<(), emerald::Error>(())
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod network;

pub use config::{ClientConfig, ServerConfig};
pub use crate::core::{resolve, Capacity, Descriptor, DescriptorPool, DEFAULT_BUFFER_SIZE};
pub use error::{Error, Result};
pub use network::{
    Client, ClientEvent, ClientHandler, ClientState, ConnectionHandle, ConnectionId, Server,
    ServerEvent, ServerHandler, ServerState,
};

//! Error types untuk Emerald transport
//!
//! Only setup-time failures surface here. I/O failures on a live connection
//! are absorbed by the driver and reported as lifecycle events.

use std::io;

/// Result type alias for Emerald operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A call was made with an argument the callee cannot accept
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The operation is not allowed in the current lifecycle state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// The target connection is closed or was never established
    #[error("Not connected")]
    NotConnected,

    /// Host lookup produced no usable IPv4 address
    #[error("Failed to resolve {host}:{port} to an IPv4 address")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: Option<io::Error>,
    },

    /// Socket level failure during setup
    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// The I/O driver has already shut down
    #[error("Driver stopped")]
    Stopped,
}

impl Error {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Wrap an I/O error with the setup step that produced it
    pub fn io(context: &'static str, source: io::Error) -> Self {
        Self::Io { context, source }
    }
}

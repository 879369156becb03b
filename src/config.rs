//! Server and client configuration

use crate::core::{Capacity, DEFAULT_BUFFER_SIZE};

/// Default listen backlog
pub const DEFAULT_MAX_QUEUED_ACCEPTS: u32 = 501;

/// Default mio event buffer per poll
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host resolved for `Server::listen`
    pub host: String,
    /// Pool capacity, also the ceiling on live connections
    pub max_connections: Capacity,
    /// Listen backlog
    pub max_queued_accepts: u32,
    /// Receive buffer per connection
    pub buffer_size: usize,
    /// TCP_NODELAY on accepted sockets
    pub nodelay: bool,
    /// SO_SNDBUF / SO_RCVBUF override (Unix only)
    pub socket_buffer_size: Option<usize>,
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            max_connections: Capacity::Bounded(1024),
            max_queued_accepts: DEFAULT_MAX_QUEUED_ACCEPTS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: true,
            socket_buffer_size: None,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn new(max_connections: impl Into<Capacity>) -> Self {
        Self {
            max_connections: max_connections.into(),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_max_queued_accepts(mut self, backlog: u32) -> Self {
        self.max_queued_accepts = backlog;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_socket_buffer_size(mut self, size: usize) -> Self {
        self.socket_buffer_size = Some(size);
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub buffer_size: usize,
    pub nodelay: bool,
    pub socket_buffer_size: Option<usize>,
    pub events_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: true,
            socket_buffer_size: None,
            // One socket plus the waker
            events_capacity: 64,
        }
    }
}

impl ClientConfig {
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_socket_buffer_size(mut self, size: usize) -> Self {
        self.socket_buffer_size = Some(size);
        self
    }

    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }
}

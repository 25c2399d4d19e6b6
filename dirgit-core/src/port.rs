//! Free TCP port allocation

use std::net::TcpListener;

use tracing::debug;

use crate::{Error, Result};

/// Source of TCP ports for new git servers
///
/// A returned port is free at call time only; another process may take it
/// before the server binds.
pub trait PortAllocator: Send + Sync {
    /// Return a port that is currently unused
    fn allocate(&self) -> Result<u16>;
}

/// Asks the OS for an ephemeral port by binding port 0 and releasing it
#[derive(Debug, Clone)]
pub struct EphemeralPortAllocator {
    host: String,
}

impl EphemeralPortAllocator {
    /// Allocate ports free on `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Default for EphemeralPortAllocator {
    fn default() -> Self {
        Self::new("0.0.0.0")
    }
}

impl PortAllocator for EphemeralPortAllocator {
    fn allocate(&self) -> Result<u16> {
        let listener =
            TcpListener::bind((self.host.as_str(), 0)).map_err(Error::PortAllocation)?;
        let port = listener
            .local_addr()
            .map_err(Error::PortAllocation)?
            .port();
        debug!(host = %self.host, port, "Allocated ephemeral port");
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_returns_bindable_port() {
        let allocator = EphemeralPortAllocator::new("127.0.0.1");
        let port = allocator.allocate().unwrap();
        assert_ne!(port, 0);

        // the port was released and can be bound again
        let listener = TcpListener::bind(("127.0.0.1", port));
        assert!(listener.is_ok());
    }

    #[test]
    fn test_allocate_invalid_host() {
        let allocator = EphemeralPortAllocator::new("not a host name");
        let result = allocator.allocate();
        assert!(matches!(result, Err(Error::PortAllocation(_))));
    }
}

//! # RPC session seam.
//!
//! The wire-level session layer (connection establishment, request framing,
//! primitive serialization) lives outside this crate. This module only names
//! the interface the propagation runtime consumes:
//!
//! ```text
//! Transport::connect(addr) ──► Connection::open_session(addr) ──► Session
//!                                                                  ├─ set_timeout(d)
//!                                                                  ├─ write_u8(v)
//!                                                                  └─ invoke() → rpc response code
//! ```
//!
//! A response code of `0` means the remote accepted the call.
//! [`memory::MemoryTransport`] is an in-process implementation for tests and demos.

pub mod memory;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;

/// Shared handle to a transport.
pub type TransportRef = Arc<dyn Transport>;

/// Address of a remote service instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceAddr {
    /// Service name.
    pub name: String,
    /// Instance id.
    pub id: u32,
}

impl ServiceAddr {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Factory for raw connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a raw connection towards `addr`.
    async fn connect(&self, addr: &ServiceAddr) -> Result<Box<dyn Connection>, TransportError>;
}

/// One raw transport connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a request/response session on this connection.
    async fn open_session(&self, addr: &ServiceAddr) -> Result<Box<dyn Session>, TransportError>;
}

/// One outbound request/response exchange.
#[async_trait]
pub trait Session: Send {
    /// Bounds the whole exchange; enforced by the transport.
    fn set_timeout(&mut self, timeout: Duration);

    /// Appends one `u8` argument to the request.
    fn write_u8(&mut self, value: u8) -> Result<(), TransportError>;

    /// Sends the request and waits for the response code.
    async fn invoke(&mut self) -> Result<u32, TransportError>;
}

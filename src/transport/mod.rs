//! Transport seam between a session and the sync backend.
//!
//! A [`Connector`] opens [`Link`]s; a link carries JSON text frames in both
//! directions until either side closes it. The session owns at most one link
//! at a time and asks the connector for a fresh one on every (re)connect.
//!
//! - [`memory`]: in-process transport with a scriptable server side.
//! - `websocket` (feature `websocket`): `tokio-tungstenite` client.

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{memory, MemoryConnector, MemoryServer, ServerLink};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("link closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Opens links to the backend.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Link>, TransportError>;
}

/// One open, bidirectional, message-oriented connection.
#[async_trait]
pub trait Link: Send {
    /// Write one text frame.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound text frame. `None` once the link is closed; an `Err` item
    /// reports a transport error without ending the link.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the link from the client side.
    async fn close(&mut self) -> Result<(), TransportError>;
}

//! Transport abstraction for the feed socket.
//!
//! This module provides a pluggable transport layer that abstracts
//! the underlying connection mechanism (websocket, mock for testing).
//!
//! # Design
//!
//! A [`Transport`] opens connections; each [`Connection`] is one physical
//! socket:
//! - `connect()` resolves once the socket reports open
//! - `send()` transmits a JSON text frame
//! - `recv()` yields the next text frame or the peer's close
//! - `close()` sends a close frame
//!
//! Every reconnect opens a fresh [`Connection`], so frames from an old socket
//! can never be read from the new one.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! let conn = transport.connect("wss://example.com/api/v2/connect").await?;
//! conn.send(handshake_json).await?;
//! let frame = conn.recv().await?;
//! ```

mod mock;
mod websocket;

pub use mock::{MockConnection, MockTransport};
pub use websocket::{WebSocketConnection, WebSocketTransport, WebSocketTransportConfig};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Connection timeout.
    #[error("connection timeout")]
    Timeout,
}

/// A frame read from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON text message.
    Text(String),
    /// The peer closed the socket.
    Close {
        /// Close code, if one was sent.
        code: Option<u16>,
        /// Close reason.
        reason: String,
    },
}

/// Opens socket connections.
///
/// Implementations handle the underlying connection mechanism
/// (websocket, mock, etc).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `url`, resolving once the socket is open.
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, TransportError>;
}

/// One open socket.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send a text frame.
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Receive the next frame.
    ///
    /// Blocks until a frame is available or the connection fails.
    async fn recv(&self) -> Result<Frame, TransportError>;

    /// Check if the socket is still open.
    fn is_connected(&self) -> bool;

    /// Send a close frame with the given code.
    async fn close(&self, code: u16, reason: &str) -> Result<(), TransportError>;
}

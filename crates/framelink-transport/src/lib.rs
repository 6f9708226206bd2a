//! Transport abstraction layer for Framelink.
//!
//! A transport delivers ordered, opaque byte chunks between two peers; the
//! framework neither knows nor cares what carries them. This crate defines
//! the three contracts the rest of the workspace builds on — [`Connector`]
//! (client side), [`Acceptor`] (server side), and [`Connection`] (one live
//! duplex link) — plus two adapters:
//!
//! - [`memory`] — an in-process channel-pair transport for tests and demos
//! - [`websocket`] — WebSocket via `tokio-tungstenite` (feature `websocket`,
//!   on by default)

mod error;
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketAcceptor, WebSocketConnector, WsConnection};

use std::fmt;
use std::future::Future;

/// Process-wide handle naming one connection in logs and maps.
///
/// Adapters mint these from a shared counter, so an id is never reused
/// within a process even across different transports. The number carries no
/// meaning beyond identity — don't parse it, don't order by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw counter value. Adapters call this; applications rarely
    /// need to.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Unwraps back to the raw number, for interop with code that keys on
    /// integers.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Establishes outbound connections, one attempt per call.
///
/// The connection controller owns a connector and decides when to retry;
/// the connector itself never loops.
pub trait Connector: Send + 'static {
    /// The connection type produced by this connector.
    type Conn: Connection;

    /// Performs a single connection attempt.
    fn connect(
        &mut self,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// Accepts incoming connections.
pub trait Acceptor: Send + 'static {
    /// The connection type produced by this acceptor.
    type Conn: Connection;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;

    /// Gracefully shuts down the acceptor, stopping new connections.
    fn shutdown(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A single live connection that can send and receive byte chunks.
///
/// Chunk boundaries carry no meaning — the session layer reassembles
/// messages from whatever slicing the transport produces.
pub trait Connection: Send + Sync + 'static {
    /// Sends one chunk to the remote peer.
    ///
    /// A send failure means the connection is dead; the adapter closes
    /// itself and the next `recv` observes the closure.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next chunk from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// The remote peer's address, where the transport knows one.
    fn remote_addr(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_round_trips_raw_value() {
        let id = ConnectionId::new(3_000_017);
        assert_eq!(id.into_inner(), 3_000_017);
    }

    #[test]
    fn test_connection_id_display_is_prefixed() {
        assert_eq!(ConnectionId::new(509).to_string(), "conn-509");
    }

    #[test]
    fn test_connection_id_keys_per_connection_state() {
        use std::collections::HashMap;
        // The server keeps per-connection state keyed by id; equal ids must
        // land on the same entry, distinct ids must not collide.
        let mut links = HashMap::new();
        links.insert(ConnectionId::new(11), "uplink");
        links.insert(ConnectionId::new(12), "downlink");
        assert_eq!(links[&ConnectionId::new(11)], "uplink");
        assert_ne!(ConnectionId::new(11), ConnectionId::new(12));
    }
}

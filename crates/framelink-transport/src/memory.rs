//! In-process transport over channel pairs.
//!
//! Two [`MemoryConnection`]s form a duplex link: each side's sends appear on
//! the other side's `recv`. [`memory_transport`] adds the connector/acceptor
//! handshake on top, so a whole client–server session — including reconnects,
//! which simply manufacture fresh pairs — can run inside one process. This is
//! the loop the end-to-end test suites drive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::sync::{mpsc, Mutex};

use crate::{Acceptor, Connection, ConnectionId, Connector, TransportError};

/// Counter for generating unique connection IDs.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One side of an in-memory duplex link.
pub struct MemoryConnection {
    id: ConnectionId,
    /// `None` once this side has been closed.
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryConnection {
    fn new(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            id: ConnectionId::new(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
        }
    }
}

/// Creates two linked connections. Bytes sent on one are received on the
/// other, in order.
pub fn memory_pair() -> (MemoryConnection, MemoryConnection) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (MemoryConnection::new(a_tx, a_rx), MemoryConnection::new(b_tx, b_rx))
}

impl Connection for MemoryConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let tx = self
            .tx
            .lock()
            .expect("memory connection sender lock poisoned")
            .clone();
        match tx {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| TransportError::Closed("peer connection dropped".into())),
            None => Err(TransportError::Closed("connection closed locally".into())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping our sender makes the peer's recv observe a clean close.
        self.tx
            .lock()
            .expect("memory connection sender lock poisoned")
            .take();
        self.rx.lock().await.close();
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}

/// Client half of an in-memory transport. Each `connect` call manufactures a
/// fresh connection pair and queues the server half for the acceptor.
#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
}

/// Server half of an in-memory transport.
pub struct MemoryAcceptor {
    incoming: mpsc::UnboundedReceiver<MemoryConnection>,
}

/// Creates a linked connector/acceptor pair.
pub fn memory_transport() -> (MemoryConnector, MemoryAcceptor) {
    let (accept_tx, incoming) = mpsc::unbounded_channel();
    (MemoryConnector { accept_tx }, MemoryAcceptor { incoming })
}

impl Connector for MemoryConnector {
    type Conn = MemoryConnection;

    async fn connect(&mut self) -> Result<MemoryConnection, TransportError> {
        let (client, server) = memory_pair();
        self.accept_tx.send(server).map_err(|_| {
            TransportError::Connect(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "acceptor dropped",
            ))
        })?;
        Ok(client)
    }
}

impl Acceptor for MemoryAcceptor {
    type Conn = MemoryConnection;

    async fn accept(&mut self) -> Result<MemoryConnection, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Shutdown)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_round_trip_both_directions() {
        let (left, right) = memory_pair();

        left.send(b"ping").await.unwrap();
        assert_eq!(right.recv().await.unwrap(), Some(b"ping".to_vec()));

        right.send(b"pong").await.unwrap();
        assert_eq!(left.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let (left, right) = memory_pair();
        for i in 0..16u8 {
            left.send(&[i]).await.unwrap();
        }
        for i in 0..16u8 {
            assert_eq!(right.recv().await.unwrap(), Some(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_close_is_observed_as_clean_eof() {
        let (left, right) = memory_pair();
        left.close().await.unwrap();

        assert!(right.recv().await.unwrap().is_none());
        assert!(matches!(
            left.send(b"late").await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (left, right) = memory_pair();
        drop(right);
        assert!(matches!(
            left.send(b"x").await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_connector_hands_server_half_to_acceptor() {
        let (mut connector, mut acceptor) = memory_transport();

        let client = connector.connect().await.unwrap();
        let server = acceptor.accept().await.unwrap();

        client.send(b"hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(b"hello".to_vec()));
        assert_ne!(client.id(), server.id());
    }

    #[tokio::test]
    async fn test_reconnect_creates_independent_pairs() {
        let (mut connector, mut acceptor) = memory_transport();

        let first = connector.connect().await.unwrap();
        let _server_first = acceptor.accept().await.unwrap();
        first.close().await.unwrap();

        let second = connector.connect().await.unwrap();
        let server_second = acceptor.accept().await.unwrap();

        second.send(b"again").await.unwrap();
        assert_eq!(server_second.recv().await.unwrap(), Some(b"again".to_vec()));
    }

    #[tokio::test]
    async fn test_connect_after_acceptor_dropped_fails() {
        let (mut connector, acceptor) = memory_transport();
        drop(acceptor);
        assert!(matches!(
            connector.connect().await,
            Err(TransportError::Connect(_))
        ));
    }
}

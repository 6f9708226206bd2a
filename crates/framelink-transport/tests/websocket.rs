//! Integration tests for the WebSocket transport.
//!
//! These spin up a real listener and dial it over loopback, so they verify
//! that bytes actually survive the TCP + WebSocket round trip — including
//! the connector side, which the unit tests can't cover.

#![cfg(feature = "websocket")]

use framelink_transport::{
    Acceptor, Connection, Connector, WebSocketAcceptor, WebSocketConnector,
};

/// Binds an acceptor on a random port and returns it with its address.
async fn bind_acceptor() -> (WebSocketAcceptor, String) {
    let acceptor = WebSocketAcceptor::bind("127.0.0.1:0")
        .await
        .expect("should bind");
    let addr = acceptor.local_addr().expect("should have local addr");
    (acceptor, format!("ws://{addr}"))
}

#[tokio::test]
async fn test_connect_accept_and_send_receive() {
    let (mut acceptor, url) = bind_acceptor().await;

    let server_handle =
        tokio::spawn(async move { acceptor.accept().await.expect("should accept") });

    let mut connector = WebSocketConnector::new(url);
    let client = connector.connect().await.expect("should connect");
    let server = server_handle.await.expect("task should complete");

    assert!(server.id().into_inner() > 0);
    assert_ne!(client.id(), server.id());
    assert!(server.remote_addr().is_some());

    // --- Client sends, server receives ---
    client.send(b"hello from client").await.expect("send");
    let received = server.recv().await.expect("recv").expect("should have data");
    assert_eq!(received, b"hello from client");

    // --- Server sends, client receives ---
    server.send(b"hello from server").await.expect("send");
    let received = client.recv().await.expect("recv").expect("should have data");
    assert_eq!(received, b"hello from server");
}

#[tokio::test]
async fn test_recv_returns_none_after_peer_close() {
    let (mut acceptor, url) = bind_acceptor().await;

    let server_handle =
        tokio::spawn(async move { acceptor.accept().await.expect("should accept") });

    let mut connector = WebSocketConnector::new(url);
    let client = connector.connect().await.expect("should connect");
    let server = server_handle.await.expect("task should complete");

    client.close().await.expect("close");

    let result = server.recv().await.expect("recv should not error");
    assert!(result.is_none(), "should observe clean close");
}

#[tokio::test]
async fn test_chunks_arrive_in_order() {
    let (mut acceptor, url) = bind_acceptor().await;

    let server_handle =
        tokio::spawn(async move { acceptor.accept().await.expect("should accept") });

    let mut connector = WebSocketConnector::new(url);
    let client = connector.connect().await.expect("should connect");
    let server = server_handle.await.expect("task should complete");

    for i in 0..32u8 {
        client.send(&[i, i + 1]).await.expect("send");
    }
    for i in 0..32u8 {
        let chunk = server.recv().await.expect("recv").expect("data");
        assert_eq!(chunk, vec![i, i + 1]);
    }
}

#[tokio::test]
async fn test_connect_to_closed_port_fails() {
    // Bind and immediately drop to get a port nothing is listening on.
    let (acceptor, url) = bind_acceptor().await;
    drop(acceptor);

    let mut connector = WebSocketConnector::new(url);
    let result = connector.connect().await;
    assert!(result.is_err(), "connect to dead port should fail");
}

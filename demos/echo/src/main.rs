//! Minimal Framelink demo: a WebSocket server and client in one process.
//!
//! The server answers `add` requests and logs `chat` events; the client
//! connects, performs one of each, and disconnects.
//!
//! ```sh
//! cargo run -p echo-demo
//! ```

use framelink::prelude::*;
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), FramelinkError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let acceptor = WebSocketAcceptor::bind("127.0.0.1:0").await?;
    let addr = acceptor
        .local_addr()
        .expect("bound listener has a local address");

    let server = Server::new(acceptor, LinkConfig::default()).on_connection(|link| {
        tracing::info!(remote = ?link.remote_addr(), "client connected");

        link.emitter().on_request("add", |args| async move {
            let a = args
                .first()
                .and_then(|v| v.as_i64())
                .ok_or_else(|| RequestError::rejected("add takes two integers"))?;
            let b = args
                .get(1)
                .and_then(|v| v.as_i64())
                .ok_or_else(|| RequestError::rejected("add takes two integers"))?;
            Ok(json!(a + b))
        });

        link.emitter().on_event("chat", |args| async move {
            tracing::info!(?args, "chat event received");
            Ok(())
        });
    });
    tokio::spawn(server.run());

    let connector = WebSocketConnector::new(format!("ws://{addr}"));
    let client = Client::new(connector, LinkConfig::default());
    client.connect().await?;

    let sum = client
        .send_request("add", vec![json!(2), json!(3)])
        .wait()
        .await?;
    tracing::info!(%sum, "add(2, 3) answered");

    client
        .send_event("chat", vec![json!("hello from the echo demo")])
        .wait()
        .await?;
    tracing::info!("chat event acknowledged");

    client.disconnect().await;
    Ok(())
}

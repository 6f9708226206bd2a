//! # Framelink
//!
//! Transport-agnostic bidirectional messaging: a client and server exchange
//! typed *events*, *binary events*, and *request/response* pairs over any
//! transport that delivers ordered byte chunks, with per-message
//! acknowledgement, delivery timeouts, and session resumption across
//! reconnects.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use framelink::prelude::*;
//! use framelink_transport::memory::memory_transport;
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), FramelinkError> {
//! let (connector, acceptor) = memory_transport();
//!
//! let server = Server::new(acceptor, LinkConfig::default()).on_connection(|link| {
//!     link.emitter().on_request("add", |args| async move {
//!         let a = args[0].as_i64().unwrap_or(0);
//!         let b = args[1].as_i64().unwrap_or(0);
//!         Ok(json!(a + b))
//!     });
//! });
//! tokio::spawn(server.run());
//!
//! let client = Client::new(connector, LinkConfig::default());
//! client.connect().await?;
//! let sum = client.send_request("add", vec![json!(2), json!(3)]).wait().await?;
//! assert_eq!(sum, json!(5));
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod emitter;
mod error;
mod link;
mod server;

pub use client::Client;
pub use config::LinkConfig;
pub use emitter::Emitter;
pub use error::{FramelinkError, HandlerError, RequestError};
pub use link::{Link, LinkEvent};
pub use server::Server;

/// Re-exports everything an application needs.
///
/// ```rust
/// use framelink::prelude::*;
/// ```
pub mod prelude {
    // Meta-crate
    pub use crate::{
        Client, Emitter, FramelinkError, HandlerError, Link, LinkConfig, LinkEvent,
        RequestError, Server,
    };

    // Protocol types
    pub use framelink_protocol::{
        Message, MessageId, MessageKind, Payload, ProtocolError, ResponseBody, ACK_CHANNEL,
    };

    // Session types
    pub use framelink_session::{Delivery, MessageReader, MessageWriter, NetworkError, SendOptions};

    // Transport types
    pub use framelink_transport::{
        Acceptor, Connection, ConnectionId, Connector, TransportError,
    };
    #[cfg(feature = "websocket")]
    pub use framelink_transport::{WebSocketAcceptor, WebSocketConnector};
}

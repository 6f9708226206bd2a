//! Server-side accept loop.
//!
//! Each accepted connection gets its own [`Link`] — writer, emitter, reader,
//! and event channel — driven by its own task. Server-side links behave
//! exactly like the client side minus the reconnect loop: when the
//! connection ends, the link ends with it.

use std::sync::Arc;

use framelink_session::MessageReader;
use framelink_transport::{Acceptor, Connection, TransportError};

use crate::config::LinkConfig;
use crate::link::{drive_connection, emit_event, new_link, Link, LinkEvent};

/// A messaging server over a pluggable transport.
///
/// # Example
///
/// ```rust,no_run
/// # use framelink::{LinkConfig, Server};
/// # use framelink_transport::memory::memory_transport;
/// # use serde_json::json;
/// # async fn example() {
/// let (_connector, acceptor) = memory_transport();
/// let server = Server::new(acceptor, LinkConfig::default())
///     .on_connection(|link| {
///         link.emitter().on_request("add", |args| async move {
///             let a = args[0].as_i64().unwrap_or(0);
///             let b = args[1].as_i64().unwrap_or(0);
///             Ok(json!(a + b))
///         });
///     });
/// server.run().await.expect("server failed");
/// # }
/// ```
pub struct Server<A: Acceptor> {
    acceptor: A,
    config: LinkConfig,
    hook: Option<Arc<dyn Fn(Link) + Send + Sync>>,
}

impl<A: Acceptor> Server<A> {
    /// Creates a server over the given acceptor.
    pub fn new(acceptor: A, config: LinkConfig) -> Self {
        Self {
            acceptor,
            config,
            hook: None,
        }
    }

    /// Installs the connection hook, called synchronously for every
    /// accepted connection *before* its read loop starts — handlers
    /// registered inside the hook are guaranteed to see the connection's
    /// first message.
    pub fn on_connection(mut self, hook: impl Fn(Link) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Runs the accept loop until the acceptor shuts down.
    ///
    /// # Errors
    /// Currently none beyond the loop ending; per-connection failures are
    /// logged and surfaced on the affected link's events, never here.
    pub async fn run(mut self) -> Result<(), crate::FramelinkError> {
        tracing::info!("server running");
        loop {
            match self.acceptor.accept().await {
                Ok(conn) => {
                    let link = new_link(&self.config, conn.remote_addr());
                    if let Some(hook) = &self.hook {
                        hook(link.clone());
                    }
                    tokio::spawn(serve_connection(
                        Arc::new(conn),
                        link,
                        self.config.clone(),
                    ));
                }
                Err(TransportError::Shutdown) => {
                    tracing::info!("acceptor shut down");
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

/// Drives one accepted connection to its end.
async fn serve_connection<C: Connection>(conn: Arc<C>, link: Link, config: LinkConfig) {
    tracing::info!(conn = %conn.id(), remote = ?link.remote_addr(), "connection accepted");
    let mut reader = MessageReader::new();

    let _errored = drive_connection(&conn, &link, &mut reader).await;

    // Same teardown as a client-side unintentional loss; the link is never
    // reopened, so retained records die with it.
    if config.resumption_enabled {
        link.writer.set_connection_lost();
    } else {
        link.writer.set_connection_closed();
    }
    emit_event(&link.events, LinkEvent::Disconnected { intentional: false });
}

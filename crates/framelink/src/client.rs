//! Client-side connection controller.
//!
//! A [`Client`] owns a driver task that in turn owns the transport
//! connector, the message reader, and the live connection. The driver is an
//! actor: the `Client` handle talks to it over a command channel, so user
//! calls never touch connection state directly.
//!
//! Two connection modes:
//!
//! - [`connect`](Client::connect) — a single attempt, reported to the caller;
//! - [`start`](Client::start) — persistent mode: keep attempting, with
//!   [`LinkConfig::reconnect_delay`] between attempts, until
//!   [`disconnect`](Client::disconnect) is called.
//!
//! Reconnects resume the session: the writer replays retained messages so
//! nothing queued is lost across a dropped transport. An intentional
//! disconnect is terminal — it drops every queued message.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use framelink_session::{Delivery, MessageReader, NetworkError};
use framelink_transport::{Connection, Connector};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::LinkConfig;
use crate::emitter::Emitter;
use crate::error::FramelinkError;
use crate::link::{drive_connection, emit_event, new_link, Link, LinkEvent};

enum ClientCommand {
    Start,
    Connect {
        reply: oneshot::Sender<Result<(), FramelinkError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// A messaging client over a pluggable transport.
///
/// Messages can be sent at any time — while disconnected they queue and
/// flush once a connection opens.
pub struct Client {
    link: Link,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

impl Client {
    /// Creates a client and spawns its driver. No connection is attempted
    /// until [`connect`](Self::connect) or [`start`](Self::start).
    pub fn new(connector: impl Connector, config: LinkConfig) -> Self {
        let link = new_link(&config, None);
        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_driver(connector, link.clone(), command_rx, config));
        Self { link, commands }
    }

    /// Enters persistent mode: the driver attempts to connect and keeps
    /// retrying after failures and lost connections until
    /// [`disconnect`](Self::disconnect).
    pub fn start(&self) {
        let _ = self.commands.send(ClientCommand::Start);
    }

    /// Performs a single connection attempt.
    ///
    /// # Errors
    /// The transport's connect error, unchanged. A failed single attempt is
    /// not retried.
    pub async fn connect(&self) -> Result<(), FramelinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ClientCommand::Connect { reply })
            .map_err(|_| FramelinkError::Network(NetworkError::ConnectionClosed))?;
        rx.await
            .map_err(|_| FramelinkError::Network(NetworkError::ConnectionClosed))?
    }

    /// Leaves persistent mode and disconnects for good.
    ///
    /// Terminal for the session: every queued message is dropped and its
    /// delivery resolves to [`NetworkError::ConnectionClosed`], whether or
    /// not a connection is currently live.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(ClientCommand::Disconnect { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    /// The underlying session handle.
    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Subscribes to lifecycle, message, and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }

    /// Whether a transport connection is currently live.
    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Sends an event; the delivery resolves to `true` on acknowledgement.
    pub fn send_event(&self, channel: &str, args: Vec<Value>) -> Delivery {
        self.link.send_event(channel, args)
    }

    /// Sends a binary event.
    pub fn send_binary(&self, channel: &str, bytes: impl Into<Bytes>, args: Vec<Value>) -> Delivery {
        self.link.send_binary(channel, bytes, args)
    }

    /// Sends a request; the delivery resolves to the response value.
    pub fn send_request(&self, channel: &str, args: Vec<Value>) -> Delivery {
        self.link.send_request(channel, args)
    }

    /// Sends a request with an explicit operation timeout.
    pub fn send_request_with_timeout(
        &self,
        channel: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Delivery {
        self.link.send_request_with_timeout(channel, args, timeout)
    }

    /// The typed send/listen facade, for handler registration.
    pub fn emitter(&self) -> &Emitter {
        self.link.emitter()
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

async fn run_driver<T: Connector>(
    mut connector: T,
    link: Link,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    config: LinkConfig,
) {
    let mut reader = MessageReader::new();
    let mut persistent = false;

    'idle: loop {
        // Disconnected and idle: wait for an instruction.
        let mut reply = match commands.recv().await {
            None => return, // client dropped
            Some(ClientCommand::Start) => {
                persistent = true;
                None
            }
            Some(ClientCommand::Connect { reply }) => Some(reply),
            Some(ClientCommand::Disconnect { reply }) => {
                persistent = false;
                link.writer.set_connection_closed();
                let _ = reply.send(());
                continue 'idle;
            }
        };

        'attempts: loop {
            match connector.connect().await {
                Ok(conn) => {
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Ok(()));
                    }
                    let conn = Arc::new(conn);
                    let (intentional, errored) =
                        run_session(&conn, &link, &mut reader, &mut commands, &mut persistent)
                            .await;

                    if intentional && !errored {
                        link.writer.set_connection_closed();
                        emit_event(&link.events, LinkEvent::Disconnected { intentional: true });
                        break 'attempts;
                    }
                    // Lost, not closed: retain or drop per policy, then
                    // reconnect if persistent.
                    if config.resumption_enabled {
                        link.writer.set_connection_lost();
                    } else {
                        link.writer.set_connection_closed();
                    }
                    emit_event(&link.events, LinkEvent::Disconnected { intentional });
                    if !persistent {
                        break 'attempts;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "connection attempt failed");
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(Err(e.into()));
                    } else {
                        emit_event(&link.events, LinkEvent::Error(Arc::new(e.into())));
                    }
                    // A failed single attempt is not retried; persistent
                    // mode keeps going regardless.
                    if !persistent {
                        break 'attempts;
                    }
                }
            }

            let keep_trying = wait_reconnect_delay(
                &link,
                &mut commands,
                &mut persistent,
                &mut reply,
                config.reconnect_delay,
            )
            .await;
            if !keep_trying {
                break 'attempts;
            }
        }
    }
}

/// Runs one live connection. Returns `(intentional, errored)`.
async fn run_session<C: Connection>(
    conn: &Arc<C>,
    link: &Link,
    reader: &mut MessageReader,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    persistent: &mut bool,
) -> (bool, bool) {
    let mut intentional = false;
    let mut commands_open = true;
    let drive = drive_connection(conn, link, reader);
    tokio::pin!(drive);

    let errored = loop {
        tokio::select! {
            errored = &mut drive => break errored,
            cmd = commands.recv(), if commands_open => match cmd {
                None => {
                    // Client dropped mid-session; wind the connection down.
                    commands_open = false;
                    intentional = true;
                    let _ = conn.close().await;
                }
                Some(ClientCommand::Start) => *persistent = true,
                Some(ClientCommand::Connect { reply }) => {
                    // Already connected.
                    let _ = reply.send(Ok(()));
                }
                Some(ClientCommand::Disconnect { reply }) => {
                    intentional = true;
                    *persistent = false;
                    let _ = conn.close().await;
                    let _ = reply.send(());
                }
            }
        }
    };

    (intentional, errored)
}

/// Waits out the reconnect delay while still serving commands. Returns
/// `false` when the driver should stop retrying.
async fn wait_reconnect_delay(
    link: &Link,
    commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    persistent: &mut bool,
    reply: &mut Option<oneshot::Sender<Result<(), FramelinkError>>>,
    delay: Duration,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            cmd = commands.recv() => match cmd {
                None => return false,
                Some(ClientCommand::Start) => *persistent = true,
                Some(ClientCommand::Connect { reply: r }) => {
                    // An explicit connect skips the rest of the delay.
                    *reply = Some(r);
                    return true;
                }
                Some(ClientCommand::Disconnect { reply: r }) => {
                    *persistent = false;
                    link.writer.set_connection_closed();
                    let _ = r.send(());
                    return false;
                }
            }
        }
    }
}

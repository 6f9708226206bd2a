//! Per-connection controller plumbing shared by the client and the server.
//!
//! A [`Link`] bundles one session's writer, emitter, and lifecycle event
//! channel. The driver (client reconnect loop or server accept loop) calls
//! [`drive_connection`] with a live transport connection; it runs the write
//! pump and the read loop, feeds inbound bytes through the reader, and
//! routes every decoded message:
//!
//! 1. non-system messages are acknowledged before anything else happens;
//! 2. `ack` system messages settle the writer's records;
//! 3. responses settle pending requests (success or remote error);
//! 4. events, binary events, and requests go to the emitter's handlers;
//! 5. every non-system message is also surfaced to [`LinkEvent::Message`]
//!    observers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use framelink_protocol::{Message, MessageKind, Payload, ResponseBody, ACK_CHANNEL};
use framelink_session::{Delivery, MessageReader, MessageWriter, NetworkError, SendPort};
use framelink_transport::Connection;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Notify};

use crate::config::LinkConfig;
use crate::emitter::{Emitter, GENERIC_REQUEST_ERROR};
use crate::error::FramelinkError;

/// Capacity of the lifecycle event channel. Slow observers that fall this
/// far behind start losing the oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle and traffic notifications observable via [`Link::subscribe`].
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A transport connection is live.
    Connected,
    /// The transport connection ended. `intentional` is true only for a
    /// locally requested disconnect.
    Disconnected {
        /// Whether this side asked for the disconnect.
        intentional: bool,
    },
    /// An inbound non-system message, surfaced after dispatch.
    Message(Message),
    /// A reported failure: timeouts, handler errors, decode errors,
    /// transport write errors.
    Error(Arc<FramelinkError>),
}

/// Sends an event to observers; an error nobody observes is logged loudly —
/// dropping failures on the floor is a bug in the embedding application.
pub(crate) fn emit_event(events: &broadcast::Sender<LinkEvent>, event: LinkEvent) {
    if events.receiver_count() == 0 {
        if let LinkEvent::Error(err) = &event {
            tracing::error!(error = %err, "link error with no observers");
        }
        return;
    }
    let _ = events.send(event);
}

// ---------------------------------------------------------------------------
// ConnectionPort
// ---------------------------------------------------------------------------

/// The writer's narrow view of "whatever connection is live right now".
///
/// The driver attaches the current connection's outbound queue on connect
/// and detaches it on disconnect; the writer itself never holds a transport
/// reference.
pub(crate) struct ConnectionPort {
    state: StdMutex<PortState>,
}

#[derive(Default)]
struct PortState {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    stop: Option<Arc<Notify>>,
}

impl ConnectionPort {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(PortState::default()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PortState> {
        self.state.lock().expect("connection port lock poisoned")
    }

    fn attach(&self, tx: mpsc::UnboundedSender<Bytes>, stop: Arc<Notify>) {
        let mut state = self.lock();
        state.tx = Some(tx);
        state.stop = Some(stop);
    }

    fn detach(&self) {
        let mut state = self.lock();
        state.tx = None;
        state.stop = None;
    }

    /// Asks the live connection's drive loop to close. No-op when
    /// disconnected.
    fn request_stop(&self) {
        if let Some(stop) = self.lock().stop.clone() {
            stop.notify_one();
        }
    }
}

impl SendPort for ConnectionPort {
    fn push_frame(&self, frame: Bytes) -> Result<(), NetworkError> {
        match &self.lock().tx {
            Some(tx) => tx.send(frame).map_err(|_| NetworkError::ConnectionClosed),
            None => Err(NetworkError::ConnectionClosed),
        }
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// Handle to one logical messaging session.
///
/// Cheap to clone. On the client a link survives reconnects; on the server
/// each accepted connection gets its own link.
#[derive(Clone)]
pub struct Link {
    pub(crate) emitter: Emitter,
    pub(crate) writer: MessageWriter,
    pub(crate) events: broadcast::Sender<LinkEvent>,
    pub(crate) port: Arc<ConnectionPort>,
    pub(crate) connected: Arc<AtomicBool>,
    pub(crate) remote: Option<String>,
}

/// Builds a link and spawns the task forwarding writer errors to observers.
pub(crate) fn new_link(config: &LinkConfig, remote: Option<String>) -> Link {
    let port = ConnectionPort::new();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();
    let writer = MessageWriter::new(port.clone(), errors_tx);
    let emitter = Emitter::new(writer.clone(), config);
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

    let error_events = events.clone();
    tokio::spawn(async move {
        while let Some(err) = errors_rx.recv().await {
            emit_event(&error_events, LinkEvent::Error(Arc::new(err.into())));
        }
    });

    Link {
        emitter,
        writer,
        events,
        port,
        connected: Arc::new(AtomicBool::new(false)),
        remote,
    }
}

impl Link {
    /// Subscribes to lifecycle, message, and error events.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Whether a transport connection is currently live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The remote peer's address, on server-side links that know one.
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// Closes the live transport connection, if any.
    ///
    /// This ends the connection, not the session: queued messages follow the
    /// configured resumption policy. Clients wanting a terminal disconnect
    /// use [`Client::disconnect`](crate::Client::disconnect).
    pub fn disconnect(&self) {
        self.port.request_stop();
    }

    /// Sends an event; the delivery resolves to `true` on acknowledgement.
    pub fn send_event(&self, channel: &str, args: Vec<Value>) -> Delivery {
        self.emitter.send_event(channel, args)
    }

    /// Sends a binary event.
    pub fn send_binary(&self, channel: &str, bytes: impl Into<Bytes>, args: Vec<Value>) -> Delivery {
        self.emitter.send_binary(channel, bytes, args)
    }

    /// Sends a request; the delivery resolves to the response value.
    pub fn send_request(&self, channel: &str, args: Vec<Value>) -> Delivery {
        self.emitter.send_request(channel, args)
    }

    /// Sends a request with an explicit operation timeout.
    pub fn send_request_with_timeout(
        &self,
        channel: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Delivery {
        self.emitter.send_request_with_timeout(channel, args, timeout)
    }

    /// The typed send/listen facade, for handler registration.
    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }
}

// ---------------------------------------------------------------------------
// Connection driving
// ---------------------------------------------------------------------------

/// Runs one live connection to its end.
///
/// Attaches the write pump, opens the writer (flushing retained messages),
/// emits `Connected`, then loops over inbound chunks and routes decoded
/// messages. Returns `true` if the connection ended in error (decode
/// failure or transport error), `false` for a clean close — locally
/// requested or remote. Writer teardown (`lost` vs `closed`) and the
/// `Disconnected` event are the caller's, since only it knows the policy.
pub(crate) async fn drive_connection<C: Connection>(
    conn: &Arc<C>,
    link: &Link,
    reader: &mut MessageReader,
) -> bool {
    let (tx, mut outbound) = mpsc::unbounded_channel::<Bytes>();
    let stop = Arc::new(Notify::new());
    link.port.attach(tx, stop.clone());

    // The port must be live before the writer opens: opening flushes
    // retained messages straight through it. Every connection opens in
    // resumed mode, so sent-but-unsettled messages are replayed for
    // re-acknowledgement.
    link.writer.set_connection_opened(true);
    link.connected.store(true, Ordering::SeqCst);
    emit_event(&link.events, LinkEvent::Connected);
    tracing::info!(conn = %conn.id(), "connected");

    let pump_conn = Arc::clone(conn);
    let pump_events = link.events.clone();
    let pump = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = pump_conn.send(&frame).await {
                emit_event(&pump_events, LinkEvent::Error(Arc::new(e.into())));
                // A failed write means a dead connection; close so the read
                // loop observes it.
                let _ = pump_conn.close().await;
                break;
            }
        }
    });

    let stopped = stop.notified();
    tokio::pin!(stopped);

    let errored = loop {
        tokio::select! {
            _ = &mut stopped => {
                let _ = conn.close().await;
                break false;
            }
            received = conn.recv() => match received {
                Ok(Some(chunk)) => match reader.write(chunk) {
                    Ok(messages) => {
                        for message in messages {
                            route_inbound(link, message);
                        }
                    }
                    Err(e) => {
                        let err = Arc::new(FramelinkError::from(e));
                        tracing::warn!(error = %err, "inbound decode failed, closing connection");
                        emit_event(&link.events, LinkEvent::Error(err));
                        let _ = conn.close().await;
                        break true;
                    }
                },
                Ok(None) => break false,
                Err(e) => {
                    let err = Arc::new(FramelinkError::from(e));
                    emit_event(&link.events, LinkEvent::Error(err));
                    break true;
                }
            }
        }
    };

    link.port.detach();
    pump.abort();
    reader.clear();
    link.connected.store(false, Ordering::SeqCst);
    tracing::info!(conn = %conn.id(), errored, "connection ended");
    errored
}

/// Dispatches one decoded inbound message.
fn route_inbound(link: &Link, message: Message) {
    tracing::debug!(
        id = %message.id,
        kind = %message.kind,
        channel = %message.channel,
        "inbound message"
    );

    // Acknowledge before any handler runs. System messages are never acked —
    // acking an ack would have both sides answering each other forever.
    if !message.kind.is_system() {
        link.writer.send(
            MessageKind::System,
            ACK_CHANNEL,
            vec![Payload::Json(Value::from(message.id.0))],
        );
    }

    match message.kind {
        MessageKind::System => match message.channel.as_str() {
            ACK_CHANNEL => match message.acked_id() {
                Some(id) => link.writer.on_ack(id),
                None => tracing::warn!(id = %message.id, "ack with a malformed payload"),
            },
            other => {
                // Reserved for future system channels.
                tracing::warn!(channel = other, "ignoring unknown system channel");
            }
        },
        MessageKind::Response => route_response(link, &message),
        MessageKind::Event | MessageKind::Binary | MessageKind::Request => {
            link.emitter.dispatch(message.clone(), &link.events);
        }
        MessageKind::Stream => {
            tracing::warn!(id = %message.id, "stream messages are reserved, ignoring");
        }
    }

    if !message.kind.is_system() {
        emit_event(&link.events, LinkEvent::Message(message));
    }
}

fn route_response(link: &Link, message: &Message) {
    let body = match message.payload_json(0).map(ResponseBody::from_value) {
        Some(Ok(body)) => body,
        Some(Err(e)) => {
            emit_event(&link.events, LinkEvent::Error(Arc::new(e.into())));
            return;
        }
        None => {
            tracing::warn!(id = %message.id, "response without a body payload");
            return;
        }
    };
    if body.success {
        link.writer
            .on_response(body.request_id, body.value.unwrap_or(Value::Null));
    } else {
        let reason = body
            .error
            .unwrap_or_else(|| GENERIC_REQUEST_ERROR.to_string());
        link.writer.on_response_error(body.request_id, reason);
    }
}

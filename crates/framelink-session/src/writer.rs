//! Outgoing message register: id stamping, acknowledgement and response
//! correlation, delivery timeouts, and resume-on-reconnect.
//!
//! Every outgoing message gets a monotonically increasing id for the
//! lifetime of the writer — across reconnects, so the remote can always tell
//! a retransmission from a new message. Reliable sends park an
//! [`OutgoingRecord`] in the register until the remote acknowledges (plain
//! messages) or responds (requests); fire-and-forget sends skip the register
//! entirely.
//!
//! The writer never touches the transport. It pushes encoded frames through
//! a narrow [`SendPort`] that the connection controller points at whatever
//! connection is currently live, and reports its own failures on an error
//! channel the controller forwards to observers.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use framelink_protocol::{encode_to_bytes, Message, MessageId, MessageKind, Payload};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

use crate::error::NetworkError;

/// The "send bytes" port the controller hands to the writer.
///
/// Implementations point at the write pump of the currently live connection
/// and fail when there is none. Keeping the port this narrow breaks the
/// controller ↔ writer ↔ transport reference cycle.
pub trait SendPort: Send + Sync + 'static {
    /// Hands one encoded frame to the live connection's write pump.
    fn push_frame(&self, frame: Bytes) -> Result<(), NetworkError>;
}

/// Per-message delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Deadline for the remote's acknowledgement. Zero disables the timer.
    /// Firing surfaces an error to observers but keeps the record — the
    /// message may still be acknowledged on a resumed session.
    pub ack_timeout: Duration,
    /// Deadline for a request's response. Zero disables the timer. Firing
    /// removes the record and rejects the completion.
    pub operation_timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::ZERO,
            operation_timeout: Duration::ZERO,
        }
    }
}

/// One-shot handle for a queued message's outcome.
///
/// Resolves with `true` when a plain message is acknowledged, with the
/// response value when a request is answered, or with a [`NetworkError`] on
/// timeout, remote failure, or connection close.
#[derive(Debug)]
pub struct Delivery {
    id: MessageId,
    rx: oneshot::Receiver<Result<Value, NetworkError>>,
}

impl Delivery {
    /// The id stamped on the queued message.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Waits for the message to settle.
    pub async fn wait(self) -> Result<Value, NetworkError> {
        match self.rx.await {
            Ok(result) => result,
            // The writer dropped the record without settling it — that is
            // the connection-closed path.
            Err(_) => Err(NetworkError::ConnectionClosed),
        }
    }
}

struct OutgoingRecord {
    message: Message,
    /// Whether the message has been handed to a connection at least once.
    sent: bool,
    acknowledged: bool,
    /// Plain messages settle on ack; requests wait for their response.
    resolve_on_ack: bool,
    completion: Option<oneshot::Sender<Result<Value, NetworkError>>>,
    options: SendOptions,
}

struct WriterInner {
    connected: bool,
    next_id: u32,
    /// Pending records in ascending id order — which is also the resume
    /// flush order.
    records: BTreeMap<MessageId, OutgoingRecord>,
    ack_timers: HashMap<MessageId, AbortHandle>,
    op_timers: HashMap<MessageId, AbortHandle>,
    port: Arc<dyn SendPort>,
    errors: mpsc::UnboundedSender<NetworkError>,
}

impl WriterInner {
    fn stamp_id(&mut self) -> MessageId {
        self.next_id += 1;
        MessageId(self.next_id)
    }

    fn cancel_all_timers(&mut self) {
        for (_, timer) in self.ack_timers.drain() {
            timer.abort();
        }
        for (_, timer) in self.op_timers.drain() {
            timer.abort();
        }
    }
}

/// Tracks outgoing messages for one logical session.
///
/// Cheap to clone; all clones share the same register. Methods never block
/// beyond a short internal lock and never await.
#[derive(Clone)]
pub struct MessageWriter {
    inner: Arc<Mutex<WriterInner>>,
}

impl MessageWriter {
    /// Creates a writer in the disconnected state.
    pub fn new(port: Arc<dyn SendPort>, errors: mpsc::UnboundedSender<NetworkError>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriterInner {
                connected: false,
                next_id: 0,
                records: BTreeMap::new(),
                ack_timers: HashMap::new(),
                op_timers: HashMap::new(),
                port,
                errors,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterInner> {
        self.inner.lock().expect("writer state lock poisoned")
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Number of unsettled records in the register.
    pub fn pending_count(&self) -> usize {
        self.lock().records.len()
    }

    /// Fire-and-forget send, used for acks and responses.
    ///
    /// Returns `false` without sending when disconnected. Transport-level
    /// push failures surface on the error channel; nothing is retried.
    pub fn send(&self, kind: MessageKind, channel: &str, payloads: Vec<Payload>) -> bool {
        let mut inner = self.lock();
        if !inner.connected {
            return false;
        }
        let id = inner.stamp_id();
        let message = Message::new(id, kind, channel, payloads);
        match encode_to_bytes(&message) {
            Ok(frame) => {
                tracing::debug!(%id, %kind, channel, "sending message");
                if let Err(e) = inner.port.push_frame(frame) {
                    let _ = inner.errors.send(e);
                }
            }
            Err(e) => {
                let _ = inner.errors.send(NetworkError::Encode(e.to_string()));
            }
        }
        true
    }

    /// Reliable send: registers the message and returns its [`Delivery`].
    ///
    /// When connected the message goes out immediately; otherwise the record
    /// waits for [`set_connection_opened`](Self::set_connection_opened) to
    /// flush it.
    pub fn queue(
        &self,
        kind: MessageKind,
        channel: &str,
        payloads: Vec<Payload>,
        options: SendOptions,
    ) -> Delivery {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        let id = inner.stamp_id();
        let message = Message::new(id, kind, channel, payloads);
        inner.records.insert(
            id,
            OutgoingRecord {
                message,
                sent: false,
                acknowledged: false,
                resolve_on_ack: kind != MessageKind::Request,
                completion: Some(tx),
                options,
            },
        );
        if inner.connected {
            self.send_record(&mut inner, id);
        } else {
            tracing::debug!(%id, %kind, channel, "queued message while disconnected");
        }
        Delivery { id, rx }
    }

    /// The remote acknowledged `id`.
    ///
    /// Plain messages settle and leave the register; requests stay until
    /// their response arrives. Re-acknowledging is a no-op.
    pub fn on_ack(&self, id: MessageId) {
        let mut inner = self.lock();
        let resolve = match inner.records.get_mut(&id) {
            Some(record) if !record.acknowledged => {
                record.acknowledged = true;
                record.resolve_on_ack
            }
            _ => return,
        };
        if let Some(timer) = inner.ack_timers.remove(&id) {
            timer.abort();
        }
        tracing::debug!(%id, "message acknowledged");
        if resolve {
            if let Some(mut record) = inner.records.remove(&id) {
                if let Some(tx) = record.completion.take() {
                    let _ = tx.send(Ok(Value::Bool(true)));
                }
            }
        }
    }

    /// The remote answered request `id` successfully.
    pub fn on_response(&self, id: MessageId, value: Value) {
        self.settle(id, Ok(value));
    }

    /// The remote's handler for request `id` failed.
    pub fn on_response_error(&self, id: MessageId, message: String) {
        self.settle(id, Err(NetworkError::Remote(message)));
    }

    fn settle(&self, id: MessageId, result: Result<Value, NetworkError>) {
        let mut inner = self.lock();
        if let Some(timer) = inner.ack_timers.remove(&id) {
            timer.abort();
        }
        if let Some(timer) = inner.op_timers.remove(&id) {
            timer.abort();
        }
        let Some(mut record) = inner.records.remove(&id) else {
            return;
        };
        tracing::debug!(%id, "request settled");
        if let Some(tx) = record.completion.take() {
            let _ = tx.send(result);
        }
    }

    /// The connection dropped without an intentional close. Timers stop;
    /// records stay for a later resume.
    pub fn set_connection_lost(&self) {
        let mut inner = self.lock();
        if !inner.connected {
            return;
        }
        inner.connected = false;
        inner.cancel_all_timers();
        tracing::info!(
            pending = inner.records.len(),
            "connection lost, retaining pending messages"
        );
    }

    /// A connection is live again.
    ///
    /// On a resumed session every pending record is re-sent so the remote
    /// can re-acknowledge; on a fresh connection only records that never
    /// left are flushed. Either way the flush runs in ascending id order.
    pub fn set_connection_opened(&self, resumed: bool) {
        let mut inner = self.lock();
        if inner.connected {
            return;
        }
        inner.connected = true;
        let flush: Vec<MessageId> = inner
            .records
            .iter()
            .filter(|(_, record)| !record.sent || resumed)
            .map(|(id, _)| *id)
            .collect();
        tracing::info!(resumed, count = flush.len(), "connection opened");
        for id in flush {
            self.send_record(&mut inner, id);
        }
    }

    /// The connection was closed for good. Timers stop and every record is
    /// dropped; their deliveries resolve to
    /// [`NetworkError::ConnectionClosed`].
    pub fn set_connection_closed(&self) {
        let mut inner = self.lock();
        inner.connected = false;
        inner.cancel_all_timers();
        let dropped = inner.records.len();
        inner.records.clear();
        if dropped > 0 {
            tracing::info!(dropped, "connection closed, dropped pending messages");
        }
    }

    /// Encodes and pushes one registered record, arming its timers.
    fn send_record(&self, inner: &mut WriterInner, id: MessageId) {
        let Some(record) = inner.records.get_mut(&id) else {
            return;
        };
        record.sent = true;
        record.acknowledged = false;
        let options = record.options;
        let is_request = !record.resolve_on_ack;
        let frame = match encode_to_bytes(&record.message) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = inner.errors.send(NetworkError::Encode(e.to_string()));
                return;
            }
        };
        tracing::debug!(%id, kind = %record.message.kind, channel = %record.message.channel, "sending queued message");

        if options.ack_timeout > Duration::ZERO {
            self.arm_ack_timer(inner, id, options.ack_timeout);
        }
        if is_request && options.operation_timeout > Duration::ZERO {
            self.arm_op_timer(inner, id, options.operation_timeout);
        }
        if let Err(e) = inner.port.push_frame(frame) {
            let _ = inner.errors.send(e);
        }
    }

    /// Ack deadline: surfaces a timeout error but keeps the record — a
    /// resumed session may still deliver the ack.
    fn arm_ack_timer(&self, inner: &mut WriterInner, id: MessageId, timeout: Duration) {
        if let Some(old) = inner.ack_timers.remove(&id) {
            old.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            ack_deadline_elapsed(&weak, id);
        });
        inner.ack_timers.insert(id, handle.abort_handle());
    }

    /// Operation deadline: removes the record and rejects its delivery.
    fn arm_op_timer(&self, inner: &mut WriterInner, id: MessageId, timeout: Duration) {
        if let Some(old) = inner.op_timers.remove(&id) {
            old.abort();
        }
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            op_deadline_elapsed(&weak, id);
        });
        inner.op_timers.insert(id, handle.abort_handle());
    }
}

fn ack_deadline_elapsed(writer: &Weak<Mutex<WriterInner>>, id: MessageId) {
    let Some(inner) = writer.upgrade() else {
        return;
    };
    let mut inner = inner.lock().expect("writer state lock poisoned");
    inner.ack_timers.remove(&id);
    // Timers are cancelled on disconnect; a firing that raced the disconnect
    // must not report on a retained record.
    if !inner.connected {
        return;
    }
    if inner.records.get(&id).is_some_and(|r| !r.acknowledged) {
        tracing::warn!(%id, "acknowledgement deadline elapsed");
        let _ = inner.errors.send(NetworkError::Timeout(id));
    }
}

fn op_deadline_elapsed(writer: &Weak<Mutex<WriterInner>>, id: MessageId) {
    let Some(inner) = writer.upgrade() else {
        return;
    };
    let mut inner = inner.lock().expect("writer state lock poisoned");
    inner.op_timers.remove(&id);
    if !inner.connected {
        return;
    }
    let Some(mut record) = inner.records.remove(&id) else {
        return;
    };
    if let Some(timer) = inner.ack_timers.remove(&id) {
        timer.abort();
    }
    tracing::warn!(%id, "operation deadline elapsed");
    if let Some(tx) = record.completion.take() {
        let _ = tx.send(Err(NetworkError::Timeout(id)));
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use framelink_protocol::decode_message;
    use serde_json::json;

    use super::*;

    /// Captures pushed frames so tests can decode and inspect them.
    struct RecordingPort {
        frames: StdMutex<Vec<Bytes>>,
        fail: StdMutex<bool>,
    }

    impl RecordingPort {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: StdMutex::new(Vec::new()),
                fail: StdMutex::new(false),
            })
        }

        fn messages(&self) -> Vec<Message> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .map(|frame| decode_message(frame).unwrap())
                .collect()
        }

        fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }
    }

    impl SendPort for RecordingPort {
        fn push_frame(&self, frame: Bytes) -> Result<(), NetworkError> {
            if *self.fail.lock().unwrap() {
                return Err(NetworkError::ConnectionClosed);
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn writer() -> (
        MessageWriter,
        Arc<RecordingPort>,
        mpsc::UnboundedReceiver<NetworkError>,
    ) {
        let port = RecordingPort::new();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        (MessageWriter::new(port.clone(), errors_tx), port, errors_rx)
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (writer, port, _errors) = writer();
        assert!(!writer.send(MessageKind::Event, "x", vec![]));
        assert!(port.messages().is_empty());

        writer.set_connection_opened(false);
        assert!(writer.send(MessageKind::Event, "x", vec![]));
        assert_eq!(port.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_ids_are_strictly_increasing() {
        let (writer, port, _errors) = writer();
        writer.set_connection_opened(false);

        writer.send(MessageKind::Event, "a", vec![]);
        let delivery = writer.queue(MessageKind::Event, "b", vec![], SendOptions::default());
        writer.send(MessageKind::System, "ack", vec![Payload::Json(json!(1))]);

        let ids: Vec<u32> = port.messages().iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(delivery.id(), MessageId(2));
    }

    #[tokio::test]
    async fn test_queue_while_disconnected_flushes_on_open() {
        let (writer, port, _errors) = writer();

        let delivery = writer.queue(
            MessageKind::Event,
            "later",
            vec![Payload::Json(json!([1]))],
            SendOptions::default(),
        );
        assert!(port.messages().is_empty());
        assert_eq!(writer.pending_count(), 1);

        writer.set_connection_opened(false);
        let sent = port.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel, "later");

        writer.on_ack(delivery.id());
        assert_eq!(delivery.wait().await.unwrap(), Value::Bool(true));
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_re_ack_is_idempotent() {
        let (writer, _port, _errors) = writer();
        writer.set_connection_opened(false);

        let delivery = writer.queue(MessageKind::Event, "e", vec![], SendOptions::default());
        let id = delivery.id();
        writer.on_ack(id);
        writer.on_ack(id);
        writer.on_ack(id);

        assert_eq!(delivery.wait().await.unwrap(), Value::Bool(true));
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_survives_ack_and_settles_on_response() {
        let (writer, _port, _errors) = writer();
        writer.set_connection_opened(false);

        let delivery =
            writer.queue(MessageKind::Request, "add", vec![], SendOptions::default());
        let id = delivery.id();

        writer.on_ack(id);
        assert_eq!(writer.pending_count(), 1, "request must wait for its response");

        writer.on_response(id, json!(5));
        assert_eq!(delivery.wait().await.unwrap(), json!(5));
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_error_rejects_with_remote() {
        let (writer, _port, _errors) = writer();
        writer.set_connection_opened(false);

        let delivery =
            writer.queue(MessageKind::Request, "add", vec![], SendOptions::default());
        writer.on_response_error(delivery.id(), "nope".into());

        assert_eq!(
            delivery.wait().await.unwrap_err(),
            NetworkError::Remote("nope".into())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_timeout_reports_error_but_keeps_record() {
        let (writer, _port, mut errors) = writer();
        writer.set_connection_opened(false);

        let delivery = writer.queue(
            MessageKind::Event,
            "slow",
            vec![],
            SendOptions {
                ack_timeout: Duration::from_millis(100),
                operation_timeout: Duration::ZERO,
            },
        );

        let err = errors.recv().await.expect("timeout error should be reported");
        assert_eq!(err, NetworkError::Timeout(delivery.id()));
        assert_eq!(writer.pending_count(), 1, "record survives an ack timeout");

        // A late ack still settles the delivery.
        writer.on_ack(delivery.id());
        assert_eq!(delivery.wait().await.unwrap(), Value::Bool(true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_rejects_and_removes_record() {
        let (writer, _port, _errors) = writer();
        writer.set_connection_opened(false);

        let delivery = writer.queue(
            MessageKind::Request,
            "slow",
            vec![],
            SendOptions {
                ack_timeout: Duration::ZERO,
                operation_timeout: Duration::from_millis(200),
            },
        );
        let id = delivery.id();

        assert_eq!(delivery.wait().await.unwrap_err(), NetworkError::Timeout(id));
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_cancels_timers() {
        let (writer, _port, mut errors) = writer();
        writer.set_connection_opened(false);

        let _delivery = writer.queue(
            MessageKind::Event,
            "e",
            vec![],
            SendOptions {
                ack_timeout: Duration::from_millis(50),
                operation_timeout: Duration::ZERO,
            },
        );
        writer.set_connection_lost();

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        assert!(errors.try_recv().is_err(), "cancelled timer must not fire");
        assert_eq!(writer.pending_count(), 1, "record is retained for resume");
    }

    #[tokio::test]
    async fn test_connection_closed_drops_records() {
        let (writer, _port, _errors) = writer();
        writer.set_connection_opened(false);

        let delivery = writer.queue(MessageKind::Event, "e", vec![], SendOptions::default());
        writer.set_connection_closed();

        assert_eq!(
            delivery.wait().await.unwrap_err(),
            NetworkError::ConnectionClosed
        );
        assert_eq!(writer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_drops_records_even_while_disconnected() {
        let (writer, _port, _errors) = writer();

        let delivery = writer.queue(MessageKind::Event, "e", vec![], SendOptions::default());
        writer.set_connection_closed();

        assert_eq!(
            delivery.wait().await.unwrap_err(),
            NetworkError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn test_resume_resends_pending_in_id_order() {
        let (writer, port, _errors) = writer();
        writer.set_connection_opened(false);

        let first = writer.queue(MessageKind::Event, "one", vec![], SendOptions::default());
        let second = writer.queue(MessageKind::Event, "two", vec![], SendOptions::default());
        assert_eq!(port.messages().len(), 2);

        writer.set_connection_lost();
        writer.set_connection_opened(true);

        let sent = port.messages();
        assert_eq!(sent.len(), 4, "both records are resent on resume");
        assert_eq!(sent[2].id, first.id());
        assert_eq!(sent[3].id, second.id());
        assert_eq!(sent[2].channel, "one");
        assert_eq!(sent[3].channel, "two");
    }

    #[tokio::test]
    async fn test_fresh_connection_only_flushes_unsent() {
        let (writer, port, _errors) = writer();
        writer.set_connection_opened(false);

        let _sent_once = writer.queue(MessageKind::Event, "sent", vec![], SendOptions::default());
        writer.set_connection_lost();
        let _parked = writer.queue(MessageKind::Event, "parked", vec![], SendOptions::default());

        writer.set_connection_opened(false);
        let messages = port.messages();
        let channels: Vec<&str> = messages.iter().map(|m| m.channel.as_str()).collect();
        // "sent" went out on the first connection only; "parked" flushed on
        // the second.
        assert_eq!(channels, vec!["sent", "parked"]);
    }

    #[tokio::test]
    async fn test_push_failure_surfaces_on_error_channel() {
        let (writer, port, mut errors) = writer();
        writer.set_connection_opened(false);
        port.set_failing(true);

        let _delivery = writer.queue(MessageKind::Event, "e", vec![], SendOptions::default());
        assert_eq!(
            errors.try_recv().unwrap(),
            NetworkError::ConnectionClosed,
            "push failures are reported, not retried"
        );
        // The record stays pending; the connection teardown settles it.
        assert_eq!(writer.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_open_when_already_connected_is_a_no_op() {
        let (writer, port, _errors) = writer();
        writer.set_connection_opened(false);
        let _delivery = writer.queue(MessageKind::Event, "e", vec![], SendOptions::default());

        writer.set_connection_opened(true);
        assert_eq!(port.messages().len(), 1, "no duplicate flush while connected");
    }
}

//! The typed send/listen facade of a link.
//!
//! Sending builds the payload shape for each message kind and queues it with
//! the configured deadlines. Listening registers async callbacks in a
//! per-kind, per-channel registry:
//!
//! - event and binary handlers: any number per channel, invoked in
//!   registration order;
//! - request handlers: at most one per channel, last registration wins.
//!
//! `once_*` variants deregister on first invocation. Handlers run on their
//! own task so a slow handler never stalls the connection's read loop, and
//! acknowledgements always go out before handlers run.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use framelink_protocol::{Message, MessageKind, Payload, ResponseBody};
use framelink_session::{Delivery, MessageWriter, SendOptions};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::LinkConfig;
use crate::error::{FramelinkError, HandlerError, RequestError};
use crate::link::{emit_event, LinkEvent};

/// The message a requester sees when a remote handler fails for any reason
/// other than a deliberate rejection.
pub(crate) const GENERIC_REQUEST_ERROR: &str = "An error occurred when handling this request";

type EventFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;
type BinaryFn =
    Arc<dyn Fn(Bytes, Vec<Value>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;
type RequestFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RequestError>> + Send + Sync>;

struct CallbackEntry<F> {
    callback: F,
    once: bool,
}

#[derive(Default)]
struct Registry {
    events: HashMap<String, Vec<CallbackEntry<EventFn>>>,
    binaries: HashMap<String, Vec<CallbackEntry<BinaryFn>>>,
    requests: HashMap<String, CallbackEntry<RequestFn>>,
}

/// Typed send/listen facade over a link's writer.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Emitter {
    registry: Arc<Mutex<Registry>>,
    writer: MessageWriter,
    ack_timeout: Duration,
    default_operation_timeout: Duration,
}

impl Emitter {
    pub(crate) fn new(writer: MessageWriter, config: &LinkConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            writer,
            ack_timeout: config.ack_timeout,
            default_operation_timeout: config.default_operation_timeout,
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().expect("handler registry lock poisoned")
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Sends an event: one JSON payload holding the argument array.
    ///
    /// The returned [`Delivery`] resolves to `true` on acknowledgement.
    pub fn send_event(&self, channel: &str, args: Vec<Value>) -> Delivery {
        self.writer.queue(
            MessageKind::Event,
            channel,
            vec![Payload::Json(Value::Array(args))],
            SendOptions {
                ack_timeout: self.ack_timeout,
                operation_timeout: Duration::ZERO,
            },
        )
    }

    /// Sends a binary event: the argument array followed by the buffer.
    pub fn send_binary(&self, channel: &str, bytes: impl Into<Bytes>, args: Vec<Value>) -> Delivery {
        self.writer.queue(
            MessageKind::Binary,
            channel,
            vec![
                Payload::Json(Value::Array(args)),
                Payload::Binary(bytes.into()),
            ],
            SendOptions {
                ack_timeout: self.ack_timeout,
                operation_timeout: Duration::ZERO,
            },
        )
    }

    /// Sends a request with the configured default operation timeout.
    ///
    /// The returned [`Delivery`] resolves to the remote handler's value.
    pub fn send_request(&self, channel: &str, args: Vec<Value>) -> Delivery {
        self.send_request_with_timeout(channel, args, self.default_operation_timeout)
    }

    /// Sends a request with an explicit operation timeout (zero disables it).
    pub fn send_request_with_timeout(
        &self,
        channel: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Delivery {
        self.writer.queue(
            MessageKind::Request,
            channel,
            vec![Payload::Json(Value::Array(args))],
            SendOptions {
                ack_timeout: self.ack_timeout,
                operation_timeout: timeout,
            },
        )
    }

    // -----------------------------------------------------------------------
    // Listening
    // -----------------------------------------------------------------------

    /// Registers an event handler. Multiple handlers per channel run in
    /// registration order.
    pub fn on_event<F, Fut>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.add_event(channel.into(), wrap_event(handler), false);
    }

    /// Registers an event handler that deregisters after one invocation.
    pub fn once_event<F, Fut>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.add_event(channel.into(), wrap_event(handler), true);
    }

    /// Removes every event handler for `channel`.
    pub fn off_event(&self, channel: &str) {
        self.registry().events.remove(channel);
    }

    /// Registers a binary handler. The buffer arrives first, then the
    /// argument array.
    pub fn on_binary<F, Fut>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Bytes, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.add_binary(channel.into(), wrap_binary(handler), false);
    }

    /// Registers a binary handler that deregisters after one invocation.
    pub fn once_binary<F, Fut>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Bytes, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.add_binary(channel.into(), wrap_binary(handler), true);
    }

    /// Removes every binary handler for `channel`.
    pub fn off_binary(&self, channel: &str) {
        self.registry().binaries.remove(channel);
    }

    /// Registers the request handler for `channel`, replacing any previous
    /// one — a request has exactly one answerer.
    pub fn on_request<F, Fut>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
    {
        self.add_request(channel.into(), wrap_request(handler), false);
    }

    /// Registers a request handler that deregisters after one invocation.
    pub fn once_request<F, Fut>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
    {
        self.add_request(channel.into(), wrap_request(handler), true);
    }

    /// Removes the request handler for `channel`.
    pub fn off_request(&self, channel: &str) {
        self.registry().requests.remove(channel);
    }

    fn add_event(&self, channel: String, callback: EventFn, once: bool) {
        self.registry()
            .events
            .entry(channel)
            .or_default()
            .push(CallbackEntry { callback, once });
    }

    fn add_binary(&self, channel: String, callback: BinaryFn, once: bool) {
        self.registry()
            .binaries
            .entry(channel)
            .or_default()
            .push(CallbackEntry { callback, once });
    }

    fn add_request(&self, channel: String, callback: RequestFn, once: bool) {
        self.registry()
            .requests
            .insert(channel, CallbackEntry { callback, once });
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Routes one inbound non-system message to its registered handlers.
    /// Called by the connection controller after the ack went out.
    pub(crate) fn dispatch(&self, message: Message, events: &broadcast::Sender<LinkEvent>) {
        match message.kind {
            MessageKind::Event => self.dispatch_event(message, events),
            MessageKind::Binary => self.dispatch_binary(message, events),
            MessageKind::Request => self.dispatch_request(message, events),
            _ => {}
        }
    }

    fn dispatch_event(&self, message: Message, events: &broadcast::Sender<LinkEvent>) {
        let Some(args) = message.args() else {
            tracing::warn!(channel = %message.channel, "event without an argument array");
            return;
        };
        let handlers = self.take_event_handlers(&message.channel);
        if handlers.is_empty() {
            tracing::debug!(channel = %message.channel, "no event handlers registered");
            return;
        }
        let events = events.clone();
        let channel = message.channel;
        tokio::spawn(async move {
            for handler in handlers {
                if let Err(reason) = handler(args.clone()).await {
                    emit_event(
                        &events,
                        LinkEvent::Error(Arc::new(FramelinkError::Handler {
                            channel: channel.clone(),
                            reason,
                        })),
                    );
                }
            }
        });
    }

    fn dispatch_binary(&self, message: Message, events: &broadcast::Sender<LinkEvent>) {
        let Some(args) = message.args() else {
            tracing::warn!(channel = %message.channel, "binary event without an argument array");
            return;
        };
        let Some(bytes) = message.payload_binary(1).cloned() else {
            tracing::warn!(channel = %message.channel, "binary event without a buffer payload");
            return;
        };
        let handlers = self.take_binary_handlers(&message.channel);
        if handlers.is_empty() {
            tracing::debug!(channel = %message.channel, "no binary handlers registered");
            return;
        }
        let events = events.clone();
        let channel = message.channel;
        tokio::spawn(async move {
            for handler in handlers {
                if let Err(reason) = handler(bytes.clone(), args.clone()).await {
                    emit_event(
                        &events,
                        LinkEvent::Error(Arc::new(FramelinkError::Handler {
                            channel: channel.clone(),
                            reason,
                        })),
                    );
                }
            }
        });
    }

    fn dispatch_request(&self, message: Message, events: &broadcast::Sender<LinkEvent>) {
        let request_id = message.id;
        let channel = message.channel.clone();
        let writer = self.writer.clone();

        let Some(args) = message.args() else {
            tracing::warn!(channel = %channel, "request without an argument array");
            respond(&writer, &channel, ResponseBody::err(request_id, GENERIC_REQUEST_ERROR));
            return;
        };

        let Some(handler) = self.take_request_handler(&channel) else {
            tracing::debug!(channel = %channel, "request for a channel with no handler");
            respond(
                &writer,
                &channel,
                ResponseBody::err(
                    request_id,
                    format!("no request handler registered for channel {channel:?}"),
                ),
            );
            return;
        };

        let events = events.clone();
        tokio::spawn(async move {
            let body = match handler(args).await {
                Ok(value) => ResponseBody::ok(request_id, value),
                Err(RequestError::Rejected(message)) => ResponseBody::err(request_id, message),
                Err(RequestError::Internal(reason)) => {
                    emit_event(
                        &events,
                        LinkEvent::Error(Arc::new(FramelinkError::Handler {
                            channel: channel.clone(),
                            reason,
                        })),
                    );
                    ResponseBody::err(request_id, GENERIC_REQUEST_ERROR)
                }
            };
            respond(&writer, &channel, body);
        });
    }

    /// Clones the handler list for one invocation round, dropping `once`
    /// entries from the registry as it goes.
    fn take_event_handlers(&self, channel: &str) -> Vec<EventFn> {
        let mut registry = self.registry();
        let Some(entries) = registry.events.get_mut(channel) else {
            return Vec::new();
        };
        let callbacks = entries.iter().map(|e| e.callback.clone()).collect();
        entries.retain(|e| !e.once);
        if entries.is_empty() {
            registry.events.remove(channel);
        }
        callbacks
    }

    fn take_binary_handlers(&self, channel: &str) -> Vec<BinaryFn> {
        let mut registry = self.registry();
        let Some(entries) = registry.binaries.get_mut(channel) else {
            return Vec::new();
        };
        let callbacks = entries.iter().map(|e| e.callback.clone()).collect();
        entries.retain(|e| !e.once);
        if entries.is_empty() {
            registry.binaries.remove(channel);
        }
        callbacks
    }

    fn take_request_handler(&self, channel: &str) -> Option<RequestFn> {
        let mut registry = self.registry();
        let entry = registry.requests.get(channel)?;
        let callback = entry.callback.clone();
        if entry.once {
            registry.requests.remove(channel);
        }
        Some(callback)
    }
}

/// Sends a response fire-and-forget; an unsent response is the requester's
/// operation timeout's problem, like any other lost message.
fn respond(writer: &MessageWriter, channel: &str, body: ResponseBody) {
    writer.send(
        MessageKind::Response,
        channel,
        vec![Payload::Json(body.to_value())],
    );
}

fn wrap_event<F, Fut>(handler: F) -> EventFn
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(handler(args)))
}

fn wrap_binary<F, Fut>(handler: F) -> BinaryFn
where
    F: Fn(Bytes, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |bytes, args| Box::pin(handler(bytes, args)))
}

fn wrap_request<F, Fut>(handler: F) -> RequestFn
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RequestError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(handler(args)))
}

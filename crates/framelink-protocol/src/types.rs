//! Core message types for Framelink's wire format.
//!
//! This module defines everything that travels "on the wire": the message
//! record itself, its payloads, and the response body carried by
//! request/response exchanges. The types here are plain data — the byte-level
//! encoding lives in [`crate::codec`].

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// A per-direction message identifier.
///
/// Each side of a link stamps its outgoing messages with a monotonically
/// increasing 32-bit id. Ids are never reused within one logical session,
/// including sessions resumed across transport reconnects — acknowledgement
/// and response correlation depend on it.
///
/// This is a newtype wrapper so an id can't be confused with any other
/// integer in a signature. `#[serde(transparent)]` makes it serialize as a
/// plain number, which is what the `ack` system payload carries.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// The kind of a message, one byte on the wire.
///
/// Only `System`, `Event`, `Binary`, `Request`, and `Response` are exercised
/// by the framework. `Stream` is reserved for a future multiplexed-stream
/// feature and is never constructed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Framework-internal messages (currently only acknowledgements).
    System,
    /// A fire-and-forget event with JSON arguments.
    Event,
    /// An event that carries an opaque byte buffer next to its arguments.
    Binary,
    /// A request expecting a `Response` on the same channel.
    Request,
    /// The answer to a `Request`, correlated by the id inside its body.
    Response,
    /// Reserved. Never sent or dispatched.
    Stream,
}

impl MessageKind {
    /// The byte representing this kind on the wire.
    pub fn wire_value(self) -> u8 {
        match self {
            MessageKind::System => 0,
            MessageKind::Event => 1,
            MessageKind::Binary => 2,
            MessageKind::Request => 3,
            MessageKind::Response => 4,
            MessageKind::Stream => 5,
        }
    }

    /// Parses a wire byte back into a kind.
    ///
    /// # Errors
    /// Returns [`ProtocolError::UnknownKind`] for any byte outside `0..=5`.
    pub fn from_wire(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(MessageKind::System),
            1 => Ok(MessageKind::Event),
            2 => Ok(MessageKind::Binary),
            3 => Ok(MessageKind::Request),
            4 => Ok(MessageKind::Response),
            5 => Ok(MessageKind::Stream),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }

    /// Whether this is a framework-internal message.
    pub fn is_system(self) -> bool {
        matches!(self, MessageKind::System)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::System => "system",
            MessageKind::Event => "event",
            MessageKind::Binary => "binary",
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Stream => "stream",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// One payload slot of a message: either a JSON value or raw bytes.
///
/// This is a sum type, not a dynamic value — callers always know which arm
/// they are holding, and the codec never has to guess.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Any JSON value, encoded as UTF-8 text behind a one-byte format marker.
    Json(Value),
    /// An opaque byte buffer, copied to the wire verbatim.
    Binary(Bytes),
}

impl Payload {
    /// Convenience constructor for a JSON payload.
    pub fn json(value: impl Into<Value>) -> Self {
        Payload::Json(value.into())
    }

    /// Convenience constructor for a binary payload.
    pub fn binary(bytes: impl Into<Bytes>) -> Self {
        Payload::Binary(bytes.into())
    }

    /// Borrows the JSON value, if this is a JSON payload.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Binary(_) => None,
        }
    }

    /// Borrows the byte buffer, if this is a binary payload.
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Payload::Json(_) => None,
            Payload::Binary(bytes) => Some(bytes),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The only system channel implemented by the framework: acknowledgements.
///
/// An ack is a `System` message on this channel whose single JSON payload is
/// the acknowledged message's id.
pub const ACK_CHANNEL: &str = "ack";

/// One message on the wire: `(id, kind, channel, payloads)`.
///
/// Channels are untyped strings at this layer; any schema enforcement is a
/// compile-time concern of strongly-typed callers and has no runtime
/// footprint here. The channel must fit in one length byte (0–255 bytes of
/// UTF-8, empty permitted) and a message carries at most 255 payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Per-direction monotonically increasing id.
    pub id: MessageId,
    /// What this message is: system, event, binary, request, or response.
    pub kind: MessageKind,
    /// Routing label for handler dispatch.
    pub channel: String,
    /// Ordered payload slots. Shape depends on `kind` — see the constructors.
    pub payloads: Vec<Payload>,
}

impl Message {
    /// Builds a message from raw parts.
    pub fn new(
        id: MessageId,
        kind: MessageKind,
        channel: impl Into<String>,
        payloads: Vec<Payload>,
    ) -> Self {
        Self {
            id,
            kind,
            channel: channel.into(),
            payloads,
        }
    }

    /// Builds the acknowledgement for `acked`: a `System` message on
    /// [`ACK_CHANNEL`] whose sole payload is the acknowledged id.
    pub fn ack(id: MessageId, acked: MessageId) -> Self {
        Self::new(
            id,
            MessageKind::System,
            ACK_CHANNEL,
            vec![Payload::Json(Value::from(acked.0))],
        )
    }

    /// Builds an `Event` message: one JSON payload holding the argument array.
    pub fn event(id: MessageId, channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(id, MessageKind::Event, channel, vec![Payload::Json(Value::Array(args))])
    }

    /// Builds a `Binary` message: a JSON argument array followed by the buffer.
    pub fn binary(
        id: MessageId,
        channel: impl Into<String>,
        bytes: Bytes,
        args: Vec<Value>,
    ) -> Self {
        Self::new(
            id,
            MessageKind::Binary,
            channel,
            vec![Payload::Json(Value::Array(args)), Payload::Binary(bytes)],
        )
    }

    /// Builds a `Request` message: one JSON payload holding the argument array.
    pub fn request(id: MessageId, channel: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(id, MessageKind::Request, channel, vec![Payload::Json(Value::Array(args))])
    }

    /// Builds the `Response` to a request. The channel mirrors the request's
    /// channel; the sole payload is the serialized [`ResponseBody`].
    pub fn response(id: MessageId, channel: impl Into<String>, body: &ResponseBody) -> Self {
        Self::new(
            id,
            MessageKind::Response,
            channel,
            vec![Payload::Json(body.to_value())],
        )
    }

    /// Borrows the JSON value in payload slot `index`, if present.
    pub fn payload_json(&self, index: usize) -> Option<&Value> {
        self.payloads.get(index).and_then(Payload::as_json)
    }

    /// Borrows the byte buffer in payload slot `index`, if present.
    pub fn payload_binary(&self, index: usize) -> Option<&Bytes> {
        self.payloads.get(index).and_then(Payload::as_binary)
    }

    /// For an ack message, the id it acknowledges.
    ///
    /// Returns `None` for anything that is not a well-formed ack.
    pub fn acked_id(&self) -> Option<MessageId> {
        if !self.kind.is_system() || self.channel != ACK_CHANNEL {
            return None;
        }
        let raw = self.payload_json(0)?.as_u64()?;
        u32::try_from(raw).ok().map(MessageId)
    }

    /// The argument array of an event, binary, or request message.
    pub fn args(&self) -> Option<Vec<Value>> {
        match self.payload_json(0)? {
            Value::Array(items) => Some(items.clone()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ResponseBody
// ---------------------------------------------------------------------------

/// The JSON object carried by a `Response` message.
///
/// Exactly one of `value`/`error` is meaningful, selected by `success`.
/// Field names are camelCase on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseBody {
    /// Id of the request this response answers.
    pub request_id: MessageId,
    /// Whether the remote handler completed successfully.
    pub success: bool,
    /// The handler's result when `success` is true.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    /// The handler's error message when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

impl ResponseBody {
    /// A successful response carrying `value`.
    pub fn ok(request_id: MessageId, value: Value) -> Self {
        Self {
            request_id,
            success: true,
            value: Some(value),
            error: None,
        }
    }

    /// A failed response carrying an error message.
    pub fn err(request_id: MessageId, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }

    /// Serializes the body into a JSON value for a `Response` payload.
    pub fn to_value(&self) -> Value {
        // A struct of numbers, bools, and strings always has a JSON form.
        serde_json::to_value(self).expect("response body is always representable as JSON")
    }

    /// Parses a body back out of a `Response` payload.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Json`] if the value doesn't have the
    /// expected shape.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_message_id_serializes_as_plain_number() {
        let json = serde_json::to_string(&MessageId(42)).unwrap();
        assert_eq!(json, "42");
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId(7).to_string(), "msg-7");
    }

    #[test]
    fn test_kind_wire_round_trip() {
        for kind in [
            MessageKind::System,
            MessageKind::Event,
            MessageKind::Binary,
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Stream,
        ] {
            assert_eq!(MessageKind::from_wire(kind.wire_value()).unwrap(), kind);
        }
    }

    #[test]
    fn test_kind_from_wire_rejects_unknown() {
        let err = MessageKind::from_wire(6).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(6)));
    }

    #[test]
    fn test_ack_message_shape() {
        let ack = Message::ack(MessageId(9), MessageId(4));
        assert_eq!(ack.kind, MessageKind::System);
        assert_eq!(ack.channel, ACK_CHANNEL);
        assert_eq!(ack.acked_id(), Some(MessageId(4)));
    }

    #[test]
    fn test_acked_id_rejects_non_ack() {
        let event = Message::event(MessageId(1), "ping", vec![json!(1)]);
        assert_eq!(event.acked_id(), None);
    }

    #[test]
    fn test_event_args_round_trip() {
        let event = Message::event(MessageId(1), "ping", vec![json!(1), json!("two")]);
        assert_eq!(event.args(), Some(vec![json!(1), json!("two")]));
    }

    #[test]
    fn test_binary_message_carries_buffer_second() {
        let msg = Message::binary(
            MessageId(2),
            "blob",
            Bytes::from_static(b"\x01\x02"),
            vec![json!("meta")],
        );
        assert_eq!(msg.args(), Some(vec![json!("meta")]));
        assert_eq!(msg.payload_binary(1).unwrap().as_ref(), b"\x01\x02");
    }

    #[test]
    fn test_response_message_wraps_body() {
        let body = ResponseBody::ok(MessageId(5), json!(3));
        let msg = Message::response(MessageId(9), "add", &body);
        assert_eq!(msg.kind, MessageKind::Response);
        assert_eq!(msg.channel, "add");
        let parsed = ResponseBody::from_value(msg.payload_json(0).unwrap()).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_response_body_json_shape_is_camel_case() {
        let body = ResponseBody::ok(MessageId(5), json!(12));
        let value = body.to_value();
        assert_eq!(value["requestId"], 5);
        assert_eq!(value["success"], true);
        assert_eq!(value["value"], 12);
        // `error` is skipped entirely when absent.
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_response_body_err_round_trip() {
        let body = ResponseBody::err(MessageId(5), "nope");
        let parsed = ResponseBody::from_value(&body.to_value()).unwrap();
        assert_eq!(parsed, body);
        assert!(parsed.value.is_none());
        assert_eq!(parsed.error.as_deref(), Some("nope"));
    }

    #[test]
    fn test_response_body_rejects_wrong_shape() {
        let result = ResponseBody::from_value(&json!({"name": "nope"}));
        assert!(result.is_err());
    }
}

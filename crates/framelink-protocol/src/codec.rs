//! Binary wire format: encoding and decoding of [`Message`]s.
//!
//! A message on the wire is:
//!
//! ```text
//! ┌────────────┬──────────┬───────┬─────────────┬──────────┬───────────────┐
//! │ 0xDD 0xF0  │ id       │ kind  │ channel_len │ channel  │ payload_count │
//! │ (2B)       │ (4B BE)  │ (1B)  │ (1B)        │ (UTF-8)  │ (1B)          │
//! └────────────┴──────────┴───────┴─────────────┴──────────┴───────────────┘
//! followed by payload_count × { kind (1B) | size (3B BE) | data (size B) }
//! ```
//!
//! JSON payloads put a one-byte format marker in front of the data: `0x00`
//! means UTF-8 JSON text. Binary payloads are copied verbatim.
//!
//! The parsing helpers here are pure functions over fixed-size slices so the
//! incremental reader can drive them one segment at a time; `decode_message`
//! composes them for whole-buffer decoding in tests and tools.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::{Message, MessageId, MessageKind, Payload};

/// The two-byte start marker opening every message.
pub const START_MARKER: [u8; 2] = [0xDD, 0xF0];

/// JSON payload format marker: UTF-8 JSON text. The only format defined.
pub const JSON_TEXT_FORMAT: u8 = 0x00;

/// Wire tag for a JSON payload slot.
pub const PAYLOAD_KIND_JSON: u8 = 0;

/// Wire tag for a binary payload slot.
pub const PAYLOAD_KIND_BINARY: u8 = 1;

/// Maximum size of one encoded payload: the size field is 24 bits.
pub const MAX_PAYLOAD_SIZE: usize = (1 << 24) - 1;

/// Maximum channel length in bytes: the length field is one byte.
pub const MAX_CHANNEL_LEN: usize = 255;

/// Maximum number of payloads per message: the count field is one byte.
pub const MAX_PAYLOAD_COUNT: usize = 255;

/// Bytes in the segment after the marker: id (4) + kind (1) + channel_len (1).
pub const PREAMBLE_SIZE: usize = 6;

/// Bytes in a payload header: kind (1) + size (3).
pub const PAYLOAD_HEADER_SIZE: usize = 4;

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes a message into `dst`.
///
/// # Errors
/// Fails if the channel exceeds 255 bytes, the message carries more than 255
/// payloads, or any payload exceeds [`MAX_PAYLOAD_SIZE`] once encoded.
pub fn encode_message(message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let channel = message.channel.as_bytes();
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(ProtocolError::ChannelTooLong(channel.len()));
    }
    if message.payloads.len() > MAX_PAYLOAD_COUNT {
        return Err(ProtocolError::TooManyPayloads(message.payloads.len()));
    }

    dst.reserve(START_MARKER.len() + PREAMBLE_SIZE + channel.len() + 1);
    dst.put_slice(&START_MARKER);
    dst.put_u32(message.id.0);
    dst.put_u8(message.kind.wire_value());
    dst.put_u8(channel.len() as u8);
    dst.put_slice(channel);
    dst.put_u8(message.payloads.len() as u8);

    for payload in &message.payloads {
        encode_payload(payload, dst)?;
    }
    Ok(())
}

/// Encodes a message into a fresh buffer.
pub fn encode_to_bytes(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    encode_message(message, &mut dst)?;
    Ok(dst.freeze())
}

fn encode_payload(payload: &Payload, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    match payload {
        Payload::Json(value) => {
            let text = serde_json::to_vec(value)?;
            let size = text.len() + 1; // format marker + text
            if size > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::PayloadTooLarge {
                    size,
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            dst.reserve(PAYLOAD_HEADER_SIZE + size);
            dst.put_u8(PAYLOAD_KIND_JSON);
            dst.put_uint(size as u64, 3);
            dst.put_u8(JSON_TEXT_FORMAT);
            dst.put_slice(&text);
        }
        Payload::Binary(bytes) => {
            if bytes.len() > MAX_PAYLOAD_SIZE {
                return Err(ProtocolError::PayloadTooLarge {
                    size: bytes.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            dst.reserve(PAYLOAD_HEADER_SIZE + bytes.len());
            dst.put_u8(PAYLOAD_KIND_BINARY);
            dst.put_uint(bytes.len() as u64, 3);
            dst.put_slice(bytes);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Segment parsers
// ---------------------------------------------------------------------------

/// The fixed-size segment following the start marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// The sender-assigned message id.
    pub id: MessageId,
    /// The message kind.
    pub kind: MessageKind,
    /// Length in bytes of the channel string that follows.
    pub channel_len: usize,
}

/// One payload slot's header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Whether the data is a JSON value or raw bytes.
    pub kind: PayloadKind,
    /// Size in bytes of the data that follows.
    pub size: usize,
}

/// Decoded form of the payload kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Format marker + UTF-8 JSON text.
    Json,
    /// Opaque bytes.
    Binary,
}

/// Validates the two start-marker bytes.
///
/// # Errors
/// Returns [`ProtocolError::InvalidFraming`] — fatal to the connection —
/// when the marker doesn't match.
pub fn check_start_marker(bytes: &[u8]) -> Result<(), ProtocolError> {
    debug_assert_eq!(bytes.len(), START_MARKER.len());
    if bytes[..2] != START_MARKER {
        return Err(ProtocolError::InvalidFraming {
            found: [bytes[0], bytes[1]],
        });
    }
    Ok(())
}

/// Parses the six bytes after the marker: id, kind, channel length.
pub fn parse_preamble(bytes: &[u8]) -> Result<Preamble, ProtocolError> {
    debug_assert_eq!(bytes.len(), PREAMBLE_SIZE);
    let id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let kind = MessageKind::from_wire(bytes[4])?;
    Ok(Preamble {
        id: MessageId(id),
        kind,
        channel_len: bytes[5] as usize,
    })
}

/// Parses the channel string plus the payload-count byte that follows it.
///
/// Expects exactly `channel_len + 1` bytes.
pub fn parse_channel_segment(bytes: &[u8]) -> Result<(String, usize), ProtocolError> {
    debug_assert!(!bytes.is_empty());
    let (channel, count) = bytes.split_at(bytes.len() - 1);
    let channel = String::from_utf8(channel.to_vec())?;
    Ok((channel, count[0] as usize))
}

/// Parses one payload header: kind tag + 24-bit big-endian size.
pub fn parse_payload_header(bytes: &[u8]) -> Result<PayloadHeader, ProtocolError> {
    debug_assert_eq!(bytes.len(), PAYLOAD_HEADER_SIZE);
    let kind = match bytes[0] {
        PAYLOAD_KIND_JSON => PayloadKind::Json,
        PAYLOAD_KIND_BINARY => PayloadKind::Binary,
        other => return Err(ProtocolError::UnknownPayloadKind(other)),
    };
    let size = ((bytes[1] as usize) << 16) | ((bytes[2] as usize) << 8) | bytes[3] as usize;
    Ok(PayloadHeader { kind, size })
}

/// Decodes one payload's data bytes according to its header kind.
///
/// # Errors
/// A JSON payload fails with [`ProtocolError::UnsupportedJsonFormat`] if its
/// format marker is not [`JSON_TEXT_FORMAT`], or with
/// [`ProtocolError::Json`] if the text doesn't parse.
pub fn decode_payload(kind: PayloadKind, data: Bytes) -> Result<Payload, ProtocolError> {
    match kind {
        PayloadKind::Binary => Ok(Payload::Binary(data)),
        PayloadKind::Json => {
            let Some((&format, text)) = data.split_first() else {
                return Err(ProtocolError::Truncated {
                    needed: 1,
                    available: 0,
                });
            };
            if format != JSON_TEXT_FORMAT {
                return Err(ProtocolError::UnsupportedJsonFormat(format));
            }
            Ok(Payload::Json(serde_json::from_slice(text)?))
        }
    }
}

// ---------------------------------------------------------------------------
// Whole-buffer decoding
// ---------------------------------------------------------------------------

/// Decodes one message from the front of `src`. Trailing bytes are ignored.
///
/// This is the strict, all-at-once counterpart of the incremental reader —
/// useful in tests and anywhere a complete frame is already in hand.
///
/// # Errors
/// Returns [`ProtocolError::Truncated`] if `src` ends before the message
/// does, or any segment parser's error for malformed bytes.
pub fn decode_message(src: &[u8]) -> Result<Message, ProtocolError> {
    let mut cursor = Cursor { src, pos: 0 };

    check_start_marker(cursor.read(START_MARKER.len())?)?;
    let preamble = parse_preamble(cursor.read(PREAMBLE_SIZE)?)?;
    let (channel, payload_count) =
        parse_channel_segment(cursor.read(preamble.channel_len + 1)?)?;

    let mut payloads = Vec::with_capacity(payload_count);
    for _ in 0..payload_count {
        let header = parse_payload_header(cursor.read(PAYLOAD_HEADER_SIZE)?)?;
        let data = Bytes::copy_from_slice(cursor.read(header.size)?);
        payloads.push(decode_payload(header.kind, data)?);
    }

    Ok(Message::new(preamble.id, preamble.kind, channel, payloads))
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn read(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let available = self.src.len() - self.pos;
        if available < n {
            return Err(ProtocolError::Truncated {
                needed: n - available,
                available,
            });
        }
        let slice = &self.src[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn round_trip(message: &Message) -> Message {
        let bytes = encode_to_bytes(message).unwrap();
        decode_message(&bytes).unwrap()
    }

    #[test]
    fn test_event_round_trip() {
        let message = Message::event(MessageId(7), "chat", vec![json!("hi"), json!(2)]);
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_binary_round_trip_preserves_bytes() {
        let message = Message::binary(
            MessageId(8),
            "blob",
            Bytes::from_static(b"\x00\xff\x10"),
            vec![json!("meta")],
        );
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_ack_round_trip() {
        let message = Message::ack(MessageId(3), MessageId(2));
        let decoded = round_trip(&message);
        assert_eq!(decoded.acked_id(), Some(MessageId(2)));
    }

    #[test]
    fn test_zero_payload_message_round_trip() {
        let message = Message::new(MessageId(1), MessageKind::Event, "bare", vec![]);
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_empty_channel_round_trip() {
        let message = Message::event(MessageId(1), "", vec![json!(null)]);
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_max_channel_round_trip() {
        let channel = "c".repeat(MAX_CHANNEL_LEN);
        let message = Message::event(MessageId(1), channel, vec![]);
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_channel_too_long_rejected_on_encode() {
        let message = Message::event(MessageId(1), "c".repeat(256), vec![]);
        let err = encode_to_bytes(&message).unwrap_err();
        assert!(matches!(err, ProtocolError::ChannelTooLong(256)));
    }

    #[test]
    fn test_empty_binary_payload_round_trip() {
        let message = Message::new(
            MessageId(1),
            MessageKind::Binary,
            "b",
            vec![Payload::Json(json!([])), Payload::Binary(Bytes::new())],
        );
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_max_size_binary_payload_round_trip() {
        let data = Bytes::from(vec![0xAB; MAX_PAYLOAD_SIZE]);
        let message = Message::new(
            MessageId(1),
            MessageKind::Binary,
            "big",
            vec![Payload::Binary(data)],
        );
        assert_eq!(round_trip(&message), message);
    }

    #[test]
    fn test_oversized_payload_rejected_on_encode() {
        let data = Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]);
        let message = Message::new(
            MessageId(1),
            MessageKind::Binary,
            "big",
            vec![Payload::Binary(data)],
        );
        let err = encode_to_bytes(&message).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn test_invalid_marker_rejected() {
        let message = Message::event(MessageId(1), "x", vec![]);
        let mut bytes = BytesMut::new();
        encode_message(&message, &mut bytes).unwrap();
        bytes[0] = 0x00;
        let err = decode_message(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidFraming { .. }));
        assert!(err.is_framing());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let message = Message::event(MessageId(1), "x", vec![]);
        let mut bytes = BytesMut::new();
        encode_message(&message, &mut bytes).unwrap();
        bytes[6] = 0x2A; // kind byte
        let err = decode_message(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(0x2A)));
        assert!(!err.is_framing());
    }

    #[test]
    fn test_unsupported_json_format_rejected() {
        let message = Message::event(MessageId(1), "x", vec![json!(1)]);
        let mut bytes = BytesMut::new();
        encode_message(&message, &mut bytes).unwrap();
        // Channel "x": payload data starts after 2+6+1+1 header and 4 payload
        // header bytes; its first byte is the format marker.
        let marker_at = 2 + PREAMBLE_SIZE + 1 + 1 + PAYLOAD_HEADER_SIZE;
        bytes[marker_at] = 0x01;
        let err = decode_message(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedJsonFormat(0x01)));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let message = Message::event(MessageId(1), "chat", vec![json!("hello")]);
        let bytes = encode_to_bytes(&message).unwrap();
        for cut in [1, 5, 9, bytes.len() - 1] {
            let err = decode_message(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, ProtocolError::Truncated { .. }), "cut at {cut}");
        }
    }

    #[test]
    fn test_payload_header_size_is_big_endian_u24() {
        let header = parse_payload_header(&[PAYLOAD_KIND_BINARY, 0x01, 0x02, 0x03]).unwrap();
        assert_eq!(header.size, 0x010203);
        assert_eq!(header.kind, PayloadKind::Binary);
    }

    #[test]
    fn test_unknown_payload_kind_rejected() {
        let err = parse_payload_header(&[9, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownPayloadKind(9)));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let first = Message::event(MessageId(1), "a", vec![]);
        let second = Message::event(MessageId(2), "b", vec![]);
        let mut bytes = BytesMut::new();
        encode_message(&first, &mut bytes).unwrap();
        encode_message(&second, &mut bytes).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), first);
    }
}

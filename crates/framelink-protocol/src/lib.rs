//! Message model and binary wire codec for Framelink.
//!
//! This crate defines the "language" both ends of a link speak: the
//! [`Message`] record with its typed [`Payload`] slots, and the
//! length-prefixed binary format that carries it over any ordered byte
//! transport. It has no I/O and no async — the session layer drives it.

mod codec;
mod error;
mod types;

pub use codec::{
    check_start_marker, decode_message, decode_payload, encode_message, encode_to_bytes,
    parse_channel_segment, parse_payload_header, parse_preamble, PayloadHeader, PayloadKind,
    Preamble, JSON_TEXT_FORMAT, MAX_CHANNEL_LEN, MAX_PAYLOAD_COUNT, MAX_PAYLOAD_SIZE,
    PAYLOAD_HEADER_SIZE, PAYLOAD_KIND_BINARY, PAYLOAD_KIND_JSON, PREAMBLE_SIZE, START_MARKER,
};
pub use error::ProtocolError;
pub use types::{Message, MessageId, MessageKind, Payload, ResponseBody, ACK_CHANNEL};

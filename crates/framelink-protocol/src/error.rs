//! Error type for the protocol layer.

/// Errors raised while encoding or decoding messages.
///
/// [`InvalidFraming`](ProtocolError::InvalidFraming) means the byte stream
/// itself is unrecognizable; everything else is a decode-class failure inside
/// an otherwise framed message. Both are fatal to a connection — once the
/// stream position is untrustworthy there is no way to find the next message
/// boundary.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The two-byte start marker was missing or wrong.
    #[error("invalid start marker {found:02x?}, expected [dd, f0]")]
    InvalidFraming { found: [u8; 2] },

    /// The message kind byte is outside the defined range.
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    /// A payload header's kind tag is outside the defined range.
    #[error("unknown payload kind {0:#04x}")]
    UnknownPayloadKind(u8),

    /// A JSON payload used a format marker other than UTF-8 text.
    #[error("unsupported json payload format {0:#04x}")]
    UnsupportedJsonFormat(u8),

    /// The channel bytes are not valid UTF-8.
    #[error("channel is not valid UTF-8")]
    InvalidChannel(#[from] std::string::FromUtf8Error),

    /// The channel string doesn't fit the one-byte length field.
    #[error("channel length {0} exceeds the 255-byte limit")]
    ChannelTooLong(usize),

    /// The message doesn't fit the one-byte payload-count field.
    #[error("message carries {0} payloads, the wire format allows 255")]
    TooManyPayloads(usize),

    /// An encoded payload doesn't fit the 24-bit size field.
    #[error("payload size {size} exceeds the {max}-byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    /// JSON text failed to serialize or parse.
    #[error("json payload error: {0}")]
    Json(#[from] serde_json::Error),

    /// The input ended before the message did (whole-buffer decoding only;
    /// the incremental reader waits for more bytes instead).
    #[error("message truncated: needed {needed} more bytes, had {available}")]
    Truncated { needed: usize, available: usize },
}

impl ProtocolError {
    /// Whether this is a framing error (stream unrecognizable) as opposed to
    /// a decode error inside a framed message.
    pub fn is_framing(&self) -> bool {
        matches!(self, ProtocolError::InvalidFraming { .. })
    }
}

//! Incremental message parser over a queue of byte buffers.
//!
//! Transports deliver bytes in whatever chunks the network produced; a
//! message boundary can land anywhere, including inside a length field. The
//! [`MessageReader`] buffers every inbound chunk and advances a parse state
//! machine one fixed-size segment at a time — each state knows exactly how
//! many bytes it needs and simply waits until the queue holds them.
//!
//! Callers push chunks with [`write`](MessageReader::write) and get back
//! every message completed by that chunk, in arrival order. A parse error is
//! fatal: the stream position can no longer be trusted, so the reader
//! discards further input until [`clear`](MessageReader::clear) resets it
//! for a new connection.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use framelink_protocol::{
    check_start_marker, decode_payload, parse_channel_segment, parse_payload_header,
    parse_preamble, Message, MessageId, MessageKind, Payload, PayloadHeader, ProtocolError,
    PAYLOAD_HEADER_SIZE, PREAMBLE_SIZE, START_MARKER,
};

/// Reassembles whole [`Message`]s from arbitrarily chunked bytes.
pub struct MessageReader {
    /// Buffers exactly as the transport delivered them, oldest first.
    queue: VecDeque<Bytes>,
    /// Total unconsumed bytes across the queue.
    queue_len: usize,
    /// Bytes already consumed from the front buffer.
    head_offset: usize,
    state: ParseState,
    /// Bumped by `clear()`. A drain never yields a message across an epoch
    /// boundary, so nothing parsed from pre-clear bytes can escape.
    generation: u64,
}

/// Where the parser is inside the current message.
enum ParseState {
    /// Expecting the two marker bytes.
    Marker,
    /// Expecting id + kind + channel length.
    Preamble,
    /// Expecting the channel string plus the payload-count byte.
    Channel { id: MessageId, kind: MessageKind, channel_len: usize },
    /// Expecting the next payload's kind + size header.
    PayloadHeader { partial: PartialMessage },
    /// Expecting the current payload's data bytes.
    PayloadData { partial: PartialMessage, header: PayloadHeader },
    /// A parse error occurred; input is discarded until `clear()`.
    Failed,
}

struct PartialMessage {
    id: MessageId,
    kind: MessageKind,
    channel: String,
    payloads: Vec<Payload>,
    remaining: usize,
}

impl MessageReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queue_len: 0,
            head_offset: 0,
            state: ParseState::Marker,
            generation: 0,
        }
    }

    /// Appends a transport chunk and returns every message it completed.
    ///
    /// An empty chunk is a no-op. After a previous error the chunk is
    /// discarded (the connection is already doomed; see module docs).
    ///
    /// # Errors
    /// [`ProtocolError::InvalidFraming`] on a bad start marker, any other
    /// [`ProtocolError`] for malformed segments. Both are fatal for the
    /// connection.
    pub fn write(&mut self, chunk: impl Into<Bytes>) -> Result<Vec<Message>, ProtocolError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        if matches!(self.state, ParseState::Failed) {
            tracing::warn!(len = chunk.len(), "discarding bytes written after a parse error");
            return Ok(Vec::new());
        }
        self.queue_len += chunk.len();
        self.queue.push_back(chunk);
        self.drain()
    }

    /// Discards all buffered bytes and any partially parsed message, and
    /// bumps the generation so nothing derived from pre-clear bytes is ever
    /// yielded. Call on every disconnect.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.queue_len = 0;
        self.head_offset = 0;
        self.state = ParseState::Marker;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Total bytes buffered but not yet consumed by the parser.
    pub fn buffered_len(&self) -> usize {
        self.queue_len
    }

    /// True when no bytes are buffered and no message is mid-parse.
    pub fn is_idle(&self) -> bool {
        self.queue_len == 0 && matches!(self.state, ParseState::Marker)
    }

    /// Runs the state machine until the queue no longer holds enough bytes
    /// for the next segment.
    fn drain(&mut self) -> Result<Vec<Message>, ProtocolError> {
        let mut out = Vec::new();
        let epoch = self.generation;
        loop {
            let needed = match &self.state {
                ParseState::Marker => START_MARKER.len(),
                ParseState::Preamble => PREAMBLE_SIZE,
                ParseState::Channel { channel_len, .. } => channel_len + 1,
                ParseState::PayloadHeader { .. } => PAYLOAD_HEADER_SIZE,
                ParseState::PayloadData { header, .. } => header.size,
                ParseState::Failed => return Ok(out),
            };
            if self.queue_len < needed {
                return Ok(out);
            }
            let segment = self.consume(needed);
            match self.step(segment) {
                Ok(Some(message)) if self.generation == epoch => out.push(message),
                Ok(_) => {}
                Err(e) => {
                    self.state = ParseState::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Advances the state machine with one complete segment.
    fn step(&mut self, segment: Bytes) -> Result<Option<Message>, ProtocolError> {
        let state = std::mem::replace(&mut self.state, ParseState::Marker);
        match state {
            ParseState::Marker => {
                check_start_marker(&segment)?;
                self.state = ParseState::Preamble;
                Ok(None)
            }
            ParseState::Preamble => {
                let preamble = parse_preamble(&segment)?;
                self.state = ParseState::Channel {
                    id: preamble.id,
                    kind: preamble.kind,
                    channel_len: preamble.channel_len,
                };
                Ok(None)
            }
            ParseState::Channel { id, kind, .. } => {
                let (channel, payload_count) = parse_channel_segment(&segment)?;
                self.finish_or_await_payload(PartialMessage {
                    id,
                    kind,
                    channel,
                    payloads: Vec::with_capacity(payload_count),
                    remaining: payload_count,
                })
            }
            ParseState::PayloadHeader { partial } => {
                let header = parse_payload_header(&segment)?;
                self.state = ParseState::PayloadData { partial, header };
                Ok(None)
            }
            ParseState::PayloadData { mut partial, header } => {
                partial.payloads.push(decode_payload(header.kind, segment)?);
                partial.remaining -= 1;
                self.finish_or_await_payload(partial)
            }
            ParseState::Failed => unreachable!("drain() returns before step() is called in the Failed state"),
        }
    }

    fn finish_or_await_payload(
        &mut self,
        partial: PartialMessage,
    ) -> Result<Option<Message>, ProtocolError> {
        if partial.remaining == 0 {
            self.state = ParseState::Marker;
            Ok(Some(Message::new(
                partial.id,
                partial.kind,
                partial.channel,
                partial.payloads,
            )))
        } else {
            self.state = ParseState::PayloadHeader { partial };
            Ok(None)
        }
    }

    /// Consumes exactly `n` bytes from the front of the queue, crossing
    /// buffer boundaries as needed.
    ///
    /// The caller has already checked availability; asking for more than is
    /// buffered is a bug in the state machine, and the assert makes it loud
    /// instead of returning short.
    fn consume(&mut self, n: usize) -> Bytes {
        assert!(
            n <= self.queue_len,
            "consume of {n} bytes with only {} buffered",
            self.queue_len
        );
        if n == 0 {
            return Bytes::new();
        }

        // Fast path: the front buffer alone can serve the request. Slicing
        // Bytes is a refcount bump, not a copy.
        let front_len = self.queue[0].len();
        if front_len - self.head_offset >= n {
            let out = self.queue[0].slice(self.head_offset..self.head_offset + n);
            self.head_offset += n;
            self.queue_len -= n;
            if self.head_offset == front_len {
                self.queue.pop_front();
                self.head_offset = 0;
            }
            return out;
        }

        // Slow path: stitch the segment together across buffers.
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let front = self.queue.front().expect("queue byte accounting broken");
            let available = front.len() - self.head_offset;
            let take = available.min(remaining);
            out.put_slice(&front[self.head_offset..self.head_offset + take]);
            self.head_offset += take;
            self.queue_len -= take;
            remaining -= take;
            if self.head_offset == front.len() {
                self.queue.pop_front();
                self.head_offset = 0;
            }
        }
        out.freeze()
    }
}

impl Default for MessageReader {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Tests
// =========================================================================

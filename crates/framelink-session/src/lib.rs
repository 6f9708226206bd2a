//! Reliable-delivery session layer for Framelink.
//!
//! Two halves, both transport-blind:
//!
//! - [`MessageReader`] — reassembles whole messages from arbitrarily chunked
//!   inbound bytes and survives connection resets via
//!   [`clear`](MessageReader::clear).
//! - [`MessageWriter`] — stamps outgoing ids, registers reliable sends until
//!   they are acknowledged or answered, enforces ack and operation deadlines,
//!   and flushes retained messages when a session resumes.
//!
//! The connection controller in the `framelink` crate wires both to a live
//! transport connection.

mod error;
mod reader;
mod writer;

pub use error::NetworkError;
pub use reader::MessageReader;
pub use writer::{Delivery, MessageWriter, SendOptions, SendPort};

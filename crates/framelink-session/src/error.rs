//! Error types for the session layer.

use framelink_protocol::MessageId;

/// Messaging-level failures surfaced to senders and link observers.
///
/// `Clone` + `PartialEq` because the same error may need to reach both a
/// pending completion and the link's error observers, and tests match on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The acknowledgement or operation deadline elapsed for `0`.
    #[error("{0} timed out waiting for acknowledgement or response")]
    Timeout(MessageId),

    /// The remote request handler reported a failure.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// The connection was closed before the message settled.
    #[error("connection closed before the message settled")]
    ConnectionClosed,

    /// An outgoing message could not be encoded.
    #[error("failed to encode outgoing message: {0}")]
    Encode(String),
}

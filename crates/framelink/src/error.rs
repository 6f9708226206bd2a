//! Unified error type for the Framelink framework.

use framelink_protocol::ProtocolError;
use framelink_session::NetworkError;
use framelink_transport::TransportError;

/// A boxed error returned by user-written handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `framelink` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant auto-generates `From` impls, so the `?`
/// operator converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum FramelinkError {
    /// A wire-format error (framing, decoding, encoding limits).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A transport-level error (connect, send, recv, accept).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A messaging-level error (timeout, remote failure, closed link).
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// A user-written event or binary handler failed.
    #[error("handler for channel {channel:?} failed: {reason}")]
    Handler {
        /// The channel whose handler failed.
        channel: String,
        /// What the handler reported.
        reason: HandlerError,
    },
}

/// How a request handler signals failure.
///
/// Only a [`Rejected`](RequestError::Rejected) message travels back to the
/// requester verbatim. Anything else — wrapped in
/// [`Internal`](RequestError::Internal) — produces a generic message on the
/// wire and surfaces the details on the link's error events instead, so
/// handler internals never leak to remote peers.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// A deliberate rejection; the message is forwarded to the requester.
    #[error("{0}")]
    Rejected(String),

    /// An internal failure; the requester sees a generic message.
    #[error("internal handler error: {0}")]
    Internal(HandlerError),
}

impl RequestError {
    /// Shorthand for a deliberate rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        RequestError::Rejected(message.into())
    }
}

impl From<HandlerError> for RequestError {
    fn from(err: HandlerError) -> Self {
        RequestError::Internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_protocol::MessageId;

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::UnknownKind(9);
        let top: FramelinkError = err.into();
        assert!(matches!(top, FramelinkError::Protocol(_)));
        assert!(top.to_string().contains("unknown message kind"));
    }

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::Closed("gone".into());
        let top: FramelinkError = err.into();
        assert!(matches!(top, FramelinkError::Transport(_)));
        assert!(top.to_string().contains("gone"));
    }

    #[test]
    fn test_from_network_error() {
        let err = NetworkError::Timeout(MessageId(3));
        let top: FramelinkError = err.into();
        assert!(matches!(top, FramelinkError::Network(_)));
    }

    #[test]
    fn test_rejected_message_is_verbatim() {
        assert_eq!(RequestError::rejected("nope").to_string(), "nope");
    }

    #[test]
    fn test_boxed_error_converts_to_internal() {
        let boxed: HandlerError = "kaput".into();
        let err: RequestError = boxed.into();
        assert!(matches!(err, RequestError::Internal(_)));
    }
}

//! Failure type shared by every transport adapter.

/// What went wrong at the byte-transport level.
///
/// Adapters fold their library-specific failures into these variants so the
/// session layer above never has to know which transport it is running on.
/// The variants mirror the lifecycle of a connection: it is established
/// (`Connect`, `Start`), carries bytes (`Write`, `Receive`), and eventually
/// goes away (`Closed`, `Shutdown`).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer is gone — whatever was in flight will never arrive. The
    /// string says how the closure was observed.
    #[error("connection closed: {0}")]
    Closed(String),

    /// An outbound connection attempt did not produce a connection. One
    /// attempt, one error; retry policy lives in the caller.
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    /// A chunk could not be handed to the wire. The connection is dead
    /// after this — adapters close themselves rather than retry.
    #[error("write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The inbound side broke mid-stream, as opposed to a clean close.
    #[error("receive failed: {0}")]
    Receive(#[source] std::io::Error),

    /// The listener could not be set up, or an incoming connection could
    /// not be completed.
    #[error("start failed: {0}")]
    Start(#[source] std::io::Error),

    /// The acceptor stopped taking connections; no more will be produced.
    #[error("transport shut down")]
    Shutdown,
}

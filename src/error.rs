use std::time::Duration;

use crate::codec;

/// Alias for a type-erased error type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced by the protocol core.
///
/// Wire-level failures close the connection; the remaining variants are
/// stream-local and never propagate across streams on the same connection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection has been closed; no further events are accepted.
    #[error("connection closed")]
    ConnectionClosed,

    /// The application emitted a message the stream cannot accept in its
    /// current state. This is a programmer error in the application.
    #[error("unexpected {message:?} message in {state} state")]
    UnexpectedMessage {
        state: &'static str,
        message: &'static str,
    },

    /// The application supplied a header that is not representable on the
    /// wire (pseudo header, illegal name, or control bytes in the value).
    #[error("invalid header supplied by the application")]
    InvalidHeader,

    #[error("malformed HTTP/1 message: {0}")]
    H1(#[from] codec::h1::ParseError),

    #[error("HTTP/2 connection error: {0}")]
    H2(#[from] codec::h2::FrameError),

    #[error("websocket protocol error: {0}")]
    Ws(#[from] codec::ws::FrameError),

    /// The application itself failed.
    #[error("application error: {0}")]
    App(#[source] BoxError),

    #[error("lifespan startup failed: {0}")]
    LifespanFailure(String),

    #[error("lifespan startup timed out after {0:?}")]
    LifespanTimeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

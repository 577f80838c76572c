//! Per-connection protocol drivers and their streams.
//!
//! Protocols and streams are synchronous state machines: they consume one
//! event at a time and push the resulting wire bytes, app-bound messages and
//! task spawns into an [`Outbox`]. The connection shell performs those
//! effects outside the protocol lock, which keeps every suspension point
//! (channel put, wire write, send-window wait, read gate) out of this layer.

pub(crate) mod events;
pub(crate) mod h1;
pub(crate) mod h2;
#[cfg(feature = "h3")]
pub mod h3;
pub(crate) mod http_stream;
pub(crate) mod ws_stream;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::asgi::{AsgiMessage, Scope};
use crate::channel::AppReceiver;
use crate::error::{BoxError, Error};
use crate::events::ConnectionEvent;
use events::ProtocolEvent;
use http_stream::HttpStream;
use ws_stream::WsStream;

/// One deferred action produced under the protocol lock.
pub(crate) enum Effect {
    Wire(ConnectionEvent),
    App {
        tx: mpsc::Sender<AsgiMessage>,
        message: AsgiMessage,
    },
    Spawn {
        stream_id: u64,
        scope: Scope,
        receiver: AppReceiver,
    },
    CanRead(bool),
}

/// Control signal instructing the connection to swap protocols.
#[derive(Debug)]
pub(crate) enum UpgradeSignal {
    H2c {
        settings: String,
        headers: Vec<(Bytes, Bytes)>,
        data: Bytes,
    },
    H2Prior {
        data: Bytes,
    },
}

#[derive(Default)]
pub(crate) struct Outbox {
    pub effects: Vec<Effect>,
    pub upgrade: Option<UpgradeSignal>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Outbox::default()
    }

    pub(crate) fn wire(&mut self, event: ConnectionEvent) {
        self.effects.push(Effect::Wire(event));
    }

    pub(crate) fn raw(&mut self, data: impl Into<Bytes>) {
        self.wire(ConnectionEvent::raw(data));
    }
}

/// Whether the wire task may keep feeding bytes or must wait for the
/// pipelining gate to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleStatus {
    Done,
    Paused,
}

/// Outcome of an application send: `Blocked` carries a wakeup for the
/// HTTP/2 send window.
pub(crate) enum SendOutcome {
    Done,
    Blocked(watch::Receiver<()>),
}

/// Output of one stream state-machine step.
#[derive(Debug, Default)]
pub(crate) struct StreamOut {
    /// Messages for this stream's app channel, in order.
    pub app: Vec<AsgiMessage>,
    /// Events handed back to the protocol for serialization.
    pub events: Vec<ProtocolEvent>,
    /// Spawn the application task with this scope.
    pub spawn: Option<(Scope, AppReceiver)>,
    /// Close the app channel after the queued messages are delivered.
    pub close_channel: bool,
}

#[derive(Debug)]
pub(crate) enum StreamKind {
    Http(HttpStream),
    Ws(WsStream),
}

impl StreamKind {
    pub(crate) fn handle(&mut self, event: ProtocolEvent) -> Result<StreamOut, Error> {
        match self {
            StreamKind::Http(stream) => stream.handle(event),
            StreamKind::Ws(stream) => stream.handle(event),
        }
    }

    pub(crate) fn app_send(&mut self, message: AsgiMessage) -> Result<StreamOut, Error> {
        match self {
            StreamKind::Http(stream) => stream.app_send(message),
            StreamKind::Ws(stream) => stream.app_send(message),
        }
    }

    pub(crate) fn app_exit(&mut self, error: Option<BoxError>) -> StreamOut {
        match self {
            StreamKind::Http(stream) => stream.app_exit(error),
            StreamKind::Ws(stream) => stream.app_exit(error),
        }
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<AsgiMessage>> {
        match self {
            StreamKind::Http(stream) => stream.sender(),
            StreamKind::Ws(stream) => stream.sender(),
        }
    }

    pub(crate) fn stream_id(&self) -> u64 {
        match self {
            StreamKind::Http(stream) => stream.stream_id(),
            StreamKind::Ws(stream) => stream.stream_id(),
        }
    }

    pub(crate) fn close_channel(&mut self) {
        match self {
            StreamKind::Http(stream) => stream.close_channel(),
            StreamKind::Ws(stream) => stream.close_channel(),
        }
    }

    pub(crate) fn is_websocket(&self) -> bool {
        matches!(self, StreamKind::Ws(_))
    }
}

/// The active protocol variant for one connection.
pub(crate) enum ProtocolDispatch {
    H1(h1::H1Protocol),
    H2(h2::H2Protocol),
}

impl ProtocolDispatch {
    pub(crate) fn handle(
        &mut self,
        event: ConnectionEvent,
        out: &mut Outbox,
    ) -> Result<HandleStatus, Error> {
        match self {
            ProtocolDispatch::H1(protocol) => protocol.handle(event, out),
            ProtocolDispatch::H2(protocol) => {
                protocol.handle(event, out)?;
                Ok(HandleStatus::Done)
            }
        }
    }

    /// Continue parsing after the pipelining gate opened.
    pub(crate) fn resume_reading(&mut self, out: &mut Outbox) -> Result<HandleStatus, Error> {
        match self {
            ProtocolDispatch::H1(protocol) => protocol.resume_reading(out),
            ProtocolDispatch::H2(_) => Ok(HandleStatus::Done),
        }
    }

    pub(crate) fn app_send(
        &mut self,
        stream_id: u64,
        message: AsgiMessage,
        out: &mut Outbox,
    ) -> Result<SendOutcome, Error> {
        match self {
            ProtocolDispatch::H1(protocol) => protocol.app_send(stream_id, message, out),
            ProtocolDispatch::H2(protocol) => protocol.app_send(stream_id, message, out),
        }
    }

    /// Retry a send that suspended on the HTTP/2 send window.
    pub(crate) fn resume_send(
        &mut self,
        stream_id: u64,
        out: &mut Outbox,
    ) -> Result<SendOutcome, Error> {
        match self {
            ProtocolDispatch::H1(_) => Ok(SendOutcome::Done),
            ProtocolDispatch::H2(protocol) => protocol.resume_send(stream_id, out),
        }
    }

    pub(crate) fn app_exit(
        &mut self,
        stream_id: u64,
        error: Option<BoxError>,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        match self {
            ProtocolDispatch::H1(protocol) => protocol.app_exit(stream_id, error, out),
            ProtocolDispatch::H2(protocol) => protocol.app_exit(stream_id, error, out),
        }
    }

    /// Begin a graceful shutdown: stop accepting streams, drain, close.
    pub(crate) fn shutdown(&mut self, out: &mut Outbox) {
        match self {
            ProtocolDispatch::H1(protocol) => protocol.shutdown(out),
            ProtocolDispatch::H2(protocol) => protocol.shutdown(out),
        }
    }

    pub(crate) fn idle(&self) -> bool {
        match self {
            ProtocolDispatch::H1(protocol) => protocol.idle(),
            ProtocolDispatch::H2(protocol) => protocol.idle(),
        }
    }

    /// Dispatch time of the oldest request still waiting for its response.
    pub(crate) fn oldest_pending_response(&self) -> Option<tokio::time::Instant> {
        match self {
            ProtocolDispatch::H1(protocol) => protocol.oldest_pending_response(),
            ProtocolDispatch::H2(protocol) => protocol.oldest_pending_response(),
        }
    }
}

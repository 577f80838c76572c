use std::net::SocketAddr;

use bytes::Bytes;

/// Events exchanged between the listener seam and a connection.
///
/// The listener feeds `RawData` and `Closed` into
/// [`Connection::handle`](crate::Connection::handle); the connection emits
/// `RawData` (bytes to write), `Updated` (idle-state notifications used to
/// arm the keep-alive timer) and `Closed` (close the transport) through the
/// injected outbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    RawData {
        data: Bytes,
        /// Peer address for datagram transports; `None` on byte streams.
        address: Option<SocketAddr>,
    },
    Updated {
        idle: bool,
    },
    Closed,
}

impl ConnectionEvent {
    pub(crate) fn raw(data: impl Into<Bytes>) -> Self {
        ConnectionEvent::RawData {
            data: data.into(),
            address: None,
        }
    }
}

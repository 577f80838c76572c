use bytes::Bytes;
use http::Method;

use crate::asgi::HttpVersion;

/// Events exchanged between a protocol and its streams.
///
/// `Request`/`Body`/`EndBody`/`Data`/`EndData` flow from the wire into a
/// stream; `Response`/`Body`/`EndBody`/`Data`/`EndData`/`StreamClosed` flow
/// from a stream back to the protocol for serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    Request {
        stream_id: u64,
        method: Method,
        raw_path: Bytes,
        http_version: HttpVersion,
        headers: Vec<(Bytes, Bytes)>,
    },
    Body {
        stream_id: u64,
        data: Bytes,
    },
    EndBody {
        stream_id: u64,
    },
    /// A websocket wire frame (already framed by the stream on the way out,
    /// raw bytes to feed the frame codec on the way in).
    Data {
        stream_id: u64,
        data: Bytes,
    },
    EndData {
        stream_id: u64,
    },
    Response {
        stream_id: u64,
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
    },
    StreamClosed {
        stream_id: u64,
    },
}

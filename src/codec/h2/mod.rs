//! HTTP/2 frame codec (RFC 9113 §4-§6) and HPACK compression.

pub(crate) mod hpack;
pub(crate) mod huffman;

pub use hpack::HpackError;

use bytes::{BufMut, Bytes, BytesMut};

pub(crate) const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub(crate) const FRAME_HEADER_LEN: usize = 9;
pub(crate) const DEFAULT_WINDOW_SIZE: u32 = 65_535;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;

pub(crate) mod setting {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
    pub const ENABLE_CONNECT_PROTOCOL: u16 = 0x8;
}

/// HTTP/2 error codes (RFC 9113 §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reason(pub u32);

impl Reason {
    pub const NO_ERROR: Reason = Reason(0x0);
    pub const PROTOCOL_ERROR: Reason = Reason(0x1);
    pub const INTERNAL_ERROR: Reason = Reason(0x2);
    pub const FLOW_CONTROL_ERROR: Reason = Reason(0x3);
    pub const FRAME_SIZE_ERROR: Reason = Reason(0x6);
    pub const REFUSED_STREAM: Reason = Reason(0x7);
    pub const CANCEL: Reason = Reason(0x8);
    pub const COMPRESSION_ERROR: Reason = Reason(0x9);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("connection preface mismatch")]
    BadPreface,
    #[error("malformed {0} frame")]
    Malformed(&'static str),
    #[error("frame larger than the negotiated maximum")]
    FrameTooLarge,
    #[error("flow control window overflow")]
    WindowOverflow,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error(transparent)]
    Hpack(#[from] HpackError),
}

impl FrameError {
    pub(crate) fn reason(&self) -> Reason {
        match self {
            FrameError::Hpack(_) => Reason::COMPRESSION_ERROR,
            FrameError::FrameTooLarge => Reason::FRAME_SIZE_ERROR,
            FrameError::WindowOverflow => Reason::FLOW_CONTROL_ERROR,
            _ => Reason::PROTOCOL_ERROR,
        }
    }
}

mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
}

mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Padding counts against flow control even though it never reaches
        /// a stream.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        fragment: Bytes,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    Reset {
        stream_id: u32,
        reason: Reason,
    },
    Settings {
        ack: bool,
        entries: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        reason: Reason,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        fragment: Bytes,
        end_headers: bool,
    },
    /// Frames with an unrecognized type are ignored (RFC 9113 §4.1).
    Unknown,
}

#[derive(Debug)]
pub(crate) struct FrameCodec {
    buf: BytesMut,
    max_frame_size: u32,
}

impl FrameCodec {
    pub(crate) fn new() -> Self {
        FrameCodec {
            buf: BytesMut::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub(crate) fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub(crate) fn receive_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Consume the client connection preface if fully buffered.
    pub(crate) fn expect_preface(&mut self) -> Result<bool, FrameError> {
        if self.buf.len() < PREFACE.len() {
            let shared = self.buf.len().min(PREFACE.len());
            if self.buf[..shared] != PREFACE[..shared] {
                return Err(FrameError::BadPreface);
            }
            return Ok(false);
        }
        if &self.buf[..PREFACE.len()] != PREFACE {
            return Err(FrameError::BadPreface);
        }
        let _ = self.buf.split_to(PREFACE.len());
        Ok(true)
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length =
            u32::from_be_bytes([0, self.buf[0], self.buf[1], self.buf[2]]) as usize;
        if length as u32 > self.max_frame_size {
            return Err(FrameError::FrameTooLarge);
        }
        if self.buf.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }
        let frame_kind = self.buf[3];
        let frame_flags = self.buf[4];
        let stream_id = u32::from_be_bytes([
            self.buf[5] & 0x7f,
            self.buf[6],
            self.buf[7],
            self.buf[8],
        ]);
        let _ = self.buf.split_to(FRAME_HEADER_LEN);
        let mut payload = self.buf.split_to(length).freeze();

        let frame = match frame_kind {
            kind::DATA => {
                if stream_id == 0 {
                    return Err(FrameError::Malformed("DATA"));
                }
                let flow_len = payload.len() as u32;
                let data = strip_padding(&mut payload, frame_flags)
                    .ok_or(FrameError::Malformed("DATA"))?;
                Frame::Data {
                    stream_id,
                    data,
                    end_stream: frame_flags & flags::END_STREAM != 0,
                    flow_len,
                }
            }
            kind::HEADERS => {
                if stream_id == 0 {
                    return Err(FrameError::Malformed("HEADERS"));
                }
                let mut fragment = strip_padding(&mut payload, frame_flags)
                    .ok_or(FrameError::Malformed("HEADERS"))?;
                if frame_flags & flags::PRIORITY != 0 {
                    if fragment.len() < 5 {
                        return Err(FrameError::Malformed("HEADERS"));
                    }
                    fragment = fragment.slice(5..);
                }
                Frame::Headers {
                    stream_id,
                    fragment,
                    end_stream: frame_flags & flags::END_STREAM != 0,
                    end_headers: frame_flags & flags::END_HEADERS != 0,
                }
            }
            kind::PRIORITY => {
                if payload.len() != 5 || stream_id == 0 {
                    return Err(FrameError::Malformed("PRIORITY"));
                }
                Frame::Priority { stream_id }
            }
            kind::RST_STREAM => {
                if payload.len() != 4 || stream_id == 0 {
                    return Err(FrameError::Malformed("RST_STREAM"));
                }
                Frame::Reset {
                    stream_id,
                    reason: Reason(u32::from_be_bytes([
                        payload[0], payload[1], payload[2], payload[3],
                    ])),
                }
            }
            kind::SETTINGS => {
                if stream_id != 0 {
                    return Err(FrameError::Malformed("SETTINGS"));
                }
                let ack = frame_flags & flags::ACK != 0;
                if ack && !payload.is_empty() {
                    return Err(FrameError::Malformed("SETTINGS"));
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameError::Malformed("SETTINGS"));
                }
                let entries = payload
                    .chunks(6)
                    .map(|chunk| {
                        (
                            u16::from_be_bytes([chunk[0], chunk[1]]),
                            u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
                        )
                    })
                    .collect();
                Frame::Settings { ack, entries }
            }
            kind::PUSH_PROMISE => Frame::PushPromise { stream_id },
            kind::PING => {
                if payload.len() != 8 || stream_id != 0 {
                    return Err(FrameError::Malformed("PING"));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Frame::Ping {
                    ack: frame_flags & flags::ACK != 0,
                    payload: data,
                }
            }
            kind::GOAWAY => {
                if payload.len() < 8 || stream_id != 0 {
                    return Err(FrameError::Malformed("GOAWAY"));
                }
                Frame::GoAway {
                    last_stream_id: u32::from_be_bytes([
                        payload[0] & 0x7f,
                        payload[1],
                        payload[2],
                        payload[3],
                    ]),
                    reason: Reason(u32::from_be_bytes([
                        payload[4], payload[5], payload[6], payload[7],
                    ])),
                }
            }
            kind::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(FrameError::Malformed("WINDOW_UPDATE"));
                }
                let increment = u32::from_be_bytes([
                    payload[0] & 0x7f,
                    payload[1],
                    payload[2],
                    payload[3],
                ]);
                if increment == 0 {
                    return Err(FrameError::Protocol("zero window increment"));
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                }
            }
            kind::CONTINUATION => {
                if stream_id == 0 {
                    return Err(FrameError::Malformed("CONTINUATION"));
                }
                Frame::Continuation {
                    stream_id,
                    fragment: payload,
                    end_headers: frame_flags & flags::END_HEADERS != 0,
                }
            }
            _ => Frame::Unknown,
        };
        Ok(Some(frame))
    }
}

fn strip_padding(payload: &mut Bytes, frame_flags: u8) -> Option<Bytes> {
    if frame_flags & flags::PADDED == 0 {
        return Some(payload.clone());
    }
    let pad_len = *payload.first()? as usize;
    if payload.len() < 1 + pad_len {
        return None;
    }
    Some(payload.slice(1..payload.len() - pad_len))
}

fn frame_header(out: &mut BytesMut, length: usize, frame_kind: u8, frame_flags: u8, stream_id: u32) {
    out.put_u8((length >> 16) as u8);
    out.put_u8((length >> 8) as u8);
    out.put_u8(length as u8);
    out.put_u8(frame_kind);
    out.put_u8(frame_flags);
    out.put_u32(stream_id & 0x7fff_ffff);
}

pub(crate) fn data_frame(stream_id: u32, data: &[u8], end_stream: bool) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
    let frame_flags = if end_stream { flags::END_STREAM } else { 0 };
    frame_header(&mut out, data.len(), kind::DATA, frame_flags, stream_id);
    out.put_slice(data);
    out.freeze()
}

/// HEADERS plus CONTINUATION frames when the block exceeds the peer's
/// maximum frame size.
pub(crate) fn headers_frames(
    stream_id: u32,
    block: &[u8],
    end_stream: bool,
    max_frame_size: u32,
) -> Vec<Bytes> {
    let max = max_frame_size as usize;
    let mut chunks = block.chunks(max.max(1)).peekable();
    let mut frames = Vec::new();
    let mut first = true;
    loop {
        let chunk = match chunks.next() {
            Some(chunk) => chunk,
            None if first => &[][..],
            None => break,
        };
        let last = chunks.peek().is_none();
        let mut frame_flags = 0;
        if last {
            frame_flags |= flags::END_HEADERS;
        }
        let frame_kind = if first {
            if end_stream {
                frame_flags |= flags::END_STREAM;
            }
            kind::HEADERS
        } else {
            kind::CONTINUATION
        };
        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + chunk.len());
        frame_header(&mut out, chunk.len(), frame_kind, frame_flags, stream_id);
        out.put_slice(chunk);
        frames.push(out.freeze());
        first = false;
        if last {
            break;
        }
    }
    frames
}

pub(crate) fn settings_frame(entries: &[(u16, u32)]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + entries.len() * 6);
    frame_header(&mut out, entries.len() * 6, kind::SETTINGS, 0, 0);
    for &(id, value) in entries {
        out.put_u16(id);
        out.put_u32(value);
    }
    out.freeze()
}

pub(crate) fn settings_ack() -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN);
    frame_header(&mut out, 0, kind::SETTINGS, flags::ACK, 0);
    out.freeze()
}

pub(crate) fn ping_frame(ack: bool, payload: [u8; 8]) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + 8);
    let frame_flags = if ack { flags::ACK } else { 0 };
    frame_header(&mut out, 8, kind::PING, frame_flags, 0);
    out.put_slice(&payload);
    out.freeze()
}

pub(crate) fn goaway_frame(last_stream_id: u32, reason: Reason) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + 8);
    frame_header(&mut out, 8, kind::GOAWAY, 0, 0);
    out.put_u32(last_stream_id & 0x7fff_ffff);
    out.put_u32(reason.0);
    out.freeze()
}

pub(crate) fn rst_frame(stream_id: u32, reason: Reason) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + 4);
    frame_header(&mut out, 4, kind::RST_STREAM, 0, stream_id);
    out.put_u32(reason.0);
    out.freeze()
}

pub(crate) fn window_update_frame(stream_id: u32, increment: u32) -> Bytes {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + 4);
    frame_header(&mut out, 4, kind::WINDOW_UPDATE, 0, stream_id);
    out.put_u32(increment & 0x7fff_ffff);
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(codec: &mut FrameCodec, frame: &Bytes) -> Frame {
        codec.receive_data(frame);
        codec.next_frame().unwrap().unwrap()
    }

    #[test]
    fn preface_detection() {
        let mut codec = FrameCodec::new();
        codec.receive_data(&PREFACE[..10]);
        assert_eq!(codec.expect_preface(), Ok(false));
        codec.receive_data(&PREFACE[10..]);
        assert_eq!(codec.expect_preface(), Ok(true));

        let mut codec = FrameCodec::new();
        codec.receive_data(b"GET / HTTP/1.1\r\n");
        assert_eq!(codec.expect_preface(), Err(FrameError::BadPreface));
    }

    #[test]
    fn data_frame_round_trip() {
        let mut codec = FrameCodec::new();
        let frame = feed(&mut codec, &data_frame(3, b"hello", true));
        assert_eq!(
            frame,
            Frame::Data {
                stream_id: 3,
                data: Bytes::from_static(b"hello"),
                end_stream: true,
                flow_len: 5,
            }
        );
    }

    #[test]
    fn padded_data_frame() {
        let mut codec = FrameCodec::new();
        // length 8 = pad_len byte + "abc" + 4 pad bytes
        let mut raw = BytesMut::new();
        frame_header(&mut raw, 8, kind::DATA, flags::PADDED, 1);
        raw.put_u8(4);
        raw.put_slice(b"abc");
        raw.put_slice(&[0; 4]);
        codec.receive_data(&raw);
        match codec.next_frame().unwrap().unwrap() {
            Frame::Data { data, flow_len, .. } => {
                assert_eq!(data.as_ref(), b"abc");
                assert_eq!(flow_len, 8);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn settings_round_trip() {
        let mut codec = FrameCodec::new();
        let frame = feed(
            &mut codec,
            &settings_frame(&[(setting::MAX_CONCURRENT_STREAMS, 100)]),
        );
        assert_eq!(
            frame,
            Frame::Settings {
                ack: false,
                entries: vec![(setting::MAX_CONCURRENT_STREAMS, 100)],
            }
        );
        let frame = feed(&mut codec, &settings_ack());
        assert_eq!(
            frame,
            Frame::Settings {
                ack: true,
                entries: vec![],
            }
        );
    }

    #[test]
    fn control_frames_round_trip() {
        let mut codec = FrameCodec::new();
        assert_eq!(
            feed(&mut codec, &ping_frame(false, *b"12345678")),
            Frame::Ping {
                ack: false,
                payload: *b"12345678",
            }
        );
        assert_eq!(
            feed(&mut codec, &goaway_frame(5, Reason::NO_ERROR)),
            Frame::GoAway {
                last_stream_id: 5,
                reason: Reason::NO_ERROR,
            }
        );
        assert_eq!(
            feed(&mut codec, &rst_frame(7, Reason::CANCEL)),
            Frame::Reset {
                stream_id: 7,
                reason: Reason::CANCEL,
            }
        );
        assert_eq!(
            feed(&mut codec, &window_update_frame(0, 1024)),
            Frame::WindowUpdate {
                stream_id: 0,
                increment: 1024,
            }
        );
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::new();
        codec.set_max_frame_size(4);
        codec.receive_data(&data_frame(1, b"hello", false));
        assert_eq!(codec.next_frame(), Err(FrameError::FrameTooLarge));
    }

    #[test]
    fn large_header_block_splits_into_continuations() {
        let block = vec![0u8; 40];
        let frames = headers_frames(1, &block, false, 16);
        assert_eq!(frames.len(), 3);
        let mut codec = FrameCodec::new();
        codec.receive_data(&frames.concat());
        assert!(matches!(
            codec.next_frame().unwrap().unwrap(),
            Frame::Headers {
                end_headers: false,
                ..
            }
        ));
        assert!(matches!(
            codec.next_frame().unwrap().unwrap(),
            Frame::Continuation {
                end_headers: false,
                ..
            }
        ));
        assert!(matches!(
            codec.next_frame().unwrap().unwrap(),
            Frame::Continuation {
                end_headers: true,
                ..
            }
        ));
    }
}

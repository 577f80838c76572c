//! Server-side RFC 6455 frame codec.
//!
//! Parses masked client frames into reassembled messages, writes unmasked
//! server frames, and applies the permessage-deflate transform (RFC 7692)
//! when negotiated. Fragment reassembly and the message size limit live
//! here; the stream layer above deals only in complete messages.

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};

use crate::asgi::WsData;

pub(crate) const WEBSOCKET_VERSION: &[u8] = b"13";
pub(crate) const ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const ABNORMAL_CLOSURE: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("malformed websocket frame")]
    Protocol,
    #[error("client frame was not masked")]
    UnmaskedFrame,
    #[error("invalid utf-8 in text payload")]
    InvalidUtf8,
    #[error("message larger than {limit} bytes")]
    MessageTooBig { limit: usize },
    #[error("invalid permessage-deflate payload")]
    Compression,
}

impl FrameError {
    /// The close code sent to the peer for this error.
    pub(crate) fn close_code(&self) -> u16 {
        match self {
            FrameError::MessageTooBig { .. } => close_code::MESSAGE_TOO_BIG,
            FrameError::InvalidUtf8 => close_code::INVALID_PAYLOAD,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum WsEvent {
    Message(WsData),
    Ping(Bytes),
    Pong(Bytes),
    Close { code: Option<u16>, reason: String },
}

mod opcode {
    pub const CONTINUATION: u8 = 0x0;
    pub const TEXT: u8 = 0x1;
    pub const BINARY: u8 = 0x2;
    pub const CLOSE: u8 = 0x8;
    pub const PING: u8 = 0x9;
    pub const PONG: u8 = 0xa;
}

/// Negotiated permessage-deflate parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DeflateConfig {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
}

struct DeflateContext {
    config: DeflateConfig,
    compress: Compress,
    decompress: Decompress,
}

impl DeflateContext {
    fn new(config: DeflateConfig) -> Self {
        DeflateContext {
            config,
            compress: Compress::new(Compression::default(), false),
            decompress: Decompress::new(false),
        }
    }

    fn deflate(&mut self, data: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut input = data;
        while !input.is_empty() {
            out.reserve(input.len().max(512));
            let before = self.compress.total_in();
            self.compress
                .compress_vec(input, &mut out, FlushCompress::None)
                .map_err(|_| FrameError::Compression)?;
            let consumed = (self.compress.total_in() - before) as usize;
            input = &input[consumed..];
        }
        loop {
            out.reserve(512);
            let len = out.len();
            self.compress
                .compress_vec(&[], &mut out, FlushCompress::Sync)
                .map_err(|_| FrameError::Compression)?;
            if out.len() == len {
                break;
            }
        }
        // A sync flush always ends with an empty stored block.
        if out.ends_with(&[0x00, 0x00, 0xff, 0xff]) {
            out.truncate(out.len() - 4);
        }
        if self.config.server_no_context_takeover {
            self.compress.reset();
        }
        Ok(out)
    }

    fn inflate(&mut self, data: &[u8], limit: usize) -> Result<Vec<u8>, FrameError> {
        let mut payload = data.to_vec();
        payload.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);
        let mut out = Vec::with_capacity(payload.len() * 2);
        let mut input = payload.as_slice();
        loop {
            if out.len() > limit {
                return Err(FrameError::MessageTooBig { limit });
            }
            out.reserve(4096);
            let before_in = self.decompress.total_in();
            let before_out = out.len();
            self.decompress
                .decompress_vec(input, &mut out, FlushDecompress::Sync)
                .map_err(|_| FrameError::Compression)?;
            let consumed = (self.decompress.total_in() - before_in) as usize;
            input = &input[consumed..];
            if input.is_empty() && out.len() == before_out {
                break;
            }
        }
        if out.len() > limit {
            return Err(FrameError::MessageTooBig { limit });
        }
        if self.config.client_no_context_takeover {
            self.decompress.reset(false);
        }
        Ok(out)
    }
}

pub(crate) struct WsCodec {
    buf: BytesMut,
    max_message_size: usize,
    deflate: Option<DeflateContext>,
    fragment_opcode: Option<u8>,
    fragment_compressed: bool,
    message: BytesMut,
    sent_close: bool,
    received_close: bool,
}

impl std::fmt::Debug for WsCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsCodec")
            .field("buffered", &self.buf.len())
            .field("sent_close", &self.sent_close)
            .field("received_close", &self.received_close)
            .finish_non_exhaustive()
    }
}

impl WsCodec {
    pub(crate) fn new(max_message_size: usize, deflate: Option<DeflateConfig>) -> Self {
        WsCodec {
            buf: BytesMut::new(),
            max_message_size,
            deflate: deflate.map(DeflateContext::new),
            fragment_opcode: None,
            fragment_compressed: false,
            message: BytesMut::new(),
            sent_close: false,
            received_close: false,
        }
    }

    pub(crate) fn receive_data(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// The peer sent a close we have not answered yet.
    pub(crate) fn remote_closing(&self) -> bool {
        self.received_close && !self.sent_close
    }

    pub(crate) fn next_event(&mut self) -> Result<Option<WsEvent>, FrameError> {
        loop {
            if self.received_close {
                return Ok(None);
            }
            let (fin, rsv1, op, payload) = match self.parse_frame()? {
                Some(frame) => frame,
                None => return Ok(None),
            };

            if op >= 0x8 {
                if !fin || payload.len() > 125 || rsv1 {
                    return Err(FrameError::Protocol);
                }
                match op {
                    opcode::CLOSE => {
                        self.received_close = true;
                        let (code, reason) = parse_close_payload(&payload)?;
                        return Ok(Some(WsEvent::Close { code, reason }));
                    }
                    opcode::PING => return Ok(Some(WsEvent::Ping(payload))),
                    opcode::PONG => return Ok(Some(WsEvent::Pong(payload))),
                    _ => return Err(FrameError::Protocol),
                }
            }

            match op {
                opcode::CONTINUATION => {
                    if self.fragment_opcode.is_none() {
                        return Err(FrameError::Protocol);
                    }
                    if rsv1 {
                        return Err(FrameError::Protocol);
                    }
                }
                opcode::TEXT | opcode::BINARY => {
                    if self.fragment_opcode.is_some() {
                        return Err(FrameError::Protocol);
                    }
                    if rsv1 && self.deflate.is_none() {
                        return Err(FrameError::Protocol);
                    }
                    self.fragment_opcode = Some(op);
                    self.fragment_compressed = rsv1;
                }
                _ => return Err(FrameError::Protocol),
            }

            if self.message.len() + payload.len() > self.max_message_size {
                return Err(FrameError::MessageTooBig {
                    limit: self.max_message_size,
                });
            }
            self.message.extend_from_slice(&payload);

            if fin {
                let op = self.fragment_opcode.take().unwrap_or(opcode::BINARY);
                let compressed = std::mem::take(&mut self.fragment_compressed);
                let raw = self.message.split().freeze();
                let data = if compressed {
                    let deflate = self.deflate.as_mut().ok_or(FrameError::Protocol)?;
                    Bytes::from(deflate.inflate(&raw, self.max_message_size)?)
                } else {
                    raw
                };
                let message = if op == opcode::TEXT {
                    let text = String::from_utf8(data.to_vec())
                        .map_err(|_| FrameError::InvalidUtf8)?;
                    WsData::Text(text)
                } else {
                    WsData::Binary(data)
                };
                return Ok(Some(WsEvent::Message(message)));
            }
        }
    }

    /// Parse one complete frame off the buffer, unmasking the payload.
    fn parse_frame(&mut self) -> Result<Option<(bool, bool, u8, Bytes)>, FrameError> {
        if self.buf.len() < 2 {
            return Ok(None);
        }
        let b0 = self.buf[0];
        let b1 = self.buf[1];
        if b0 & 0x30 != 0 {
            // rsv2/rsv3 are never negotiated
            return Err(FrameError::Protocol);
        }
        let masked = b1 & 0x80 != 0;
        if !masked {
            return Err(FrameError::UnmaskedFrame);
        }

        let mut offset = 2;
        let len7 = (b1 & 0x7f) as u64;
        let length = match len7 {
            126 => {
                if self.buf.len() < offset + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as u64;
                offset += 2;
                len
            }
            127 => {
                if self.buf.len() < offset + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.buf[2..10]);
                offset += 8;
                let len = u64::from_be_bytes(raw);
                if len & (1 << 63) != 0 {
                    return Err(FrameError::Protocol);
                }
                len
            }
            len => len,
        };
        if length > (self.max_message_size as u64).saturating_add(14) {
            return Err(FrameError::MessageTooBig {
                limit: self.max_message_size,
            });
        }
        let length = length as usize;
        if self.buf.len() < offset + 4 + length {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&self.buf[offset..offset + 4]);
        offset += 4;

        let _ = self.buf.split_to(offset);
        let mut payload = self.buf.split_to(length);
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }

        let fin = b0 & 0x80 != 0;
        let rsv1 = b0 & 0x40 != 0;
        let op = b0 & 0x0f;
        Ok(Some((fin, rsv1, op, payload.freeze())))
    }

    pub(crate) fn text_frame(&mut self, text: &str) -> Result<Bytes, FrameError> {
        self.data_frame(opcode::TEXT, text.as_bytes())
    }

    pub(crate) fn binary_frame(&mut self, data: &[u8]) -> Result<Bytes, FrameError> {
        self.data_frame(opcode::BINARY, data)
    }

    fn data_frame(&mut self, op: u8, payload: &[u8]) -> Result<Bytes, FrameError> {
        match self.deflate.as_mut() {
            Some(deflate) => {
                let compressed = deflate.deflate(payload)?;
                Ok(serialize_frame(op, &compressed, true))
            }
            None => Ok(serialize_frame(op, payload, false)),
        }
    }

    pub(crate) fn close_frame(&mut self, code: u16, reason: &str) -> Bytes {
        self.sent_close = true;
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        serialize_frame(opcode::CLOSE, &payload, false)
    }

    pub(crate) fn pong_frame(&self, payload: &[u8]) -> Bytes {
        serialize_frame(opcode::PONG, payload, false)
    }
}

fn parse_close_payload(payload: &[u8]) -> Result<(Option<u16>, String), FrameError> {
    match payload.len() {
        0 => Ok((None, String::new())),
        1 => Err(FrameError::Protocol),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| FrameError::InvalidUtf8)?
                .to_owned();
            Ok((Some(code), reason))
        }
    }
}

/// Serialize one unmasked server frame.
fn serialize_frame(op: u8, payload: &[u8], rsv1: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 10);
    let mut b0 = 0x80 | op;
    if rsv1 {
        b0 |= 0x40;
    }
    buf.put_u8(b0);
    if payload.len() < 126 {
        buf.put_u8(payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        buf.put_u8(126);
        buf.put_u16(payload.len() as u16);
    } else {
        buf.put_u8(127);
        buf.put_u64(payload.len() as u64);
    }
    buf.put_slice(payload);
    buf.freeze()
}

/// `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn accept_key(key: &[u8]) -> String {
    use base64::engine::Engine as _;
    use sha1::{Digest, Sha1};

    let mut sha1 = Sha1::default();
    sha1.update(key);
    sha1.update(ACCEPT_GUID);
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masked_frame(b0: u8, payload: &[u8]) -> Vec<u8> {
        // Zero mask key keeps the payload readable in the vectors.
        let mut frame = vec![b0];
        assert!(payload.len() < 126);
        frame.push(0x80 | payload.len() as u8);
        frame.extend_from_slice(&[0, 0, 0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn decodes_masked_text_frame() {
        // RFC 6455 §5.7: masked "Hello"
        let mut codec = WsCodec::new(1024, None);
        codec.receive_data(&[
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ]);
        assert_eq!(
            codec.next_event().unwrap(),
            Some(WsEvent::Message(WsData::Text("Hello".into())))
        );
        assert_eq!(codec.next_event().unwrap(), None);
    }

    #[test]
    fn reassembles_fragments() {
        let mut codec = WsCodec::new(1024, None);
        codec.receive_data(&masked_frame(0x01, b"Hel"));
        codec.receive_data(&masked_frame(0x80, b"lo"));
        assert_eq!(
            codec.next_event().unwrap(),
            Some(WsEvent::Message(WsData::Text("Hello".into())))
        );
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let mut codec = WsCodec::new(1024, None);
        codec.receive_data(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
        assert_eq!(codec.next_event(), Err(FrameError::UnmaskedFrame));
    }

    #[test]
    fn answers_ping_and_parses_close() {
        let mut codec = WsCodec::new(1024, None);
        codec.receive_data(&masked_frame(0x89, b"hi"));
        assert_eq!(
            codec.next_event().unwrap(),
            Some(WsEvent::Ping(Bytes::from_static(b"hi")))
        );
        assert_eq!(codec.pong_frame(b"hi").as_ref(), &[0x8a, 0x02, b'h', b'i']);

        codec.receive_data(&masked_frame(0x88, &[0x03, 0xe8]));
        assert_eq!(
            codec.next_event().unwrap(),
            Some(WsEvent::Close {
                code: Some(close_code::NORMAL),
                reason: String::new()
            })
        );
        assert!(codec.remote_closing());
    }

    #[test]
    fn enforces_message_size_limit() {
        let mut codec = WsCodec::new(4, None);
        codec.receive_data(&masked_frame(0x82, b"toolarge"));
        assert_eq!(
            codec.next_event(),
            Err(FrameError::MessageTooBig { limit: 4 })
        );
    }

    #[test]
    fn serializes_server_text_frame() {
        let mut codec = WsCodec::new(1024, None);
        let frame = codec.text_frame("hi").unwrap();
        assert_eq!(frame.as_ref(), &[0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let mut codec = WsCodec::new(1024, None);
        let frame = codec.close_frame(close_code::MESSAGE_TOO_BIG, "");
        assert_eq!(frame.as_ref(), &[0x88, 0x02, 0x03, 0xf1]);
    }

    #[test]
    fn permessage_deflate_round_trip() {
        let mut server = WsCodec::new(1024, Some(DeflateConfig::default()));
        let frame = server.text_frame("compressed payload").unwrap();
        assert_eq!(frame[0], 0x81 | 0x40);

        // Re-mask the frame as a client would and feed it back through a
        // fresh codec.
        let mut client_side = WsCodec::new(1024, Some(DeflateConfig::default()));
        let payload = &frame[2..];
        let mut reframed = vec![frame[0], 0x80 | payload.len() as u8, 0, 0, 0, 0];
        reframed.extend_from_slice(payload);
        client_side.receive_data(&reframed);
        assert_eq!(
            client_side.next_event().unwrap(),
            Some(WsEvent::Message(WsData::Text("compressed payload".into())))
        );
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        let mut codec = WsCodec::new(1024, None);
        codec.receive_data(&masked_frame(0x81, &[0xff, 0xfe]));
        assert_eq!(codec.next_event(), Err(FrameError::InvalidUtf8));
    }
}

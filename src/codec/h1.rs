//! Incremental HTTP/1.1 request parser and response serializer.
//!
//! Parsing of the request head is delegated to `httparse`; body framing
//! (content-length and chunked) and response serialization live here.

use bytes::{BufMut, Bytes, BytesMut};
use http::Method;

use crate::asgi::HttpVersion;

const MAX_HEADERS: usize = 128;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request head")]
    BadRequest,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("invalid content-length header")]
    InvalidContentLength,
    #[error("invalid chunked encoding")]
    InvalidChunk,
    #[error("incomplete request head larger than {limit} bytes")]
    HeaderOverflow { limit: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: Bytes,
    pub version: HttpVersion,
    /// Lower-cased names, original values.
    pub headers: Vec<(Bytes, Bytes)>,
}

impl RequestHead {
    pub(crate) fn header(&self, name: &[u8]) -> Option<&Bytes> {
        crate::headers::header_value(&self.headers, name)
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum H1Event {
    Head(RequestHead),
    Body(Bytes),
    EndBody,
}

#[derive(Debug)]
enum ParseState {
    Head,
    Body(BodyFraming),
    Done,
}

#[derive(Debug)]
enum BodyFraming {
    Length(u64),
    Chunked(ChunkState),
}

#[derive(Debug)]
enum ChunkState {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailers,
}

/// Request-side parser for one connection. After a request completes the
/// parser holds any pipelined bytes until [`H1Parser::start_next_cycle`].
#[derive(Debug)]
pub(crate) struct H1Parser {
    buf: BytesMut,
    state: ParseState,
    max_incomplete: usize,
}

impl H1Parser {
    pub(crate) fn new(max_incomplete: usize) -> Self {
        H1Parser {
            buf: BytesMut::new(),
            state: ParseState::Head,
            max_incomplete,
        }
    }

    pub(crate) fn feed(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.buf.extend_from_slice(data);
        if matches!(self.state, ParseState::Head) && self.buf.len() > self.max_incomplete {
            return Err(ParseError::HeaderOverflow {
                limit: self.max_incomplete,
            });
        }
        Ok(())
    }

    /// Everything currently buffered, consuming it. Used by the upgrade
    /// paths to hand leftover bytes to the next protocol.
    pub(crate) fn take_buffer(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    pub(crate) fn buffer_starts_with(&self, prefix: &[u8]) -> bool {
        self.buf.len() >= prefix.len() && &self.buf[..prefix.len()] == prefix
    }

    pub(crate) fn has_buffered(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Whether the current request's body has been fully received.
    pub(crate) fn request_complete(&self) -> bool {
        matches!(self.state, ParseState::Done)
    }

    /// Reset for the next pipelined request, keeping buffered bytes.
    pub(crate) fn start_next_cycle(&mut self) {
        debug_assert!(matches!(self.state, ParseState::Done));
        self.state = ParseState::Head;
    }

    pub(crate) fn next_event(&mut self) -> Result<Option<H1Event>, ParseError> {
        match &mut self.state {
            ParseState::Head => self.parse_head(),
            ParseState::Body(_) => self.parse_body(),
            ParseState::Done => Ok(None),
        }
    }

    fn parse_head(&mut self) -> Result<Option<H1Event>, ParseError> {
        // Tolerate CRLF between pipelined requests.
        while self.buf.first() == Some(&b'\r') || self.buf.first() == Some(&b'\n') {
            let _ = self.buf.split_to(1);
        }
        if self.buf.is_empty() {
            return Ok(None);
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let status = request
            .parse(&self.buf)
            .map_err(|_| ParseError::BadRequest)?;
        let head_len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let method =
            Method::from_bytes(request.method.ok_or(ParseError::BadRequest)?.as_bytes())
                .map_err(|_| ParseError::BadRequest)?;
        let version = match request.version {
            Some(0) => HttpVersion::H10,
            Some(1) => HttpVersion::H11,
            _ => return Err(ParseError::UnsupportedVersion),
        };
        let target = Bytes::copy_from_slice(
            request.path.ok_or(ParseError::BadRequest)?.as_bytes(),
        );
        let parsed: Vec<(Bytes, Bytes)> = request
            .headers
            .iter()
            .map(|header| {
                (
                    crate::headers::lowercase(header.name.as_bytes()),
                    Bytes::copy_from_slice(header.value),
                )
            })
            .collect();
        let _ = self.buf.split_to(head_len);

        let head = RequestHead {
            method,
            target,
            version,
            headers: parsed,
        };
        self.state = ParseState::Body(body_framing(&head)?);
        Ok(Some(H1Event::Head(head)))
    }

    fn parse_body(&mut self) -> Result<Option<H1Event>, ParseError> {
        let framing = match &mut self.state {
            ParseState::Body(framing) => framing,
            _ => unreachable!(),
        };
        match framing {
            BodyFraming::Length(remaining) => {
                if *remaining == 0 {
                    self.state = ParseState::Done;
                    return Ok(Some(H1Event::EndBody));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(self.buf.len() as u64) as usize;
                *remaining -= take as u64;
                let data = self.buf.split_to(take).freeze();
                Ok(Some(H1Event::Body(data)))
            }
            BodyFraming::Chunked(chunk_state) => loop {
                match chunk_state {
                    ChunkState::Size => {
                        let line_end = match find_crlf(&self.buf) {
                            Some(at) => at,
                            None => return Ok(None),
                        };
                        let line = self.buf.split_to(line_end + 2);
                        let size_part = line[..line_end]
                            .split(|&b| b == b';')
                            .next()
                            .ok_or(ParseError::InvalidChunk)?;
                        let size = parse_hex(size_part)?;
                        if size == 0 {
                            *chunk_state = ChunkState::Trailers;
                        } else {
                            *chunk_state = ChunkState::Data { remaining: size };
                        }
                    }
                    ChunkState::Data { remaining } => {
                        if self.buf.is_empty() {
                            return Ok(None);
                        }
                        let take = (*remaining).min(self.buf.len() as u64) as usize;
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *chunk_state = ChunkState::DataCrlf;
                        }
                        let data = self.buf.split_to(take).freeze();
                        return Ok(Some(H1Event::Body(data)));
                    }
                    ChunkState::DataCrlf => {
                        if self.buf.len() < 2 {
                            return Ok(None);
                        }
                        if &self.buf[..2] != b"\r\n" {
                            return Err(ParseError::InvalidChunk);
                        }
                        let _ = self.buf.split_to(2);
                        *chunk_state = ChunkState::Size;
                    }
                    ChunkState::Trailers => {
                        let line_end = match find_crlf(&self.buf) {
                            Some(at) => at,
                            None => return Ok(None),
                        };
                        let line = self.buf.split_to(line_end + 2);
                        if line_end == 0 {
                            self.state = ParseState::Done;
                            return Ok(Some(H1Event::EndBody));
                        }
                        let _ = line;
                    }
                }
            },
        }
    }
}

fn body_framing(head: &RequestHead) -> Result<BodyFraming, ParseError> {
    if let Some(te) = head.header(b"transfer-encoding") {
        let tokens = crate::headers::split_comma_header(te);
        if tokens.iter().any(|t| t.eq_ignore_ascii_case("chunked")) {
            return Ok(BodyFraming::Chunked(ChunkState::Size));
        }
        return Err(ParseError::BadRequest);
    }
    if let Some(length) = head.header(b"content-length") {
        let length = std::str::from_utf8(length)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .ok_or(ParseError::InvalidContentLength)?;
        return Ok(BodyFraming::Length(length));
    }
    // A request without a declared body has an immediately complete body.
    Ok(BodyFraming::Length(0))
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_hex(digits: &[u8]) -> Result<u64, ParseError> {
    let text = std::str::from_utf8(digits)
        .map_err(|_| ParseError::InvalidChunk)?
        .trim();
    if text.is_empty() {
        return Err(ParseError::InvalidChunk);
    }
    u64::from_str_radix(text, 16).map_err(|_| ParseError::InvalidChunk)
}

/// How an outgoing response body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    /// No body bytes follow the head (HEAD requests, 1xx/204/304).
    None,
    ContentLength,
    Chunked,
    UntilClose,
}

/// `HTTP/1.1 {status} \r\n` followed by the header block. No reason phrase
/// is emitted.
pub(crate) fn serialize_response_head(status: u16, headers: &[(Bytes, Bytes)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + headers.len() * 32);
    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.to_string().as_bytes());
    buf.put_slice(b" \r\n");
    for (name, value) in headers {
        buf.put_slice(name);
        buf.put_slice(b": ");
        buf.put_slice(value);
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub(crate) fn serialize_chunk(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + 16);
    buf.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

pub(crate) const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

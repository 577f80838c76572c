use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::Method;

use crate::asgi::AsgiMessage;
use crate::codec::h1::{
    serialize_chunk, serialize_response_head, H1Event, H1Parser, ResponseFraming,
    CHUNKED_TERMINATOR,
};
use crate::config::Config;
use crate::error::{BoxError, Error};
use crate::events::ConnectionEvent;
use crate::headers::{header_contains_token, header_eq, header_value, response_headers, suppress_body};
use crate::protocol::events::ProtocolEvent;
use crate::protocol::http_stream::HttpStream;
use crate::protocol::ws_stream::WsStream;
use crate::protocol::{Effect, HandleStatus, Outbox, SendOutcome, StreamKind, UpgradeSignal};
use crate::worker::WorkerContext;

/// The HTTP/2 preface never parses as an HTTP/1 request; its first line
/// marks a prior-knowledge client.
const PRIOR_KNOWLEDGE_PREFIX: &[u8] = b"PRI * HTTP/2.0\r\n";

/// HTTP/1.1 protocol driver: one parser, one active stream, strict
/// pipelining order.
pub(crate) struct H1Protocol {
    config: Arc<Config>,
    context: WorkerContext,
    ssl: bool,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    parser: H1Parser,
    stream: Option<StreamKind>,
    next_stream_id: u64,
    request_method: Option<Method>,
    keep_alive: bool,
    waiting_for_100: bool,
    response_started: bool,
    response_framing: Option<ResponseFraming>,
    websocket_passthrough: bool,
    pending_response_since: Option<tokio::time::Instant>,
    closed: bool,
}

impl H1Protocol {
    pub(crate) fn new(
        config: Arc<Config>,
        context: WorkerContext,
        ssl: bool,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
    ) -> Self {
        let parser = H1Parser::new(config.h1_max_incomplete_size);
        H1Protocol {
            config,
            context,
            ssl,
            client,
            server,
            parser,
            stream: None,
            next_stream_id: 0,
            request_method: None,
            keep_alive: true,
            waiting_for_100: false,
            response_started: false,
            response_framing: None,
            websocket_passthrough: false,
            pending_response_since: None,
            closed: false,
        }
    }

    pub(crate) fn idle(&self) -> bool {
        self.stream.is_none()
    }

    pub(crate) fn oldest_pending_response(&self) -> Option<tokio::time::Instant> {
        self.pending_response_since
    }

    pub(crate) fn handle(
        &mut self,
        event: ConnectionEvent,
        out: &mut Outbox,
    ) -> Result<HandleStatus, Error> {
        match event {
            ConnectionEvent::RawData { data, .. } => {
                if self.closed {
                    return Ok(HandleStatus::Done);
                }
                if self.websocket_passthrough {
                    if let Some(stream_id) = self.stream.as_ref().map(StreamKind::stream_id) {
                        self.deliver(ProtocolEvent::Data { stream_id, data }, out)?;
                    }
                    return Ok(HandleStatus::Done);
                }
                if let Err(error) = self.parser.feed(&data) {
                    tracing::debug!(target: "tricorn::h1", %error, "rejecting request head");
                    self.emit_error_response(out);
                    return Ok(HandleStatus::Done);
                }
                self.poll_events(out)
            }
            ConnectionEvent::Closed => {
                self.close_stream(out)?;
                self.closed = true;
                Ok(HandleStatus::Done)
            }
            ConnectionEvent::Updated { .. } => Ok(HandleStatus::Done),
        }
    }

    pub(crate) fn resume_reading(&mut self, out: &mut Outbox) -> Result<HandleStatus, Error> {
        if self.closed || self.websocket_passthrough {
            return Ok(HandleStatus::Done);
        }
        self.poll_events(out)
    }

    pub(crate) fn app_send(
        &mut self,
        stream_id: u64,
        message: AsgiMessage,
        out: &mut Outbox,
    ) -> Result<SendOutcome, Error> {
        let sout = match self.stream.as_mut() {
            Some(stream) if stream.stream_id() == stream_id => stream.app_send(message)?,
            // The exchange is already over; late sends are dropped.
            _ => return Ok(SendOutcome::Done),
        };
        self.process_stream_out(sout, out)?;
        Ok(SendOutcome::Done)
    }

    pub(crate) fn app_exit(
        &mut self,
        stream_id: u64,
        error: Option<BoxError>,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        let sout = match self.stream.as_mut() {
            Some(stream) if stream.stream_id() == stream_id => stream.app_exit(error),
            _ => return Ok(()),
        };
        self.process_stream_out(sout, out)
    }

    pub(crate) fn shutdown(&mut self, out: &mut Outbox) {
        if self.closed {
            return;
        }
        if self.stream.is_none() {
            out.wire(ConnectionEvent::Closed);
            self.closed = true;
        } else {
            // Drain the in-flight exchange, then close instead of recycling.
            self.keep_alive = false;
        }
    }

    fn poll_events(&mut self, out: &mut Outbox) -> Result<HandleStatus, Error> {
        loop {
            if self.closed || out.upgrade.is_some() {
                return Ok(HandleStatus::Done);
            }
            if self.stream.is_some() && self.parser.request_complete() {
                // Pipelined bytes wait until the active stream closes.
                if self.parser.has_buffered() {
                    return Ok(HandleStatus::Paused);
                }
                return Ok(HandleStatus::Done);
            }
            match self.parser.next_event() {
                Ok(Some(H1Event::Head(head))) => {
                    self.handle_head(head, out)?;
                }
                Ok(Some(H1Event::Body(data))) => {
                    self.waiting_for_100 = false;
                    if let Some(stream_id) = self.stream.as_ref().map(StreamKind::stream_id) {
                        self.deliver(ProtocolEvent::Body { stream_id, data }, out)?;
                    }
                }
                Ok(Some(H1Event::EndBody)) => {
                    self.waiting_for_100 = false;
                    if let Some(stream_id) = self.stream.as_ref().map(StreamKind::stream_id) {
                        self.deliver(ProtocolEvent::EndBody { stream_id }, out)?;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    if self.parser.buffer_starts_with(PRIOR_KNOWLEDGE_PREFIX) {
                        out.upgrade = Some(UpgradeSignal::H2Prior {
                            data: self.parser.take_buffer(),
                        });
                        return Ok(HandleStatus::Done);
                    }
                    tracing::debug!(target: "tricorn::h1", %error, "malformed request");
                    self.emit_error_response(out);
                    return Ok(HandleStatus::Done);
                }
            }
        }
        if self.waiting_for_100 && !self.response_started {
            out.raw(serialize_response_head(
                100,
                &response_headers(
                    self.context.clock(),
                    "h1",
                    self.config.include_server_header,
                ),
            ));
            self.waiting_for_100 = false;
        }
        Ok(HandleStatus::Done)
    }

    fn handle_head(
        &mut self,
        head: crate::codec::h1::RequestHead,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        // h2c upgrade: answer 101 and hand the connection to HTTP/2 with
        // the request replayed as stream one.
        if header_eq(&head.headers, b"upgrade", "h2c") {
            if let Some(settings) = head.header(b"http2-settings").cloned() {
                let mut headers =
                    vec![(Bytes::from_static(b"upgrade"), Bytes::from_static(b"h2c"))];
                headers.extend(response_headers(
                    self.context.clock(),
                    "h1",
                    self.config.include_server_header,
                ));
                out.raw(serialize_response_head(101, &headers));

                let authority = head
                    .header(b"host")
                    .cloned()
                    .unwrap_or_else(Bytes::new);
                let mut pseudo = vec![
                    (
                        Bytes::from_static(b":method"),
                        Bytes::copy_from_slice(head.method.as_str().as_bytes()),
                    ),
                    (Bytes::from_static(b":path"), head.target.clone()),
                    (Bytes::from_static(b":authority"), authority),
                ];
                pseudo.extend(head.headers.iter().cloned());
                out.upgrade = Some(UpgradeSignal::H2c {
                    settings: String::from_utf8_lossy(&settings).into_owned(),
                    headers: pseudo,
                    data: self.parser.take_buffer(),
                });
                return Ok(());
            }
        }

        self.keep_alive = match head.version {
            crate::asgi::HttpVersion::H11 => {
                !header_contains_token(&head.headers, b"connection", "close")
            }
            _ => header_contains_token(&head.headers, b"connection", "keep-alive"),
        };
        self.waiting_for_100 = head
            .header(b"expect")
            .map(|value| value.eq_ignore_ascii_case(b"100-continue"))
            .unwrap_or(false);
        self.request_method = Some(head.method.clone());
        self.response_started = false;
        self.response_framing = None;

        self.next_stream_id += 1;
        let stream_id = self.next_stream_id;
        let websocket =
            head.method == Method::GET && header_eq(&head.headers, b"upgrade", "websocket");
        let stream = if websocket {
            StreamKind::Ws(WsStream::new(
                self.config.clone(),
                self.context.clone(),
                self.ssl,
                self.client,
                self.server,
                stream_id,
            ))
        } else {
            StreamKind::Http(HttpStream::new(
                self.config.clone(),
                self.context.clone(),
                self.ssl,
                self.client,
                self.server,
                stream_id,
            ))
        };
        self.stream = Some(stream);
        self.pending_response_since = Some(tokio::time::Instant::now());
        out.wire(ConnectionEvent::Updated { idle: false });
        out.effects.push(Effect::CanRead(false));

        self.deliver(
            ProtocolEvent::Request {
                stream_id,
                method: head.method,
                raw_path: head.target,
                http_version: head.version,
                headers: head.headers,
            },
            out,
        )
    }

    fn deliver(&mut self, event: ProtocolEvent, out: &mut Outbox) -> Result<(), Error> {
        let sout = match self.stream.as_mut() {
            Some(stream) => stream.handle(event)?,
            None => return Ok(()),
        };
        self.process_stream_out(sout, out)
    }

    fn process_stream_out(
        &mut self,
        sout: crate::protocol::StreamOut,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        if let Some((scope, receiver)) = sout.spawn {
            if let Some(stream_id) = self.stream.as_ref().map(StreamKind::stream_id) {
                out.effects.push(Effect::Spawn {
                    stream_id,
                    scope,
                    receiver,
                });
            }
        }
        for message in sout.app {
            if let Some(tx) = self.stream.as_ref().and_then(StreamKind::sender) {
                out.effects.push(Effect::App { tx, message });
            }
        }
        if sout.close_channel {
            if let Some(stream) = self.stream.as_mut() {
                stream.close_channel();
            }
        }
        for event in sout.events {
            self.stream_send_event(event, out)?;
        }
        Ok(())
    }

    fn stream_send_event(&mut self, event: ProtocolEvent, out: &mut Outbox) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        match event {
            ProtocolEvent::Response {
                status,
                mut headers,
                ..
            } => {
                self.response_started = true;
                self.pending_response_since = None;
                self.waiting_for_100 = false;

                let upgrading_websocket = status == 101
                    && self
                        .stream
                        .as_ref()
                        .map(StreamKind::is_websocket)
                        .unwrap_or(false);
                if header_contains_token(&headers, b"connection", "close") {
                    self.keep_alive = false;
                }

                let framing = if upgrading_websocket {
                    self.websocket_passthrough = true;
                    self.keep_alive = false;
                    // The pipelining gate no longer applies; frames flow
                    // straight through.
                    out.effects.push(Effect::CanRead(true));
                    ResponseFraming::None
                } else if status < 200
                    || self
                        .request_method
                        .as_ref()
                        .map(|method| suppress_body(method, status))
                        .unwrap_or(false)
                {
                    ResponseFraming::None
                } else if header_value(&headers, b"content-length").is_some() {
                    ResponseFraming::ContentLength
                } else if self.keep_alive {
                    headers.push((
                        Bytes::from_static(b"transfer-encoding"),
                        Bytes::from_static(b"chunked"),
                    ));
                    ResponseFraming::Chunked
                } else {
                    ResponseFraming::UntilClose
                };
                if !self.keep_alive
                    && !upgrading_websocket
                    && header_value(&headers, b"connection").is_none()
                {
                    headers.push((
                        Bytes::from_static(b"connection"),
                        Bytes::from_static(b"close"),
                    ));
                }
                self.response_framing = Some(framing);
                out.raw(serialize_response_head(status, &headers));
                if upgrading_websocket {
                    // Frames that arrived behind the handshake bytes.
                    let leftover = self.parser.take_buffer();
                    if !leftover.is_empty() {
                        if let Some(stream_id) = self.stream.as_ref().map(StreamKind::stream_id) {
                            self.deliver(
                                ProtocolEvent::Data {
                                    stream_id,
                                    data: leftover,
                                },
                                out,
                            )?;
                        }
                    }
                }
            }
            ProtocolEvent::Body { data, .. } => match self.response_framing {
                Some(ResponseFraming::ContentLength) | Some(ResponseFraming::UntilClose) => {
                    out.raw(data)
                }
                Some(ResponseFraming::Chunked) => out.raw(serialize_chunk(&data)),
                _ => {}
            },
            ProtocolEvent::EndBody { .. } => {
                if self.response_framing == Some(ResponseFraming::Chunked) {
                    out.raw(Bytes::from_static(CHUNKED_TERMINATOR));
                }
                self.finish_exchange(out)?;
            }
            ProtocolEvent::Data { data, .. } => out.raw(data),
            ProtocolEvent::EndData { .. } => {}
            ProtocolEvent::StreamClosed { .. } => {
                self.close_stream(out)?;
                if !self.closed {
                    out.wire(ConnectionEvent::Closed);
                    self.closed = true;
                }
            }
            ProtocolEvent::Request { .. } => {}
        }
        Ok(())
    }

    fn finish_exchange(&mut self, out: &mut Outbox) -> Result<(), Error> {
        self.response_framing = None;
        if !self.parser.request_complete() {
            // The response ended before the request body was read; the
            // connection cannot be reused.
            self.keep_alive = false;
        }
        if let Some(mut stream) = self.stream.take() {
            stream.close_channel();
        }
        if self.keep_alive && !self.closed {
            self.parser.start_next_cycle();
            out.wire(ConnectionEvent::Updated { idle: true });
            out.effects.push(Effect::CanRead(true));
            let _ = self.poll_events(out)?;
        } else if !self.closed {
            out.wire(ConnectionEvent::Closed);
            self.closed = true;
        }
        Ok(())
    }

    fn close_stream(&mut self, out: &mut Outbox) -> Result<(), Error> {
        if let Some(mut stream) = self.stream.take() {
            let stream_id = stream.stream_id();
            let sout = stream.handle(ProtocolEvent::StreamClosed { stream_id })?;
            self.stream = Some(stream);
            self.process_stream_out(sout, out)?;
            self.stream = None;
        }
        self.pending_response_since = None;
        Ok(())
    }

    fn emit_error_response(&mut self, out: &mut Outbox) {
        if !self.response_started {
            let mut headers = vec![
                (
                    Bytes::from_static(b"content-length"),
                    Bytes::from_static(b"0"),
                ),
                (
                    Bytes::from_static(b"connection"),
                    Bytes::from_static(b"close"),
                ),
            ];
            headers.extend(response_headers(
                self.context.clock(),
                "h1",
                self.config.include_server_header,
            ));
            out.raw(serialize_response_head(400, &headers));
        }
        out.wire(ConnectionEvent::Closed);
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asgi::{HttpVersion, Scope};
    use crate::clock::FixedClock;
    use crate::logging::NullAccessLog;
    use crate::protocol::Effect;

    const DATE_SERVER: &str = "date: Thu, 01 Jan 1970 01:23:20 GMT\r\nserver: tricorn-h1\r\n";

    fn protocol() -> H1Protocol {
        protocol_with(Config::default())
    }

    fn protocol_with(config: Config) -> H1Protocol {
        let context = WorkerContext::new()
            .with_clock(Arc::new(FixedClock::at_unix(5000)))
            .with_access_log(Arc::new(NullAccessLog));
        H1Protocol::new(Arc::new(config), context, false, None, None)
    }

    fn raw(data: &'static [u8]) -> ConnectionEvent {
        ConnectionEvent::RawData {
            data: Bytes::from_static(data),
            address: None,
        }
    }

    fn wire_events(out: &Outbox) -> Vec<&ConnectionEvent> {
        out.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Wire(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn app_messages(out: &Outbox) -> Vec<&AsgiMessage> {
        out.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::App { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    fn spawned_scopes(out: &Outbox) -> Vec<&Scope> {
        out.effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Spawn { scope, .. } => Some(scope),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn send_response_serializes_with_stamped_headers() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(
                raw(b"GET / HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n"),
                &mut out,
            )
            .unwrap();

        let mut out = Outbox::new();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseStart {
                    status: 201,
                    headers: vec![],
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(
            wire_events(&out),
            vec![&ConnectionEvent::raw(format!(
                "HTTP/1.1 201 \r\n{DATE_SERVER}connection: close\r\n\r\n"
            ))]
        );
    }

    #[tokio::test]
    async fn send_body_after_head() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(
                raw(b"GET / HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n"),
                &mut out,
            )
            .unwrap();

        let mut out = Outbox::new();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseStart {
                    status: 200,
                    headers: vec![(
                        Bytes::from_static(b"content-length"),
                        Bytes::from_static(b"5"),
                    )],
                },
                &mut out,
            )
            .unwrap();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseBody {
                    body: Bytes::from_static(b"hello"),
                    more_body: true,
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(
            wire_events(&out),
            vec![
                &ConnectionEvent::raw(format!(
                    "HTTP/1.1 200 \r\ncontent-length: 5\r\n{DATE_SERVER}connection: close\r\n\r\n"
                )),
                &ConnectionEvent::raw(&b"hello"[..]),
            ]
        );
    }

    #[tokio::test]
    async fn end_body_recycles_or_closes() {
        for (keep_alive, expected) in [
            (true, ConnectionEvent::Updated { idle: true }),
            (false, ConnectionEvent::Closed),
        ] {
            let mut protocol = protocol();
            let mut out = Outbox::new();
            let request: &'static [u8] = if keep_alive {
                b"GET / HTTP/1.1\r\nHost: example\r\n\r\n"
            } else {
                b"GET / HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n"
            };
            protocol.handle(raw(request), &mut out).unwrap();

            let mut out = Outbox::new();
            protocol
                .app_send(
                    1,
                    AsgiMessage::HttpResponseStart {
                        status: 200,
                        headers: vec![],
                    },
                    &mut out,
                )
                .unwrap();
            protocol
                .app_send(
                    1,
                    AsgiMessage::HttpResponseBody {
                        body: Bytes::new(),
                        more_body: false,
                    },
                    &mut out,
                )
                .unwrap();
            assert_eq!(wire_events(&out).last().unwrap(), &&expected);
        }
    }

    #[tokio::test]
    async fn closed_connection_disconnects_the_stream() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(
                raw(b"GET / HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n"),
                &mut out,
            )
            .unwrap();
        assert_eq!(spawned_scopes(&out).len(), 1);
        assert_eq!(
            app_messages(&out),
            vec![&AsgiMessage::HttpRequest {
                body: Bytes::new(),
                more_body: false,
            }]
        );

        let mut out = Outbox::new();
        protocol.handle(ConnectionEvent::Closed, &mut out).unwrap();
        assert_eq!(app_messages(&out), vec![&AsgiMessage::HttpDisconnect]);
    }

    #[tokio::test]
    async fn request_dispatch_carries_scope() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(
                raw(b"GET /?a=b HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n"),
                &mut out,
            )
            .unwrap();
        match spawned_scopes(&out)[0] {
            Scope::Http(scope) => {
                assert_eq!(scope.method, Method::GET);
                assert_eq!(scope.path, "/");
                assert_eq!(scope.query_string.as_ref(), b"a=b");
                assert_eq!(scope.http_version, HttpVersion::H11);
                assert_eq!(
                    scope.headers,
                    vec![
                        (Bytes::from_static(b"host"), Bytes::from_static(b"example")),
                        (
                            Bytes::from_static(b"connection"),
                            Bytes::from_static(b"close")
                        ),
                    ]
                );
            }
            other => panic!("unexpected scope {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_request_yields_canonical_400() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(raw(b"broken nonsense\r\n\r\n"), &mut out)
            .unwrap();
        assert_eq!(
            wire_events(&out),
            vec![
                &ConnectionEvent::raw(format!(
                    "HTTP/1.1 400 \r\ncontent-length: 0\r\nconnection: close\r\n{DATE_SERVER}\r\n"
                )),
                &ConnectionEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn oversized_incomplete_head_yields_400() {
        let mut config = Config::default();
        config.h1_max_incomplete_size = 5;
        let mut protocol = protocol_with(config);
        let mut out = Outbox::new();
        protocol
            .handle(raw(b"GET / HTTP/1.1\r\nHost: example\r\n"), &mut out)
            .unwrap();
        assert_eq!(
            wire_events(&out),
            vec![
                &ConnectionEvent::raw(format!(
                    "HTTP/1.1 400 \r\ncontent-length: 0\r\nconnection: close\r\n{DATE_SERVER}\r\n"
                )),
                &ConnectionEvent::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn pipelined_requests_are_gated_and_ordered() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        let status = protocol
            .handle(
                raw(b"GET /one HTTP/1.1\r\nHost: example\r\nConnection: keep-alive\r\n\r\n\
                      GET /two HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\r\n"),
                &mut out,
            )
            .unwrap();
        assert_eq!(status, HandleStatus::Paused);
        assert_eq!(spawned_scopes(&out).len(), 1);

        // Completing the first exchange recycles and dispatches the second
        // pipelined request.
        let mut out = Outbox::new();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseStart {
                    status: 200,
                    headers: vec![(
                        Bytes::from_static(b"content-length"),
                        Bytes::from_static(b"0"),
                    )],
                },
                &mut out,
            )
            .unwrap();
        protocol
            .app_send(
                1,
                AsgiMessage::HttpResponseBody {
                    body: Bytes::new(),
                    more_body: false,
                },
                &mut out,
            )
            .unwrap();
        let scopes = spawned_scopes(&out);
        assert_eq!(scopes.len(), 1);
        match scopes[0] {
            Scope::Http(scope) => assert_eq!(scope.path, "/two"),
            other => panic!("unexpected scope {other:?}"),
        }

        let mut out = Outbox::new();
        protocol
            .app_send(
                2,
                AsgiMessage::HttpResponseStart {
                    status: 200,
                    headers: vec![(
                        Bytes::from_static(b"content-length"),
                        Bytes::from_static(b"0"),
                    )],
                },
                &mut out,
            )
            .unwrap();
        protocol
            .app_send(
                2,
                AsgiMessage::HttpResponseBody {
                    body: Bytes::new(),
                    more_body: false,
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(wire_events(&out).last().unwrap(), &&ConnectionEvent::Closed);
    }

    #[tokio::test]
    async fn expect_continue_is_answered_before_body() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(
                raw(b"POST /?a=b HTTP/1.1\r\nHost: example\r\nConnection: close\r\n\
                      transfer-encoding: chunked\r\nexpect: 100-continue\r\n\r\n"),
                &mut out,
            )
            .unwrap();
        assert_eq!(
            *wire_events(&out).last().unwrap(),
            &ConnectionEvent::raw(format!("HTTP/1.1 100 \r\n{DATE_SERVER}\r\n"))
        );
    }

    #[tokio::test]
    async fn h2c_upgrade_signals_the_worker() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(
                raw(b"GET / HTTP/1.1\r\nHost: example\r\n\
                      upgrade: h2c\r\nhttp2-settings: abcd\r\n\r\nbbb"),
                &mut out,
            )
            .unwrap();
        assert_eq!(
            wire_events(&out),
            vec![&ConnectionEvent::raw(format!(
                "HTTP/1.1 101 \r\nupgrade: h2c\r\n{DATE_SERVER}\r\n"
            ))]
        );
        match out.upgrade.unwrap() {
            UpgradeSignal::H2c {
                settings,
                headers,
                data,
            } => {
                assert_eq!(settings, "abcd");
                assert_eq!(data.as_ref(), b"bbb");
                assert_eq!(
                    headers,
                    vec![
                        (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
                        (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
                        (
                            Bytes::from_static(b":authority"),
                            Bytes::from_static(b"example")
                        ),
                        (Bytes::from_static(b"host"), Bytes::from_static(b"example")),
                        (Bytes::from_static(b"upgrade"), Bytes::from_static(b"h2c")),
                        (
                            Bytes::from_static(b"http2-settings"),
                            Bytes::from_static(b"abcd")
                        ),
                    ]
                );
            }
            other => panic!("unexpected upgrade {other:?}"),
        }
    }

    #[tokio::test]
    async fn prior_knowledge_preface_signals_the_worker() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(raw(b"PRI * HTTP/2.0\r\n\r\nbbb"), &mut out)
            .unwrap();
        match out.upgrade.unwrap() {
            UpgradeSignal::H2Prior { data } => {
                assert_eq!(data.as_ref(), b"PRI * HTTP/2.0\r\n\r\nbbb");
            }
            other => panic!("unexpected upgrade {other:?}"),
        }
    }

    #[tokio::test]
    async fn websocket_upgrade_uses_a_websocket_stream() {
        let mut protocol = protocol();
        let mut out = Outbox::new();
        protocol
            .handle(
                raw(b"GET /ws HTTP/1.1\r\nHost: example\r\nConnection: Upgrade\r\n\
                      Upgrade: websocket\r\nSec-WebSocket-Version: 13\r\n\
                      Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"),
                &mut out,
            )
            .unwrap();
        match spawned_scopes(&out)[0] {
            Scope::Websocket(scope) => assert_eq!(scope.path, "/ws"),
            other => panic!("unexpected scope {other:?}"),
        }
        assert_eq!(app_messages(&out), vec![&AsgiMessage::WebsocketConnect]);

        // Accepting switches the connection into frame passthrough.
        let mut out = Outbox::new();
        protocol
            .app_send(1, AsgiMessage::WebsocketAccept { subprotocol: None }, &mut out)
            .unwrap();
        match wire_events(&out)[0] {
            ConnectionEvent::RawData { data, .. } => {
                assert!(data.starts_with(b"HTTP/1.1 101 \r\n"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let mut out = Outbox::new();
        protocol
            .app_send(
                1,
                AsgiMessage::WebsocketSend {
                    data: crate::asgi::WsData::Text("hi".into()),
                },
                &mut out,
            )
            .unwrap();
        assert_eq!(
            wire_events(&out),
            vec![&ConnectionEvent::raw(&[0x81, 0x02, b'h', b'i'][..])]
        );
    }
}

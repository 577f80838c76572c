use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::Method;
use tokio::sync::mpsc;

use crate::asgi::{split_target, AsgiMessage, HttpVersion, Scope, WebsocketScope, WsData};
use crate::channel::{app_channel, AppChannel};
use crate::codec::ws::{accept_key, close_code, DeflateConfig, WsCodec, WsEvent, WEBSOCKET_VERSION};
use crate::config::Config;
use crate::error::{BoxError, Error};
use crate::headers::{
    build_and_validate_headers, filter_hop_by_hop, split_comma_header, stamp_response_headers,
};
use crate::logging::ResponseSummary;
use crate::protocol::events::ProtocolEvent;
use crate::protocol::StreamOut;
use crate::worker::WorkerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsStreamState {
    Handshake,
    Connected,
    Response,
    Closed,
    HttpClosed,
}

impl WsStreamState {
    fn name(&self) -> &'static str {
        match self {
            WsStreamState::Handshake => "handshake",
            WsStreamState::Connected => "connected",
            WsStreamState::Response => "response",
            WsStreamState::Closed => "closed",
            WsStreamState::HttpClosed => "httpclosed",
        }
    }
}

/// Parsed upgrade request headers.
#[derive(Debug)]
pub(crate) struct Handshake {
    http_version: HttpVersion,
    connection_tokens: Option<Vec<String>>,
    extensions: Option<Vec<String>>,
    key: Option<Bytes>,
    subprotocols: Option<Vec<String>>,
    version: Option<Bytes>,
    upgrade: Option<Bytes>,
}

impl Handshake {
    pub(crate) fn new(headers: &[(Bytes, Bytes)], http_version: HttpVersion) -> Self {
        let mut handshake = Handshake {
            http_version,
            connection_tokens: None,
            extensions: None,
            key: None,
            subprotocols: None,
            version: None,
            upgrade: None,
        };
        for (name, value) in headers {
            match name.as_ref() {
                b"connection" => handshake.connection_tokens = Some(split_comma_header(value)),
                b"sec-websocket-extensions" => {
                    handshake.extensions = Some(split_comma_header(value))
                }
                b"sec-websocket-key" => handshake.key = Some(value.clone()),
                b"sec-websocket-protocol" => {
                    handshake.subprotocols = Some(split_comma_header(value))
                }
                b"sec-websocket-version" => handshake.version = Some(value.clone()),
                b"upgrade" => handshake.upgrade = Some(value.clone()),
                _ => {}
            }
        }
        handshake
    }

    pub(crate) fn is_valid(&self) -> bool {
        match self.http_version {
            HttpVersion::H10 => return false,
            HttpVersion::H11 => {
                if self.key.is_none() {
                    return false;
                }
                let has_upgrade_token = self
                    .connection_tokens
                    .as_ref()
                    .map(|tokens| tokens.iter().any(|t| t.eq_ignore_ascii_case("upgrade")))
                    .unwrap_or(false);
                if !has_upgrade_token {
                    return false;
                }
                match &self.upgrade {
                    Some(upgrade) if upgrade.eq_ignore_ascii_case(b"websocket") => {}
                    _ => return false,
                }
            }
            // The CONNECT handshake is carried by the protocol layer; the
            // key is optional there.
            HttpVersion::H2 | HttpVersion::H3 => {}
        }
        self.version.as_deref() == Some(WEBSOCKET_VERSION)
    }

    pub(crate) fn subprotocols(&self) -> Vec<String> {
        self.subprotocols.clone().unwrap_or_default()
    }

    /// Build the accept response: status, headers and the negotiated
    /// permessage-deflate configuration, if any.
    pub(crate) fn accept(
        &self,
        subprotocol: Option<&str>,
        offer_deflate: bool,
    ) -> Result<(u16, Vec<(Bytes, Bytes)>, Option<DeflateConfig>), Error> {
        let mut headers = Vec::new();
        if let Some(subprotocol) = subprotocol {
            let offered = self
                .subprotocols
                .as_ref()
                .map(|offers| offers.iter().any(|p| p == subprotocol))
                .unwrap_or(false);
            if !offered {
                return Err(Error::UnexpectedMessage {
                    state: "handshake",
                    message: "websocket.accept",
                });
            }
            headers.push((
                Bytes::from_static(b"sec-websocket-protocol"),
                Bytes::from(subprotocol.to_owned()),
            ));
        }

        let deflate = if offer_deflate {
            self.negotiate_deflate(&mut headers)
        } else {
            None
        };

        if let Some(key) = &self.key {
            headers.push((
                Bytes::from_static(b"sec-websocket-accept"),
                Bytes::from(accept_key(key)),
            ));
        }

        let status = if self.http_version == HttpVersion::H11 {
            headers.push((Bytes::from_static(b"upgrade"), Bytes::from_static(b"WebSocket")));
            headers.push((Bytes::from_static(b"connection"), Bytes::from_static(b"Upgrade")));
            101
        } else {
            200
        };
        Ok((status, headers, deflate))
    }

    fn negotiate_deflate(&self, headers: &mut Vec<(Bytes, Bytes)>) -> Option<DeflateConfig> {
        let offers = self.extensions.as_ref()?;
        for offer in offers {
            let mut parts = offer.split(';').map(str::trim);
            if !parts
                .next()
                .map(|name| name.eq_ignore_ascii_case("permessage-deflate"))
                .unwrap_or(false)
            {
                continue;
            }
            let mut config = DeflateConfig::default();
            let mut acceptable = true;
            for param in parts {
                let name = param.split('=').next().unwrap_or(param).trim();
                match name {
                    "server_no_context_takeover" => config.server_no_context_takeover = true,
                    "client_no_context_takeover" => config.client_no_context_takeover = true,
                    // Reduced windows are not supported; fall through to
                    // the client's next offer.
                    "server_max_window_bits" | "client_max_window_bits" => {
                        acceptable = false;
                        break;
                    }
                    _ => {
                        acceptable = false;
                        break;
                    }
                }
            }
            if !acceptable {
                continue;
            }
            let mut response = String::from("permessage-deflate");
            if config.server_no_context_takeover {
                response.push_str("; server_no_context_takeover");
            }
            if config.client_no_context_takeover {
                response.push_str("; client_no_context_takeover");
            }
            headers.push((
                Bytes::from_static(b"sec-websocket-extensions"),
                Bytes::from(response),
            ));
            return Some(config);
        }
        None
    }
}

/// One websocket conversation: handshake, message framing and the
/// rejection-as-HTTP path.
#[derive(Debug)]
pub(crate) struct WsStream {
    config: Arc<Config>,
    context: WorkerContext,
    ssl: bool,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    stream_id: u64,
    state: WsStreamState,
    handshake: Option<Handshake>,
    codec: Option<WsCodec>,
    channel: Option<AppChannel>,
    scope: Option<Scope>,
    response: Option<(u16, Vec<(Bytes, Bytes)>)>,
    response_status: Option<u16>,
    start_time: SystemTime,
    closed: bool,
}

impl WsStream {
    pub(crate) fn new(
        config: Arc<Config>,
        context: WorkerContext,
        ssl: bool,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
        stream_id: u64,
    ) -> Self {
        let start_time = context.clock().now();
        WsStream {
            config,
            context,
            ssl,
            client,
            server,
            stream_id,
            state: WsStreamState::Handshake,
            handshake: None,
            codec: None,
            channel: None,
            scope: None,
            response: None,
            response_status: None,
            start_time,
            closed: false,
        }
    }

    pub(crate) fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<AsgiMessage>> {
        self.channel.as_ref().and_then(AppChannel::sender)
    }

    pub(crate) fn handle(&mut self, event: ProtocolEvent) -> Result<StreamOut, Error> {
        let mut out = StreamOut::default();
        match event {
            ProtocolEvent::Request {
                raw_path,
                http_version,
                headers,
                ..
            } => {
                self.start_time = self.context.clock().now();
                let handshake = Handshake::new(&headers, http_version);
                let (path, raw_path, query_string) = split_target(&raw_path)?;
                let scope = Scope::Websocket(WebsocketScope {
                    http_version,
                    scheme: if self.ssl { "wss" } else { "ws" }.to_owned(),
                    path,
                    raw_path,
                    query_string,
                    root_path: self.config.root_path.clone(),
                    headers,
                    client: self.client,
                    server: self.server,
                    subprotocols: handshake.subprotocols(),
                    extensions: vec!["websocket.http.response".to_owned()],
                });
                self.scope = Some(scope.clone());
                if !handshake.is_valid() {
                    self.handshake = Some(handshake);
                    self.send_error_response(400, &mut out);
                    self.state = WsStreamState::HttpClosed;
                } else {
                    self.handshake = Some(handshake);
                    let (channel, receiver) = app_channel(self.config.max_app_queue_size);
                    self.channel = Some(channel);
                    out.spawn = Some((scope, receiver));
                    out.app.push(AsgiMessage::WebsocketConnect);
                }
            }
            ProtocolEvent::Body { data, .. } | ProtocolEvent::Data { data, .. } => {
                self.receive_frames(data, &mut out);
            }
            ProtocolEvent::StreamClosed { .. } => {
                if self.channel.is_some() && !self.closed {
                    out.app.push(AsgiMessage::WebsocketDisconnect {
                        code: close_code::ABNORMAL_CLOSURE,
                    });
                }
                self.closed = true;
                out.close_channel = true;
            }
            _ => {}
        }
        Ok(out)
    }

    fn receive_frames(&mut self, data: Bytes, out: &mut StreamOut) {
        let codec = match self.codec.as_mut() {
            Some(codec) => codec,
            // Frames before the handshake completed are dropped.
            None => return,
        };
        codec.receive_data(&data);
        loop {
            match codec.next_event() {
                Ok(Some(WsEvent::Message(message))) => {
                    out.app.push(AsgiMessage::WebsocketReceive { data: message });
                }
                Ok(Some(WsEvent::Ping(payload))) => {
                    out.events.push(ProtocolEvent::Data {
                        stream_id: self.stream_id,
                        data: codec.pong_frame(&payload),
                    });
                }
                Ok(Some(WsEvent::Pong(_))) => {}
                Ok(Some(WsEvent::Close { code, .. })) => {
                    if codec.remote_closing() {
                        let echo =
                            codec.close_frame(code.unwrap_or(close_code::NORMAL), "");
                        out.events.push(ProtocolEvent::Data {
                            stream_id: self.stream_id,
                            data: echo,
                        });
                    }
                    self.state = WsStreamState::Closed;
                    out.events.push(ProtocolEvent::StreamClosed {
                        stream_id: self.stream_id,
                    });
                    return;
                }
                Ok(None) => return,
                Err(error) => {
                    let close = codec.close_frame(error.close_code(), "");
                    out.events.push(ProtocolEvent::Data {
                        stream_id: self.stream_id,
                        data: close,
                    });
                    self.state = WsStreamState::Closed;
                    out.events.push(ProtocolEvent::StreamClosed {
                        stream_id: self.stream_id,
                    });
                    return;
                }
            }
        }
    }

    pub(crate) fn app_send(&mut self, message: AsgiMessage) -> Result<StreamOut, Error> {
        let mut out = StreamOut::default();
        if self.closed {
            // Allow the app to finish after close.
            return Ok(out);
        }
        match message {
            AsgiMessage::WebsocketAccept { subprotocol }
                if self.state == WsStreamState::Handshake =>
            {
                let handshake = self.handshake.as_ref().expect("handshake parsed");
                let (status, headers, deflate) = handshake.accept(
                    subprotocol.as_deref(),
                    self.config.websocket_permessage_deflate,
                )?;
                self.codec = Some(WsCodec::new(
                    self.config.websocket_max_message_size,
                    deflate,
                ));
                self.state = WsStreamState::Connected;
                self.response_status = Some(status);
                let headers = stamp_response_headers(
                    headers,
                    self.context.clock(),
                    self.protocol_tag(),
                    self.config.include_server_header,
                );
                out.events.push(ProtocolEvent::Response {
                    stream_id: self.stream_id,
                    status,
                    headers,
                });
                self.log_access(status);
            }
            AsgiMessage::WebsocketHttpResponseStart { status, headers }
                if self.state == WsStreamState::Handshake =>
            {
                self.response = Some((status, headers));
            }
            AsgiMessage::WebsocketHttpResponseBody { body, more_body }
                if matches!(
                    self.state,
                    WsStreamState::Handshake | WsStreamState::Response
                ) =>
            {
                self.send_rejection(body, more_body, &mut out)?;
            }
            AsgiMessage::WebsocketSend { data } if self.state == WsStreamState::Connected => {
                let codec = self.codec.as_mut().expect("codec exists when connected");
                let frame = match &data {
                    WsData::Text(text) => codec.text_frame(text),
                    WsData::Binary(bytes) => codec.binary_frame(bytes),
                }?;
                out.events.push(ProtocolEvent::Data {
                    stream_id: self.stream_id,
                    data: frame,
                });
            }
            AsgiMessage::WebsocketClose { .. } if self.state == WsStreamState::Handshake => {
                self.send_error_response(403, &mut out);
                self.state = WsStreamState::HttpClosed;
            }
            AsgiMessage::WebsocketClose { code } if self.state == WsStreamState::Connected => {
                let codec = self.codec.as_mut().expect("codec exists when connected");
                let frame = codec.close_frame(code, "");
                out.events.push(ProtocolEvent::Data {
                    stream_id: self.stream_id,
                    data: frame,
                });
                out.events.push(ProtocolEvent::EndData {
                    stream_id: self.stream_id,
                });
                self.state = WsStreamState::Closed;
            }
            message => {
                return Err(Error::UnexpectedMessage {
                    state: self.state.name(),
                    message: message.kind(),
                })
            }
        }
        Ok(out)
    }

    pub(crate) fn app_exit(&mut self, error: Option<BoxError>) -> StreamOut {
        let mut out = StreamOut::default();
        if self.closed {
            return out;
        }
        if let Some(error) = &error {
            tracing::error!(
                target: "tricorn::app",
                stream_id = self.stream_id,
                error = %error,
                "application error",
            );
        }
        match self.state {
            WsStreamState::Handshake => {
                self.send_error_response(500, &mut out);
                self.state = WsStreamState::HttpClosed;
                out.events.push(ProtocolEvent::StreamClosed {
                    stream_id: self.stream_id,
                });
            }
            WsStreamState::Connected if error.is_some() => {
                if let Some(codec) = self.codec.as_mut() {
                    let frame = codec.close_frame(close_code::INTERNAL_ERROR, "");
                    out.events.push(ProtocolEvent::Data {
                        stream_id: self.stream_id,
                        data: frame,
                    });
                }
                out.events.push(ProtocolEvent::StreamClosed {
                    stream_id: self.stream_id,
                });
            }
            _ => {}
        }
        self.closed = true;
        out.close_channel = true;
        out
    }

    fn send_rejection(
        &mut self,
        body: Bytes,
        more_body: bool,
        out: &mut StreamOut,
    ) -> Result<(), Error> {
        let (status, headers) = match &self.response {
            Some(response) => response.clone(),
            None => {
                return Err(Error::UnexpectedMessage {
                    state: self.state.name(),
                    message: "websocket.http.response.body",
                })
            }
        };
        let suppressed = crate::headers::suppress_body(&Method::GET, status);
        if self.state == WsStreamState::Handshake {
            let mut headers = build_and_validate_headers(&headers)?;
            if self.is_h2_family() {
                headers = filter_hop_by_hop(headers);
            }
            let headers = stamp_response_headers(
                headers,
                self.context.clock(),
                self.protocol_tag(),
                self.config.include_server_header,
            );
            self.response_status = Some(status);
            out.events.push(ProtocolEvent::Response {
                stream_id: self.stream_id,
                status,
                headers,
            });
            self.state = WsStreamState::Response;
        }
        if !suppressed && !body.is_empty() {
            out.events.push(ProtocolEvent::Body {
                stream_id: self.stream_id,
                data: body,
            });
        }
        if !more_body {
            out.events.push(ProtocolEvent::EndBody {
                stream_id: self.stream_id,
            });
            self.state = WsStreamState::HttpClosed;
            self.log_access(status);
        }
        Ok(())
    }

    fn send_error_response(&mut self, status: u16, out: &mut StreamOut) {
        let mut headers = vec![(
            Bytes::from_static(b"content-length"),
            Bytes::from_static(b"0"),
        )];
        if !self.is_h2_family() {
            headers.push((
                Bytes::from_static(b"connection"),
                Bytes::from_static(b"close"),
            ));
        }
        headers.extend(crate::headers::response_headers(
            self.context.clock(),
            self.protocol_tag(),
            self.config.include_server_header,
        ));
        self.response_status = Some(status);
        out.events.push(ProtocolEvent::Response {
            stream_id: self.stream_id,
            status,
            headers,
        });
        out.events.push(ProtocolEvent::EndBody {
            stream_id: self.stream_id,
        });
        self.log_access(status);
    }

    pub(crate) fn close_channel(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
    }

    fn protocol_tag(&self) -> &'static str {
        match self.scope {
            Some(Scope::Websocket(WebsocketScope {
                http_version: HttpVersion::H2,
                ..
            })) => "h2",
            Some(Scope::Websocket(WebsocketScope {
                http_version: HttpVersion::H3,
                ..
            })) => "h3",
            _ => "h1",
        }
    }

    fn is_h2_family(&self) -> bool {
        matches!(
            self.scope,
            Some(Scope::Websocket(WebsocketScope {
                http_version: HttpVersion::H2 | HttpVersion::H3,
                ..
            }))
        )
    }

    fn log_access(&self, status: u16) {
        if let Some(scope) = &self.scope {
            let elapsed = self
                .context
                .clock()
                .now()
                .duration_since(self.start_time)
                .unwrap_or_default();
            self.context
                .access_log()
                .access(scope, &ResponseSummary::status(status), elapsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::headers::header_value;
    use crate::logging::NullAccessLog;

    fn ws_headers() -> Vec<(Bytes, Bytes)> {
        vec![
            (Bytes::from_static(b"host"), Bytes::from_static(b"x")),
            (
                Bytes::from_static(b"connection"),
                Bytes::from_static(b"Upgrade"),
            ),
            (
                Bytes::from_static(b"upgrade"),
                Bytes::from_static(b"websocket"),
            ),
            (
                Bytes::from_static(b"sec-websocket-version"),
                Bytes::from_static(b"13"),
            ),
            (
                Bytes::from_static(b"sec-websocket-key"),
                Bytes::from_static(b"dGhlIHNhbXBsZSBub25jZQ=="),
            ),
        ]
    }

    fn stream_with(config: Config) -> WsStream {
        let context = WorkerContext::new()
            .with_clock(Arc::new(FixedClock::at_unix(5000)))
            .with_access_log(Arc::new(NullAccessLog));
        WsStream::new(Arc::new(config), context, false, None, None, 1)
    }

    fn stream() -> WsStream {
        stream_with(Config::default())
    }

    fn request(headers: Vec<(Bytes, Bytes)>) -> ProtocolEvent {
        ProtocolEvent::Request {
            stream_id: 1,
            method: Method::GET,
            raw_path: Bytes::from_static(b"/chat"),
            http_version: HttpVersion::H11,
            headers,
        }
    }

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn valid_handshake_spawns_app() {
        let mut stream = stream();
        let out = stream.handle(request(ws_headers())).unwrap();
        assert!(out.spawn.is_some());
        assert_eq!(out.app, vec![AsgiMessage::WebsocketConnect]);
        match &out.spawn.as_ref().unwrap().0 {
            Scope::Websocket(scope) => {
                assert_eq!(scope.scheme, "ws");
                assert_eq!(scope.path, "/chat");
            }
            other => panic!("unexpected scope {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_handshake_yields_400_without_app() {
        let mut stream = stream();
        let mut headers = ws_headers();
        headers.retain(|(name, _)| name.as_ref() != b"sec-websocket-key");
        let out = stream.handle(request(headers)).unwrap();
        assert!(out.spawn.is_none());
        match &out.events[0] {
            ProtocolEvent::Response { status, .. } => assert_eq!(*status, 400),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(out.events[1], ProtocolEvent::EndBody { .. }));
    }

    #[tokio::test]
    async fn accept_emits_switching_protocols() {
        let mut stream = stream();
        let _ = stream.handle(request(ws_headers())).unwrap();
        let out = stream
            .app_send(AsgiMessage::WebsocketAccept { subprotocol: None })
            .unwrap();
        match &out.events[0] {
            ProtocolEvent::Response { status, headers, .. } => {
                assert_eq!(*status, 101);
                assert_eq!(
                    header_value(headers, b"sec-websocket-accept").unwrap().as_ref(),
                    b"s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
                );
                assert_eq!(
                    header_value(headers, b"upgrade").unwrap().as_ref(),
                    b"WebSocket"
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_send_emits_single_text_frame() {
        let mut stream = stream();
        let _ = stream.handle(request(ws_headers())).unwrap();
        let _ = stream
            .app_send(AsgiMessage::WebsocketAccept { subprotocol: None })
            .unwrap();
        let out = stream
            .app_send(AsgiMessage::WebsocketSend {
                data: WsData::Text("hi".into()),
            })
            .unwrap();
        match &out.events[0] {
            ProtocolEvent::Data { data, .. } => {
                assert_eq!(data.as_ref(), &[0x81, 0x02, b'h', b'i']);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_during_handshake_yields_403() {
        let mut stream = stream();
        let _ = stream.handle(request(ws_headers())).unwrap();
        let out = stream
            .app_send(AsgiMessage::WebsocketClose { code: 1000 })
            .unwrap();
        match &out.events[0] {
            ProtocolEvent::Response { status, .. } => assert_eq!(*status, 403),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_response_flows_as_http() {
        let mut stream = stream();
        let _ = stream.handle(request(ws_headers())).unwrap();
        let _ = stream
            .app_send(AsgiMessage::WebsocketHttpResponseStart {
                status: 404,
                headers: vec![],
            })
            .unwrap();
        let out = stream
            .app_send(AsgiMessage::WebsocketHttpResponseBody {
                body: Bytes::from_static(b"nope"),
                more_body: false,
            })
            .unwrap();
        assert!(matches!(
            out.events[0],
            ProtocolEvent::Response { status: 404, .. }
        ));
        assert!(matches!(out.events[1], ProtocolEvent::Body { .. }));
        assert!(matches!(out.events[2], ProtocolEvent::EndBody { .. }));
    }

    #[tokio::test]
    async fn oversized_message_closes_with_1009() {
        let mut config = Config::default();
        config.websocket_max_message_size = 4;
        let mut stream = stream_with(config);
        let _ = stream.handle(request(ws_headers())).unwrap();
        let _ = stream
            .app_send(AsgiMessage::WebsocketAccept { subprotocol: None })
            .unwrap();

        // Masked 8 byte text frame with a zero mask key.
        let mut frame = vec![0x81, 0x88, 0, 0, 0, 0];
        frame.extend_from_slice(b"toolarge");
        let out = stream
            .handle(ProtocolEvent::Data {
                stream_id: 1,
                data: Bytes::from(frame),
            })
            .unwrap();
        match &out.events[0] {
            ProtocolEvent::Data { data, .. } => {
                // Close frame carrying 1009.
                assert_eq!(&data[..4], &[0x88, 0x02, 0x03, 0xf1]);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            out.events[1],
            ProtocolEvent::StreamClosed { .. }
        ));
    }

    #[tokio::test]
    async fn ping_is_answered_without_the_app() {
        let mut stream = stream();
        let _ = stream.handle(request(ws_headers())).unwrap();
        let _ = stream
            .app_send(AsgiMessage::WebsocketAccept { subprotocol: None })
            .unwrap();
        let out = stream
            .handle(ProtocolEvent::Data {
                stream_id: 1,
                data: Bytes::from_static(&[0x89, 0x80, 0, 0, 0, 0]),
            })
            .unwrap();
        assert!(out.app.is_empty());
        match &out.events[0] {
            ProtocolEvent::Data { data, .. } => assert_eq!(data.as_ref(), &[0x8a, 0x00]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn app_error_during_handshake_yields_500() {
        let mut stream = stream();
        let _ = stream.handle(request(ws_headers())).unwrap();
        let out = stream.app_exit(Some("boom".into()));
        assert!(matches!(
            out.events[0],
            ProtocolEvent::Response { status: 500, .. }
        ));
    }

    #[tokio::test]
    async fn deflate_negotiated_only_when_enabled() {
        let mut headers = ws_headers();
        headers.push((
            Bytes::from_static(b"sec-websocket-extensions"),
            Bytes::from_static(b"permessage-deflate; client_no_context_takeover"),
        ));

        let mut stream = stream();
        let _ = stream.handle(request(headers.clone())).unwrap();
        let out = stream
            .app_send(AsgiMessage::WebsocketAccept { subprotocol: None })
            .unwrap();
        match &out.events[0] {
            ProtocolEvent::Response { headers, .. } => {
                assert!(header_value(headers, b"sec-websocket-extensions").is_none());
            }
            other => panic!("unexpected event {other:?}"),
        }

        let mut config = Config::default();
        config.websocket_permessage_deflate = true;
        let mut stream = stream_with(config);
        let _ = stream.handle(request(headers)).unwrap();
        let out = stream
            .app_send(AsgiMessage::WebsocketAccept { subprotocol: None })
            .unwrap();
        match &out.events[0] {
            ProtocolEvent::Response { headers, .. } => {
                assert_eq!(
                    header_value(headers, b"sec-websocket-extensions").unwrap().as_ref(),
                    b"permessage-deflate; client_no_context_takeover"
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

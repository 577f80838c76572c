use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use http::Method;
use tokio::sync::mpsc;

use crate::asgi::{split_target, AsgiMessage, HttpScope, HttpVersion, Scope};
use crate::channel::{app_channel, AppChannel};
use crate::config::Config;
use crate::error::{BoxError, Error};
use crate::headers::{build_and_validate_headers, filter_hop_by_hop, stamp_response_headers, suppress_body};
use crate::logging::ResponseSummary;
use crate::protocol::events::ProtocolEvent;
use crate::protocol::StreamOut;
use crate::worker::WorkerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpStreamState {
    Idle,
    Request,
    Response,
    Closed,
}

impl HttpStreamState {
    fn name(&self) -> &'static str {
        match self {
            HttpStreamState::Idle => "idle",
            HttpStreamState::Request => "request",
            HttpStreamState::Response => "response",
            HttpStreamState::Closed => "closed",
        }
    }
}

/// One HTTP request/response exchange: translates protocol events into app
/// messages and app messages back into protocol events.
#[derive(Debug)]
pub(crate) struct HttpStream {
    config: Arc<Config>,
    context: WorkerContext,
    ssl: bool,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    stream_id: u64,
    state: HttpStreamState,
    channel: Option<AppChannel>,
    scope: Option<Scope>,
    method: Option<Method>,
    response_status: Option<u16>,
    start_time: SystemTime,
    body_received: usize,
    disconnected: bool,
}

impl HttpStream {
    pub(crate) fn new(
        config: Arc<Config>,
        context: WorkerContext,
        ssl: bool,
        client: Option<SocketAddr>,
        server: Option<SocketAddr>,
        stream_id: u64,
    ) -> Self {
        let start_time = context.clock().now();
        HttpStream {
            config,
            context,
            ssl,
            client,
            server,
            stream_id,
            state: HttpStreamState::Idle,
            channel: None,
            scope: None,
            method: None,
            response_status: None,
            start_time,
            body_received: 0,
            disconnected: false,
        }
    }

    pub(crate) fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<AsgiMessage>> {
        self.channel.as_ref().and_then(AppChannel::sender)
    }

    fn protocol_tag(&self, version: HttpVersion) -> &'static str {
        match version {
            HttpVersion::H2 => "h2",
            HttpVersion::H3 => "h3",
            _ => "h1",
        }
    }

    fn version_tag(&self) -> &'static str {
        match self.scope {
            Some(Scope::Http(ref scope)) => self.protocol_tag(scope.http_version),
            _ => "h1",
        }
    }

    fn is_h2_family(&self) -> bool {
        matches!(
            self.scope,
            Some(Scope::Http(HttpScope {
                http_version: HttpVersion::H2 | HttpVersion::H3,
                ..
            }))
        )
    }

    pub(crate) fn handle(&mut self, event: ProtocolEvent) -> Result<StreamOut, Error> {
        let mut out = StreamOut::default();
        match event {
            ProtocolEvent::Request {
                method,
                raw_path,
                http_version,
                headers,
                ..
            } => {
                self.start_time = self.context.clock().now();
                let (path, raw_path, query_string) = split_target(&raw_path)?;
                let scope = Scope::Http(HttpScope {
                    http_version,
                    method: method.clone(),
                    scheme: if self.ssl { "https" } else { "http" }.to_owned(),
                    path,
                    raw_path,
                    query_string,
                    root_path: self.config.root_path.clone(),
                    headers,
                    client: self.client,
                    server: self.server,
                });
                self.method = Some(method);
                self.scope = Some(scope.clone());
                self.state = HttpStreamState::Request;
                let (channel, receiver) = app_channel(self.config.max_app_queue_size);
                self.channel = Some(channel);
                out.spawn = Some((scope, receiver));
            }
            ProtocolEvent::Body { data, .. } => {
                self.body_received += data.len();
                if let Some(limit) = self.config.max_request_body_size {
                    if self.body_received > limit && self.state == HttpStreamState::Request {
                        self.send_error_response(413, &mut out);
                        self.close(&mut out);
                        return Ok(out);
                    }
                }
                out.app.push(AsgiMessage::HttpRequest {
                    body: data,
                    more_body: true,
                });
            }
            ProtocolEvent::EndBody { .. } => {
                out.app.push(AsgiMessage::HttpRequest {
                    body: Bytes::new(),
                    more_body: false,
                });
            }
            ProtocolEvent::StreamClosed { .. } => {
                if !self.disconnected {
                    out.app.push(AsgiMessage::HttpDisconnect);
                }
                self.close(&mut out);
            }
            _ => {}
        }
        Ok(out)
    }

    pub(crate) fn app_send(&mut self, message: AsgiMessage) -> Result<StreamOut, Error> {
        let mut out = StreamOut::default();
        if self.state == HttpStreamState::Closed {
            // Post-terminal sends are dropped so an app may keep running
            // after the exchange completed.
            return Ok(out);
        }
        match message {
            AsgiMessage::HttpResponseStart { status, headers }
                if self.state == HttpStreamState::Request =>
            {
                if !(100..=599).contains(&status) {
                    return Err(Error::UnexpectedMessage {
                        state: self.state.name(),
                        message: "http.response.start",
                    });
                }
                let mut headers = build_and_validate_headers(&headers)?;
                if self.is_h2_family() {
                    headers = filter_hop_by_hop(headers);
                }
                let headers = stamp_response_headers(
                    headers,
                    self.context.clock(),
                    self.version_tag(),
                    self.config.include_server_header,
                );
                self.response_status = Some(status);
                self.state = HttpStreamState::Response;
                out.events.push(ProtocolEvent::Response {
                    stream_id: self.stream_id,
                    status,
                    headers,
                });
            }
            AsgiMessage::HttpResponseBody { body, more_body }
                if self.state == HttpStreamState::Response =>
            {
                let suppressed = self
                    .method
                    .as_ref()
                    .zip(self.response_status)
                    .map(|(method, status)| suppress_body(method, status))
                    .unwrap_or(false);
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
                    self.state = HttpStreamState::Closed;
                    self.log_access();
                    out.close_channel = true;
                }
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

    /// The application task finished (successfully or not).
    pub(crate) fn app_exit(&mut self, error: Option<BoxError>) -> StreamOut {
        let mut out = StreamOut::default();
        if let Some(error) = &error {
            tracing::error!(
                target: "tricorn::app",
                stream_id = self.stream_id,
                error = %error,
                "application error",
            );
        }
        if self.disconnected {
            return out;
        }
        match self.state {
            HttpStreamState::Idle | HttpStreamState::Closed => {}
            HttpStreamState::Request => {
                // The app ended without starting a response.
                self.send_error_response(500, &mut out);
                self.close(&mut out);
                out.events.push(ProtocolEvent::StreamClosed {
                    stream_id: self.stream_id,
                });
            }
            HttpStreamState::Response => {
                // Truncated mid-body; the protocol turns this into a reset
                // or connection close.
                self.close(&mut out);
                out.events.push(ProtocolEvent::StreamClosed {
                    stream_id: self.stream_id,
                });
            }
        }
        out
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
            self.version_tag(),
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
        self.log_access();
    }

    fn close(&mut self, out: &mut StreamOut) {
        self.state = HttpStreamState::Closed;
        self.disconnected = true;
        out.close_channel = true;
    }

    pub(crate) fn close_channel(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
    }

    fn log_access(&self) {
        if let Some(scope) = &self.scope {
            let elapsed = self
                .context
                .clock()
                .now()
                .duration_since(self.start_time)
                .unwrap_or_default();
            self.context.access_log().access(
                scope,
                &ResponseSummary::status(self.response_status.unwrap_or(0)),
                elapsed,
            );
        }
    }
}

//! The application contract: the scope record, the message vocabulary and
//! the `(scope, receive, send)` calling convention.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use percent_encoding::percent_decode;

pub use crate::channel::AppReceiver;
use crate::error::{BoxError, Error};

/// Version of the gateway contract the core speaks.
pub const SPEC_VERSION: &str = "2.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HttpVersion {
    H10,
    H11,
    H2,
    H3,
}

impl HttpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::H10 => "1.0",
            HttpVersion::H11 => "1.1",
            HttpVersion::H2 => "2",
            HttpVersion::H3 => "3",
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The immutable per-stream record handed to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    Http(HttpScope),
    Websocket(WebsocketScope),
    Lifespan,
}

impl Scope {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Scope::Http(_) => "http",
            Scope::Websocket(_) => "websocket",
            Scope::Lifespan => "lifespan",
        }
    }

    pub(crate) fn path(&self) -> &str {
        match self {
            Scope::Http(scope) => &scope.path,
            Scope::Websocket(scope) => &scope.path,
            Scope::Lifespan => "",
        }
    }

    pub(crate) fn method(&self) -> Option<&Method> {
        match self {
            Scope::Http(scope) => Some(&scope.method),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpScope {
    pub http_version: HttpVersion,
    pub method: Method,
    pub scheme: String,
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: String,
    pub headers: Vec<(Bytes, Bytes)>,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebsocketScope {
    pub http_version: HttpVersion,
    pub scheme: String,
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: String,
    pub headers: Vec<(Bytes, Bytes)>,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    pub subprotocols: Vec<String>,
    /// Contract extensions the core implements for this stream.
    pub extensions: Vec<String>,
}

/// Split a request target into percent-decoded path, raw path and query
/// string, the way they appear in the scope.
pub(crate) fn split_target(raw_target: &Bytes) -> Result<(String, Bytes, Bytes), Error> {
    let (path, query) = match raw_target.iter().position(|&b| b == b'?') {
        Some(at) => (raw_target.slice(..at), raw_target.slice(at + 1..)),
        None => (raw_target.clone(), Bytes::new()),
    };
    let decoded = percent_decode(&path)
        .decode_utf8()
        .map_err(|_| Error::InvalidHeader)?
        .into_owned();
    Ok((decoded, path, query))
}

/// A websocket message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsData {
    Text(String),
    Binary(Bytes),
}

/// Messages exchanged with the application, mirroring the contract's
/// message dictionaries as tagged variants.
#[derive(Debug, Clone, PartialEq)]
pub enum AsgiMessage {
    HttpRequest { body: Bytes, more_body: bool },
    HttpResponseStart { status: u16, headers: Vec<(Bytes, Bytes)> },
    HttpResponseBody { body: Bytes, more_body: bool },
    HttpDisconnect,
    WebsocketConnect,
    WebsocketAccept { subprotocol: Option<String> },
    WebsocketReceive { data: WsData },
    WebsocketSend { data: WsData },
    WebsocketClose { code: u16 },
    WebsocketDisconnect { code: u16 },
    WebsocketHttpResponseStart { status: u16, headers: Vec<(Bytes, Bytes)> },
    WebsocketHttpResponseBody { body: Bytes, more_body: bool },
    LifespanStartup,
    LifespanStartupComplete,
    LifespanStartupFailed { message: String },
    LifespanShutdown,
    LifespanShutdownComplete,
    LifespanShutdownFailed { message: String },
}

impl AsgiMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            AsgiMessage::HttpRequest { .. } => "http.request",
            AsgiMessage::HttpResponseStart { .. } => "http.response.start",
            AsgiMessage::HttpResponseBody { .. } => "http.response.body",
            AsgiMessage::HttpDisconnect => "http.disconnect",
            AsgiMessage::WebsocketConnect => "websocket.connect",
            AsgiMessage::WebsocketAccept { .. } => "websocket.accept",
            AsgiMessage::WebsocketReceive { .. } => "websocket.receive",
            AsgiMessage::WebsocketSend { .. } => "websocket.send",
            AsgiMessage::WebsocketClose { .. } => "websocket.close",
            AsgiMessage::WebsocketDisconnect { .. } => "websocket.disconnect",
            AsgiMessage::WebsocketHttpResponseStart { .. } => "websocket.http.response.start",
            AsgiMessage::WebsocketHttpResponseBody { .. } => "websocket.http.response.body",
            AsgiMessage::LifespanStartup => "lifespan.startup",
            AsgiMessage::LifespanStartupComplete => "lifespan.startup.complete",
            AsgiMessage::LifespanStartupFailed { .. } => "lifespan.startup.failed",
            AsgiMessage::LifespanShutdown => "lifespan.shutdown",
            AsgiMessage::LifespanShutdownComplete => "lifespan.shutdown.complete",
            AsgiMessage::LifespanShutdownFailed { .. } => "lifespan.shutdown.failed",
        }
    }
}

/// Where application-emitted messages are routed.
#[async_trait]
pub(crate) trait MessageSink: Send + Sync {
    async fn app_send(&self, stream_id: u64, message: AsgiMessage) -> Result<(), Error>;
}

/// Send half of the application interface; accepts one message per call and
/// surfaces contract violations as errors.
#[derive(Clone)]
pub struct AppSender {
    sink: Arc<dyn MessageSink>,
    stream_id: u64,
}

impl AppSender {
    pub(crate) fn new(sink: Arc<dyn MessageSink>, stream_id: u64) -> Self {
        AppSender { sink, stream_id }
    }

    pub async fn send(&self, message: AsgiMessage) -> Result<(), Error> {
        self.sink.app_send(self.stream_id, message).await
    }
}

impl fmt::Debug for AppSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppSender")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

/// The application callable.
///
/// One invocation per stream (and one per worker for the lifespan scope).
/// A blocking implementation stalls wire progress for its own connection;
/// offload blocking work with `tokio::task::spawn_blocking`.
#[async_trait]
pub trait App: Send + Sync + 'static {
    async fn call(
        &self,
        scope: Scope,
        receiver: AppReceiver,
        sender: AppSender,
    ) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> App for F
where
    F: Fn(Scope, AppReceiver, AppSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn call(
        &self,
        scope: Scope,
        receiver: AppReceiver,
        sender: AppSender,
    ) -> Result<(), BoxError> {
        (self)(scope, receiver, sender).await
    }
}

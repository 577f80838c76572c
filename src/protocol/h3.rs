//! HTTP/3 adapter (cargo feature `h3`).
//!
//! Bridges an established QUIC connection's request streams onto the same
//! application contract as the HTTP/1 and HTTP/2 drivers. The QUIC engine
//! owns the UDP socket; this layer consumes `h3` request streams, so the
//! datagram loop lives in the engine rather than here. Without this feature
//! the crate serves HTTP/1 and HTTP/2 only.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use tokio::sync::{mpsc, Mutex};
use tokio_util::task::TaskTracker;

use crate::asgi::{App, AppSender, AsgiMessage, HttpScope, HttpVersion, MessageSink, Scope};
use crate::channel::AppReceiver;
use crate::config::Config;
use crate::error::Error;
use crate::headers::{build_and_validate_headers, filter_hop_by_hop, stamp_response_headers, suppress_body};
use crate::logging::ResponseSummary;
use crate::worker::WorkerContext;

/// Serve one QUIC connection's HTTP/3 request streams.
pub async fn serve_connection<C>(
    connection: C,
    app: Arc<dyn App>,
    config: Arc<Config>,
    context: WorkerContext,
) -> Result<(), Error>
where
    C: h3::quic::Connection<Bytes> + 'static,
    C::BidiStream: h3::quic::BidiStream<Bytes> + Send + 'static,
    <C::BidiStream as h3::quic::BidiStream<Bytes>>::SendStream: Send + 'static,
    <C::BidiStream as h3::quic::BidiStream<Bytes>>::RecvStream: Send + 'static,
{
    let mut h3_conn = h3::server::builder()
        .build(connection)
        .await
        .map_err(|error| Error::App(error.into()))?;
    let tasks = TaskTracker::new();

    loop {
        tokio::select! {
            _ = context.terminated().cancelled() => {
                break;
            }
            accepted = h3_conn.accept() => match accepted {
                Ok(Some((request, stream))) => {
                    let app = app.clone();
                    let config = config.clone();
                    let context = context.clone();
                    tasks.spawn(async move {
                        handle_request::<C>(request, stream, app, config, context).await;
                    });
                }
                Ok(None) => break,
                Err(error) => match error.get_error_level() {
                    h3::error::ErrorLevel::ConnectionError => break,
                    h3::error::ErrorLevel::StreamError => continue,
                },
            },
        }
    }

    tasks.close();
    let _ = tokio::time::timeout(config.shutdown_timeout, tasks.wait()).await;
    Ok(())
}

async fn handle_request<C>(
    request: Request<()>,
    stream: h3::server::RequestStream<C::BidiStream, Bytes>,
    app: Arc<dyn App>,
    config: Arc<Config>,
    context: WorkerContext,
) where
    C: h3::quic::Connection<Bytes>,
    C::BidiStream: h3::quic::BidiStream<Bytes> + Send + 'static,
    <C::BidiStream as h3::quic::BidiStream<Bytes>>::SendStream: Send + 'static,
    <C::BidiStream as h3::quic::BidiStream<Bytes>>::RecvStream: Send + 'static,
{
    let (send, mut recv) = stream.split();
    let (parts, _) = request.into_parts();

    let raw_target = Bytes::from(
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| "/".to_owned()),
    );
    let (path, raw_path, query_string) = match crate::asgi::split_target(&raw_target) {
        Ok(split) => split,
        Err(_) => return,
    };
    let headers: Vec<(Bytes, Bytes)> = parts
        .headers
        .iter()
        .map(|(name, value)| {
            (
                Bytes::copy_from_slice(name.as_str().as_bytes()),
                Bytes::copy_from_slice(value.as_bytes()),
            )
        })
        .collect();
    let scope = Scope::Http(HttpScope {
        http_version: HttpVersion::H3,
        method: parts.method.clone(),
        scheme: "https".to_owned(),
        path,
        raw_path,
        query_string,
        root_path: config.root_path.clone(),
        headers,
        client: None,
        server: None,
    });

    let (to_app_tx, to_app_rx) = mpsc::channel(config.max_app_queue_size.max(1));
    let sink = Arc::new(H3Sink {
        send: Mutex::new(send),
        state: StdMutex::new(H3StreamState::Request),
        status: StdMutex::new(None),
        method: parts.method,
        scope: scope.clone(),
        start_time: context.clock().now(),
        config: config.clone(),
        context: context.clone(),
    });
    let sink_dyn: Arc<dyn MessageSink> = sink.clone();
    let sender = AppSender::new(sink_dyn, 0);
    let receiver = AppReceiver::from_raw(to_app_rx);

    let app_task = tokio::spawn({
        let app = app.clone();
        async move { app.call(scope, receiver, sender).await }
    });

    loop {
        match recv.recv_data().await {
            Ok(Some(mut chunk)) => {
                let data = chunk.copy_to_bytes(chunk.remaining());
                if to_app_tx
                    .send(AsgiMessage::HttpRequest {
                        body: data,
                        more_body: true,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                let _ = to_app_tx
                    .send(AsgiMessage::HttpRequest {
                        body: Bytes::new(),
                        more_body: false,
                    })
                    .await;
                break;
            }
            Err(_) => break,
        }
    }
    drop(to_app_tx);

    let result = app_task.await;
    let error = match result {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error),
        Err(join_error) => Some(Box::new(join_error) as crate::error::BoxError),
    };
    sink.finish(error).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum H3StreamState {
    Request,
    Response,
    Closed,
}

struct H3Sink<S>
where
    S: h3::quic::SendStream<Bytes>,
{
    send: Mutex<h3::server::RequestStream<S, Bytes>>,
    state: StdMutex<H3StreamState>,
    status: StdMutex<Option<u16>>,
    method: http::Method,
    scope: Scope,
    start_time: SystemTime,
    config: Arc<Config>,
    context: WorkerContext,
}

impl<S> H3Sink<S>
where
    S: h3::quic::SendStream<Bytes> + Send,
{
    fn state(&self) -> H3StreamState {
        *self.state.lock().expect("state lock")
    }

    fn set_state(&self, state: H3StreamState) {
        *self.state.lock().expect("state lock") = state;
    }

    fn log_access(&self, status: u16) {
        let elapsed = self
            .context
            .clock()
            .now()
            .duration_since(self.start_time)
            .unwrap_or_default();
        self.context
            .access_log()
            .access(&self.scope, &ResponseSummary::status(status), elapsed);
    }

    async fn send_response_head(&self, status: u16, headers: Vec<(Bytes, Bytes)>) -> Result<(), Error> {
        let headers = stamp_response_headers(
            filter_hop_by_hop(build_and_validate_headers(&headers)?),
            self.context.clock(),
            "h3",
            self.config.include_server_header,
        );
        let mut response = Response::builder().status(
            StatusCode::from_u16(status).map_err(|_| Error::UnexpectedMessage {
                state: "request",
                message: "http.response.start",
            })?,
        );
        for (name, value) in &headers {
            let name = HeaderName::from_bytes(name).map_err(|_| Error::InvalidHeader)?;
            let value = HeaderValue::from_bytes(value).map_err(|_| Error::InvalidHeader)?;
            response = response.header(name, value);
        }
        let response = response.body(()).map_err(|_| Error::InvalidHeader)?;
        self.send
            .lock()
            .await
            .send_response(response)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        self.log_access(status);
        Ok(())
    }

    async fn finish(&self, error: Option<crate::error::BoxError>) {
        if let Some(error) = &error {
            tracing::error!(target: "tricorn::app", error = %error, "application error");
        }
        match self.state() {
            H3StreamState::Request => {
                let headers = vec![(
                    Bytes::from_static(b"content-length"),
                    Bytes::from_static(b"0"),
                )];
                if self.send_response_head(500, headers).await.is_ok() {
                    let _ = self.send.lock().await.finish().await;
                }
                self.set_state(H3StreamState::Closed);
            }
            H3StreamState::Response => {
                // Truncated: end the stream where it stands.
                let _ = self.send.lock().await.finish().await;
                self.set_state(H3StreamState::Closed);
            }
            H3StreamState::Closed => {}
        }
    }
}

#[async_trait]
impl<S> MessageSink for H3Sink<S>
where
    S: h3::quic::SendStream<Bytes> + Send + 'static,
{
    async fn app_send(&self, _stream_id: u64, message: AsgiMessage) -> Result<(), Error> {
        match message {
            AsgiMessage::HttpResponseStart { status, headers }
                if self.state() == H3StreamState::Request =>
            {
                self.send_response_head(status, headers).await?;
                *self.status.lock().expect("status lock") = Some(status);
                self.set_state(H3StreamState::Response);
                Ok(())
            }
            AsgiMessage::HttpResponseBody { body, more_body }
                if self.state() == H3StreamState::Response =>
            {
                let status = self.status.lock().expect("status lock").unwrap_or(200);
                let suppressed = suppress_body(&self.method, status);
                if !suppressed && !body.is_empty() {
                    self.send
                        .lock()
                        .await
                        .send_data(body)
                        .await
                        .map_err(|_| Error::ConnectionClosed)?;
                }
                if !more_body {
                    self.send
                        .lock()
                        .await
                        .finish()
                        .await
                        .map_err(|_| Error::ConnectionClosed)?;
                    self.set_state(H3StreamState::Closed);
                }
                Ok(())
            }
            // Sends after the exchange completed are dropped.
            _ if self.state() == H3StreamState::Closed => Ok(()),
            message => Err(Error::UnexpectedMessage {
                state: "h3",
                message: message.kind(),
            }),
        }
    }
}

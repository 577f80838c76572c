//! tricorn - protocol core for an asynchronous gateway-interface server.
//!
//! This crate terminates HTTP/1.1, HTTP/2 and WebSocket conversations on a
//! single connection, multiplexes them onto independent streams, and
//! mediates between the wire and application tasks with strict ordering and
//! backpressure. An optional HTTP/3 adapter (cargo feature `h3`) bridges a
//! QUIC connection onto the same application contract.
//!
//! The listener loop, TLS termination and worker supervision live outside
//! this crate. A listener hands each accepted byte stream to
//! [`serve_connection`], or drives a [`Connection`] directly through
//! [`ConnectionEvent`]s when it owns the IO loop itself:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tricorn::{
//!     serve_connection, App, AppReceiver, AppSender, AsgiMessage, BoxError, Config,
//!     ConnectionInfo, Scope, WorkerContext,
//! };
//!
//! async fn hello(_scope: Scope, mut rx: AppReceiver, tx: AppSender) -> Result<(), BoxError> {
//!     while let Some(message) = rx.receive().await {
//!         if matches!(message, AsgiMessage::HttpRequest { more_body: false, .. }) {
//!             tx.send(AsgiMessage::HttpResponseStart { status: 200, headers: vec![] }).await?;
//!             tx.send(AsgiMessage::HttpResponseBody {
//!                 body: "OK".into(),
//!                 more_body: false,
//!             })
//!             .await?;
//!         }
//!     }
//!     Ok(())
//! }
//!
//! # async fn accept_loop(listener: tokio::net::TcpListener) -> Result<(), BoxError> {
//! let app: Arc<dyn App> = Arc::new(hello);
//! let config = Arc::new(Config::default());
//! let context = WorkerContext::new();
//! loop {
//!     let (socket, peer) = listener.accept().await?;
//!     let info = ConnectionInfo { client: Some(peer), ..Default::default() };
//!     tokio::spawn(serve_connection(
//!         socket,
//!         app.clone(),
//!         config.clone(),
//!         context.clone(),
//!         info,
//!     ));
//! }
//! # }
//! ```
//!
//! Application code follows the gateway contract: a `(scope, receive, send)`
//! callable per stream, plus a lifespan scope dispatched once per worker by
//! [`Lifespan`]. A blocking application stalls wire progress on its own
//! connection only; offload blocking sections with
//! `tokio::task::spawn_blocking`.

mod asgi;
mod channel;
mod clock;
mod codec;
mod config;
mod connection;
mod error;
mod events;
mod headers;
mod lifespan;
mod logging;
mod protocol;
mod serve;
mod worker;

pub use asgi::{
    App, AppSender, AsgiMessage, HttpScope, HttpVersion, Scope, WebsocketScope, WsData,
    SPEC_VERSION,
};
pub use channel::AppReceiver;
pub use clock::{Clock, FixedClock, SystemClock};
pub use codec::h1::ParseError as H1ParseError;
pub use codec::h2::{FrameError as H2FrameError, HpackError, Reason as H2Reason};
pub use codec::ws::FrameError as WsFrameError;
pub use config::Config;
pub use connection::{Connection, ConnectionInfo};
pub use error::{BoxError, Error};
pub use events::ConnectionEvent;
pub use lifespan::Lifespan;
pub use logging::{AccessLog, NullAccessLog, ResponseSummary, TracingAccessLog};
pub use serve::serve_connection;
pub use worker::WorkerContext;

#[cfg(feature = "h3")]
pub use protocol::h3::serve_connection as serve_h3_connection;

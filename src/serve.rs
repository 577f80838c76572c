//! Drive one accepted byte stream through a [`Connection`], applying the
//! read, keep-alive, response and graceful-shutdown timeouts.
//!
//! This is the seam a listener calls once per accepted socket; accepting
//! sockets, TLS and worker supervision stay outside this crate.

use std::sync::Arc;

use bytes::BytesMut;
use futures_util::future::OptionFuture;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::asgi::App;
use crate::config::Config;
use crate::connection::{Connection, ConnectionInfo};
use crate::error::Error;
use crate::events::ConnectionEvent;
use crate::worker::WorkerContext;

const READ_BUFFER: usize = 64 * 1024;
const EVENT_BUFFER: usize = 16;

/// Serve one connection until it closes, times out or the worker drains.
pub async fn serve_connection<IO>(
    io: IO,
    app: Arc<dyn App>,
    config: Arc<Config>,
    context: WorkerContext,
    info: ConnectionInfo,
) -> Result<(), Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(io);
    let (event_tx, mut event_rx) = mpsc::channel::<ConnectionEvent>(EVENT_BUFFER);
    let conn = Connection::new(app, config.clone(), context.clone(), info, event_tx);
    conn.initiate().await?;

    let closed = conn.closed().clone();
    let (idle_tx, idle_rx) = watch::channel(true);
    let writer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                ConnectionEvent::RawData { data, .. } => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                    if write_half.flush().await.is_err() {
                        break;
                    }
                }
                ConnectionEvent::Updated { idle } => {
                    idle_tx.send_replace(idle);
                }
                ConnectionEvent::Closed => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut buf = BytesMut::with_capacity(READ_BUFFER);
    let mut grace_deadline: Option<Instant> = None;
    loop {
        let now = Instant::now();
        let mut deadline: Option<Instant> = None;
        let mut push_deadline = |candidate: Instant| {
            deadline = Some(deadline.map_or(candidate, |current| current.min(candidate)));
        };
        if let Some(read_timeout) = config.read_timeout {
            push_deadline(now + read_timeout);
        }
        if *idle_rx.borrow() {
            push_deadline(now + config.keep_alive_timeout);
        }
        if let Some(response_deadline) = conn.response_deadline().await {
            push_deadline(response_deadline);
        }
        if let Some(grace) = grace_deadline {
            push_deadline(grace);
        }
        let timer: OptionFuture<_> = deadline.map(tokio::time::sleep_until).into();

        tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            _ = context.terminated().cancelled(), if grace_deadline.is_none() => {
                grace_deadline = Some(Instant::now() + config.shutdown_timeout);
                if conn.graceful_shutdown().await.is_err() {
                    break;
                }
            }
            Some(_) = timer => {
                let _ = conn.handle(ConnectionEvent::Closed).await;
                break;
            }
            result = read_half.read_buf(&mut buf) => match result {
                Ok(0) | Err(_) => {
                    let _ = conn.handle(ConnectionEvent::Closed).await;
                    break;
                }
                Ok(_) => {
                    let data = buf.split().freeze();
                    if conn
                        .handle(ConnectionEvent::RawData { data, address: None })
                        .await
                        .is_err()
                    {
                        let _ = conn.handle(ConnectionEvent::Closed).await;
                        break;
                    }
                }
            },
        }
    }

    conn.finish().await;
    drop(conn);
    let _ = writer.await;
    Ok(())
}

//! The per-connection async shell.
//!
//! Owns the protocol state machine behind a mutex and performs its effects
//! (wire events, app-channel deliveries, task spawns) outside the lock. The
//! wire task feeds [`Connection::handle`]; each application task reaches
//! back in through [`AppSender`]. All suspension points live here: the
//! outbound channel, the app channels, the HTTP/1 read gate and the HTTP/2
//! send-window waits.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::asgi::{App, AppSender, AsgiMessage, MessageSink};
use crate::config::Config;
use crate::error::Error;
use crate::events::ConnectionEvent;
use crate::protocol::h2::H2Protocol;
use crate::protocol::{
    Effect, HandleStatus, Outbox, ProtocolDispatch, SendOutcome, UpgradeSignal,
};
use crate::worker::WorkerContext;

/// Transport facts the listener knows about one accepted connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub ssl: bool,
    pub client: Option<SocketAddr>,
    pub server: Option<SocketAddr>,
    /// Negotiated ALPN protocol, when TLS terminated in front of us.
    pub alpn_protocol: Option<String>,
}

struct ConnInner {
    app: Arc<dyn App>,
    config: Arc<Config>,
    context: WorkerContext,
    info: ConnectionInfo,
    send: mpsc::Sender<ConnectionEvent>,
    proto: Mutex<ProtocolDispatch>,
    can_read: watch::Sender<bool>,
    closed: CancellationToken,
    tasks: TaskTracker,
    aborts: StdMutex<Vec<AbortHandle>>,
}

/// One accepted connection: protocol dispatch plus application task group.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    pub fn new(
        app: Arc<dyn App>,
        config: Arc<Config>,
        context: WorkerContext,
        info: ConnectionInfo,
        send: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let proto = if info.alpn_protocol.as_deref() == Some("h2") {
            ProtocolDispatch::H2(H2Protocol::new(
                config.clone(),
                context.clone(),
                info.ssl,
                info.client,
                info.server,
            ))
        } else {
            ProtocolDispatch::H1(crate::protocol::h1::H1Protocol::new(
                config.clone(),
                context.clone(),
                info.ssl,
                info.client,
                info.server,
            ))
        };
        let (can_read, _) = watch::channel(true);
        Connection {
            inner: Arc::new(ConnInner {
                app,
                config,
                context,
                info,
                send,
                proto: Mutex::new(proto),
                can_read,
                closed: CancellationToken::new(),
                tasks: TaskTracker::new(),
                aborts: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Emit any protocol-initial frames (the HTTP/2 SETTINGS).
    pub async fn initiate(&self) -> Result<(), Error> {
        let mut out = Outbox::new();
        {
            let mut proto = self.inner.proto.lock().await;
            if let ProtocolDispatch::H2(h2) = &mut *proto {
                h2.initiate(None, &mut out)?;
            }
        }
        pump(&self.inner, out).await
    }

    /// Feed one inbound event. Wire callers must not overlap calls; the
    /// HTTP/1 pipelining gate suspends this method until the active
    /// exchange completes.
    pub async fn handle(&self, event: ConnectionEvent) -> Result<(), Error> {
        let mut status = {
            let mut proto = self.inner.proto.lock().await;
            let mut out = Outbox::new();
            let status = proto.handle(event, &mut out)?;
            apply_upgrade(&self.inner, &mut proto, &mut out)?;
            drop(proto);
            pump(&self.inner, out).await?;
            status
        };
        while status == HandleStatus::Paused {
            let mut gate = self.inner.can_read.subscribe();
            tokio::select! {
                result = gate.wait_for(|open| *open) => {
                    if result.is_err() {
                        return Ok(());
                    }
                }
                _ = self.inner.closed.cancelled() => return Ok(()),
                _ = self.inner.context.terminated().cancelled() => return Ok(()),
            }
            status = {
                let mut proto = self.inner.proto.lock().await;
                let mut out = Outbox::new();
                let status = proto.resume_reading(&mut out)?;
                apply_upgrade(&self.inner, &mut proto, &mut out)?;
                drop(proto);
                pump(&self.inner, out).await?;
                status
            };
        }
        Ok(())
    }

    /// Ask the protocol to drain and close (GOAWAY on HTTP/2).
    pub async fn graceful_shutdown(&self) -> Result<(), Error> {
        let mut out = Outbox::new();
        {
            let mut proto = self.inner.proto.lock().await;
            proto.shutdown(&mut out);
        }
        pump(&self.inner, out).await
    }

    /// No live streams on this connection.
    pub async fn idle(&self) -> bool {
        self.inner.proto.lock().await.idle()
    }

    /// Deadline for the response timeout, if a request is in flight.
    pub async fn response_deadline(&self) -> Option<tokio::time::Instant> {
        let timeout = self.inner.config.response_timeout?;
        let since = self.inner.proto.lock().await.oldest_pending_response()?;
        Some(since + timeout)
    }

    /// Resolved once the protocol has emitted `Closed`.
    pub fn closed(&self) -> &CancellationToken {
        &self.inner.closed
    }

    /// Give application tasks the shutdown grace period, then abort the
    /// stragglers.
    pub async fn finish(&self) {
        self.inner.tasks.close();
        let grace = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(grace, self.inner.tasks.wait())
            .await
            .is_err()
        {
            let aborts = {
                let mut aborts = self.inner.aborts.lock().expect("abort list lock");
                std::mem::take(&mut *aborts)
            };
            for abort in aborts {
                abort.abort();
            }
            self.inner.tasks.wait().await;
        }
    }
}

/// Rebind the connection to HTTP/2 when HTTP/1 signalled an upgrade.
fn apply_upgrade(
    inner: &Arc<ConnInner>,
    proto: &mut ProtocolDispatch,
    out: &mut Outbox,
) -> Result<(), Error> {
    let upgrade = match out.upgrade.take() {
        Some(upgrade) => upgrade,
        None => return Ok(()),
    };
    let mut h2 = H2Protocol::new(
        inner.config.clone(),
        inner.context.clone(),
        inner.info.ssl,
        inner.info.client,
        inner.info.server,
    );
    match upgrade {
        UpgradeSignal::H2c {
            settings,
            headers,
            data,
        } => {
            h2.initiate(Some((headers, settings)), out)?;
            if !data.is_empty() {
                h2.handle(
                    ConnectionEvent::RawData {
                        data,
                        address: None,
                    },
                    out,
                )?;
            }
        }
        UpgradeSignal::H2Prior { data } => {
            h2.initiate(None, out)?;
            h2.handle(
                ConnectionEvent::RawData {
                    data,
                    address: None,
                },
                out,
            )?;
        }
    }
    *proto = ProtocolDispatch::H2(h2);
    out.effects.push(Effect::CanRead(true));
    Ok(())
}

/// Perform the deferred effects outside the protocol lock, in order.
async fn pump(inner: &Arc<ConnInner>, out: Outbox) -> Result<(), Error> {
    for effect in out.effects {
        match effect {
            Effect::Wire(event) => {
                if matches!(event, ConnectionEvent::Closed) {
                    inner.closed.cancel();
                }
                let _ = inner.send.send(event).await;
            }
            Effect::App { tx, message } => {
                // A receiver dropped early just means the app returned.
                let _ = tx.send(message).await;
            }
            Effect::Spawn {
                stream_id,
                scope,
                receiver,
            } => spawn_app(inner, stream_id, scope, receiver),
            Effect::CanRead(open) => {
                inner.can_read.send_replace(open);
            }
        }
    }
    Ok(())
}

fn spawn_app(
    inner: &Arc<ConnInner>,
    stream_id: u64,
    scope: crate::asgi::Scope,
    receiver: crate::channel::AppReceiver,
) {
    if inner.tasks.is_closed() {
        return;
    }
    let sink: Arc<dyn MessageSink> = Arc::new(ConnSink(inner.clone()));
    let sender = AppSender::new(sink, stream_id);
    let app = inner.app.clone();
    let task_inner = inner.clone();
    let handle = inner.tasks.spawn(async move {
        let result = app.call(scope, receiver, sender).await;
        let error = result.err();
        let outcome = {
            let mut proto = task_inner.proto.lock().await;
            let mut out = Outbox::new();
            let result = proto.app_exit(stream_id, error, &mut out);
            (result, out)
        };
        if outcome.0.is_ok() {
            let _ = pump(&task_inner, outcome.1).await;
        }
    });
    inner
        .aborts
        .lock()
        .expect("abort list lock")
        .push(handle.abort_handle());
}

struct ConnSink(Arc<ConnInner>);

#[async_trait]
impl MessageSink for ConnSink {
    async fn app_send(&self, stream_id: u64, message: AsgiMessage) -> Result<(), Error> {
        let inner = &self.0;
        let mut outcome = {
            let mut proto = inner.proto.lock().await;
            let mut out = Outbox::new();
            let outcome = proto.app_send(stream_id, message, &mut out)?;
            apply_upgrade(inner, &mut proto, &mut out)?;
            drop(proto);
            pump(inner, out).await?;
            outcome
        };
        // A zero HTTP/2 send window suspends the sending task here until a
        // WINDOW_UPDATE arrives.
        while let SendOutcome::Blocked(mut window) = outcome {
            tokio::select! {
                changed = window.changed() => {
                    if changed.is_err() {
                        return Err(Error::ConnectionClosed);
                    }
                }
                _ = inner.closed.cancelled() => return Err(Error::ConnectionClosed),
                _ = inner.context.terminated().cancelled() => {
                    return Err(Error::ConnectionClosed)
                }
            }
            outcome = {
                let mut proto = inner.proto.lock().await;
                let mut out = Outbox::new();
                let outcome = proto.resume_send(stream_id, &mut out)?;
                drop(proto);
                pump(inner, out).await?;
                outcome
            };
        }
        Ok(())
    }
}

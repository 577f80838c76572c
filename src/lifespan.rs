//! Once-per-worker lifespan dispatch: startup and shutdown handshakes with
//! the application.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::asgi::{App, AppSender, AsgiMessage, MessageSink, Scope};
use crate::channel::AppReceiver;
use crate::config::Config;
use crate::error::Error;
use crate::worker::WorkerContext;

struct LifespanSink {
    tx: mpsc::Sender<AsgiMessage>,
}

#[async_trait]
impl MessageSink for LifespanSink {
    async fn app_send(&self, _stream_id: u64, message: AsgiMessage) -> Result<(), Error> {
        match message {
            AsgiMessage::LifespanStartupComplete
            | AsgiMessage::LifespanStartupFailed { .. }
            | AsgiMessage::LifespanShutdownComplete
            | AsgiMessage::LifespanShutdownFailed { .. } => {
                let _ = self.tx.send(message).await;
                Ok(())
            }
            message => Err(Error::UnexpectedMessage {
                state: "lifespan",
                message: message.kind(),
            }),
        }
    }
}

/// Drives the lifespan scope for one worker.
///
/// Applications that exit without acknowledging startup are treated as not
/// speaking the lifespan protocol, unless `Config::lifespan_strict` is set.
pub struct Lifespan {
    app: Arc<dyn App>,
    config: Arc<Config>,
    _context: WorkerContext,
    to_app: Option<mpsc::Sender<AsgiMessage>>,
    from_app: Option<mpsc::Receiver<AsgiMessage>>,
    supported: bool,
    task: Option<JoinHandle<()>>,
}

impl Lifespan {
    pub fn new(app: Arc<dyn App>, config: Arc<Config>, context: WorkerContext) -> Self {
        Lifespan {
            app,
            config,
            _context: context,
            to_app: None,
            from_app: None,
            supported: false,
            task: None,
        }
    }

    pub async fn startup(&mut self) -> Result<(), Error> {
        let capacity = self.config.max_app_queue_size.max(1);
        let (to_app_tx, to_app_rx) = mpsc::channel(capacity);
        let (from_app_tx, from_app_rx) = mpsc::channel(capacity);
        self.to_app = Some(to_app_tx.clone());
        self.from_app = Some(from_app_rx);

        let sink: Arc<dyn MessageSink> = Arc::new(LifespanSink { tx: from_app_tx });
        let sender = AppSender::new(sink, 0);
        let receiver = AppReceiver::from_raw(to_app_rx);
        let app = self.app.clone();
        self.task = Some(tokio::spawn(async move {
            if let Err(error) = app.call(Scope::Lifespan, receiver, sender).await {
                tracing::debug!(target: "tricorn::lifespan", %error, "lifespan task ended");
            }
        }));

        let _ = to_app_tx.send(AsgiMessage::LifespanStartup).await;
        let timeout = self.config.startup_timeout;
        let from_app = self.from_app.as_mut().expect("receiver just installed");
        let wait = tokio::time::timeout(timeout, async {
            loop {
                match from_app.recv().await {
                    Some(AsgiMessage::LifespanStartupComplete) => return Ok(true),
                    Some(AsgiMessage::LifespanStartupFailed { message }) => {
                        return Err(Error::LifespanFailure(message));
                    }
                    Some(other) => {
                        tracing::debug!(
                            target: "tricorn::lifespan",
                            message = other.kind(),
                            "ignoring unexpected lifespan message",
                        );
                    }
                    // The app returned without acknowledging: it does not
                    // speak the lifespan protocol.
                    None => return Ok(false),
                }
            }
        })
        .await;

        match wait {
            Ok(Ok(true)) => {
                self.supported = true;
                Ok(())
            }
            Ok(Ok(false)) => {
                if self.config.lifespan_strict {
                    Err(Error::LifespanFailure(
                        "application does not support the lifespan protocol".to_owned(),
                    ))
                } else {
                    tracing::debug!(
                        target: "tricorn::lifespan",
                        "application does not support the lifespan protocol",
                    );
                    Ok(())
                }
            }
            Ok(Err(error)) => Err(error),
            Err(_) => Err(Error::LifespanTimeout(timeout)),
        }
    }

    pub async fn shutdown(&mut self) {
        if !self.supported {
            self.stop().await;
            return;
        }
        if let Some(to_app) = &self.to_app {
            let _ = to_app.send(AsgiMessage::LifespanShutdown).await;
        }
        if let Some(from_app) = self.from_app.as_mut() {
            let wait = tokio::time::timeout(self.config.shutdown_timeout, async {
                loop {
                    match from_app.recv().await {
                        Some(AsgiMessage::LifespanShutdownComplete) | None => break,
                        Some(AsgiMessage::LifespanShutdownFailed { message }) => {
                            tracing::error!(
                                target: "tricorn::lifespan",
                                %message,
                                "lifespan shutdown failed",
                            );
                            break;
                        }
                        Some(_) => {}
                    }
                }
            })
            .await;
            if wait.is_err() {
                tracing::error!(target: "tricorn::lifespan", "lifespan shutdown timed out");
            }
        }
        self.stop().await;
    }

    async fn stop(&mut self) {
        self.to_app = None;
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(self.config.shutdown_timeout, task).await;
        }
    }
}

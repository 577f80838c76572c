use tokio::sync::mpsc;

use crate::asgi::AsgiMessage;

/// Producer half of the bounded queue between the wire task and one
/// application task.
///
/// Closing the channel is the distinguished close token: the consumer drains
/// whatever is queued and then observes `None`. Messages offered after close
/// are dropped.
#[derive(Debug)]
pub(crate) struct AppChannel {
    tx: Option<mpsc::Sender<AsgiMessage>>,
}

pub(crate) fn app_channel(capacity: usize) -> (AppChannel, AppReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (AppChannel { tx: Some(tx) }, AppReceiver { rx })
}

impl AppChannel {
    /// Sender handle used to deliver one message outside the protocol lock,
    /// or `None` once closed.
    pub(crate) fn sender(&self) -> Option<mpsc::Sender<AsgiMessage>> {
        self.tx.clone()
    }

    pub(crate) fn close(&mut self) {
        self.tx = None;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

/// Consumer half handed to the application task; yields `None` once the
/// stream is finished and the queue is drained.
#[derive(Debug)]
pub struct AppReceiver {
    rx: mpsc::Receiver<AsgiMessage>,
}

impl AppReceiver {
    pub async fn receive(&mut self) -> Option<AsgiMessage> {
        self.rx.recv().await
    }

    pub(crate) fn from_raw(rx: mpsc::Receiver<AsgiMessage>) -> Self {
        AppReceiver { rx }
    }
}

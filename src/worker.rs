use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::logging::{AccessLog, TracingAccessLog};

/// Worker-scoped collaborators passed explicitly to every connection,
/// replacing process-global state: the wall clock, the access logger and
/// the terminate signal.
#[derive(Clone)]
pub struct WorkerContext {
    clock: Arc<dyn Clock>,
    access_log: Arc<dyn AccessLog>,
    terminated: CancellationToken,
}

impl WorkerContext {
    pub fn new() -> Self {
        WorkerContext {
            clock: Arc::new(SystemClock),
            access_log: Arc::new(TracingAccessLog),
            terminated: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_access_log(mut self, access_log: Arc<dyn AccessLog>) -> Self {
        self.access_log = access_log;
        self
    }

    pub fn clock(&self) -> &dyn Clock {
        &*self.clock
    }

    pub fn access_log(&self) -> &dyn AccessLog {
        &*self.access_log
    }

    /// Signal every connection in this worker to drain and shut down.
    pub fn terminate(&self) {
        self.terminated.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    pub fn terminated(&self) -> &CancellationToken {
        &self.terminated
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("terminated", &self.terminated.is_cancelled())
            .finish_non_exhaustive()
    }
}

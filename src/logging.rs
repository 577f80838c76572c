use std::time::Duration;

use bytes::Bytes;

use crate::asgi::Scope;

/// Summary of an emitted response, as handed to the access logger.
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub status: u16,
    pub headers: Vec<(Bytes, Bytes)>,
}

impl ResponseSummary {
    pub(crate) fn status(status: u16) -> Self {
        ResponseSummary {
            status,
            headers: Vec::new(),
        }
    }
}

/// Injected access logger; one record per completed or failed exchange.
pub trait AccessLog: Send + Sync {
    fn access(&self, scope: &Scope, response: &ResponseSummary, elapsed: Duration);
}

/// Default access logger emitting structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn access(&self, scope: &Scope, response: &ResponseSummary, elapsed: Duration) {
        tracing::info!(
            target: "tricorn::access",
            kind = scope.kind(),
            method = scope.method().map(|m| m.as_str()).unwrap_or("-"),
            path = scope.path(),
            status = response.status,
            elapsed_ms = elapsed.as_millis() as u64,
        );
    }
}

/// Access logger that drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAccessLog;

impl AccessLog for NullAccessLog {
    fn access(&self, _scope: &Scope, _response: &ResponseSummary, _elapsed: Duration) {}
}

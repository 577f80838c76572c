use std::time::Duration;

/// Per-worker configuration for the protocol core.
///
/// This is a plain data holder; parsing it from files or CLI flags is the
/// job of the embedding server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum bytes an incomplete HTTP/1 request head may occupy before the
    /// connection is rejected with a 400.
    pub h1_max_incomplete_size: usize,
    /// Advertised SETTINGS_MAX_CONCURRENT_STREAMS.
    pub h2_max_concurrent_streams: u32,
    /// Advertised SETTINGS_MAX_HEADER_LIST_SIZE.
    pub h2_max_header_list_size: u32,
    /// Advertised SETTINGS_MAX_FRAME_SIZE.
    pub h2_max_inbound_frame_size: u32,
    /// Capacity of each stream's application message queue.
    pub max_app_queue_size: usize,
    /// Reject request bodies larger than this with a 413. `None` disables
    /// the limit.
    pub max_request_body_size: Option<usize>,
    /// Close connections that stay idle longer than this.
    pub keep_alive_timeout: Duration,
    /// Maximum time between bytes on an otherwise active connection.
    pub read_timeout: Option<Duration>,
    /// Maximum time from request dispatch to the first response event.
    pub response_timeout: Option<Duration>,
    /// Grace period granted to application tasks when a connection shuts
    /// down, before they are aborted.
    pub shutdown_timeout: Duration,
    /// Maximum time to wait for the application's lifespan startup
    /// acknowledgement.
    pub startup_timeout: Duration,
    /// Fail hard when the application does not speak the lifespan protocol.
    pub lifespan_strict: bool,
    /// Mounted path prefix reported to the application.
    pub root_path: String,
    /// Whether responses carry a `server` header when the application did
    /// not set one.
    pub include_server_header: bool,
    /// Largest accepted websocket message after reassembly (and inflation).
    pub websocket_max_message_size: usize,
    /// Offer and accept the permessage-deflate extension during websocket
    /// handshakes.
    pub websocket_permessage_deflate: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            h1_max_incomplete_size: 16 * 1024,
            h2_max_concurrent_streams: 100,
            h2_max_header_list_size: 65535,
            h2_max_inbound_frame_size: 16384,
            max_app_queue_size: 10,
            max_request_body_size: None,
            keep_alive_timeout: Duration::from_secs(5),
            read_timeout: None,
            response_timeout: None,
            shutdown_timeout: Duration::from_secs(3),
            startup_timeout: Duration::from_secs(60),
            lifespan_strict: false,
            root_path: String::new(),
            include_server_header: true,
            websocket_max_message_size: 16 * 1024 * 1024,
            websocket_permessage_deflate: false,
        }
    }
}

//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.
//! Durations are expressed in milliseconds; a value of `0` disables the
//! corresponding timeout.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Root configuration for one HTTP server component.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host (e.g., "0.0.0.0"). Empty binds all interfaces.
    pub host: String,

    /// Bind port. `0` asks the OS for an ephemeral port.
    pub port: u16,

    /// Listener network: "tcp", "tcp4" or "tcp6".
    pub network: String,

    /// Time allowed to read the request head. Falls back to `read_timeout_ms`.
    pub read_header_timeout_ms: u64,

    /// Time allowed to receive a request; the handler's run time is not counted.
    pub read_timeout_ms: u64,

    /// Idle write timeout on the connection.
    pub write_timeout_ms: u64,

    /// Per-request deadline installed by the timeout interceptor.
    pub context_timeout_ms: u64,

    /// Requests slower than this emit a "slow" warning.
    pub slow_log_threshold_ms: u64,

    /// Enable the metrics interceptor.
    pub enable_metric_interceptor: bool,

    /// Enable the tracing interceptor (needs a registered tracer).
    pub enable_trace_interceptor: bool,

    /// Resolve the host from the primary outbound interface.
    pub enable_local_main_ip: bool,

    /// Compress responses with gzip.
    pub enable_gzip: bool,

    /// Emit one access record per request.
    pub enable_access_interceptor: bool,

    /// Request/response body capture for the access log.
    #[serde(flatten)]
    pub access_log_capture: AccessLogCapture,

    /// Accept WebSocket upgrades from any origin.
    pub enable_websocket_check_origin: bool,

    /// WebSocket read buffer size in bytes (0 = library default).
    pub websocket_read_buffer_size: usize,

    /// WebSocket write buffer size in bytes (0 = library default).
    pub websocket_write_buffer_size: usize,

    /// Response header carrying the trace id of traced requests.
    pub trace_id_header: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            network: "tcp".to_string(),
            read_header_timeout_ms: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            context_timeout_ms: 0,
            slow_log_threshold_ms: 500,
            enable_metric_interceptor: true,
            enable_trace_interceptor: true,
            enable_local_main_ip: false,
            enable_gzip: false,
            enable_access_interceptor: true,
            access_log_capture: AccessLogCapture::default(),
            enable_websocket_check_origin: false,
            websocket_read_buffer_size: 0,
            websocket_write_buffer_size: 0,
            trace_id_header: "x-trace-id".to_string(),
        }
    }
}

impl ServerConfig {
    /// `host:port` as handed to the listener.
    pub fn address(&self) -> String {
        if self.host.is_empty() {
            format!("0.0.0.0:{}", self.port)
        } else if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn read_header_timeout(&self) -> Option<Duration> {
        positive_millis(self.read_header_timeout_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        positive_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        positive_millis(self.write_timeout_ms)
    }

    /// Only a positive context timeout installs the deadline interceptor.
    pub fn context_timeout(&self) -> Option<Duration> {
        positive_millis(self.context_timeout_ms)
    }

    pub fn slow_log_threshold(&self) -> Option<Duration> {
        positive_millis(self.slow_log_threshold_ms)
    }
}

fn positive_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Body-capture toggles of the access log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureFlags {
    /// Attach request headers and payload to access records.
    #[serde(rename = "enable_access_interceptor_req")]
    pub request_body: bool,

    /// Attach response headers and payload to access records.
    #[serde(rename = "enable_access_interceptor_res")]
    pub response_body: bool,
}

/// Shared, lock-guarded [`CaptureFlags`].
///
/// These are the only settings changed while requests are in flight (by the
/// reload path), so they sit behind their own `RwLock`. Clones share the same
/// flags. Readers never block each other; the last write wins.
#[derive(Debug, Clone, Default)]
pub struct AccessLogCapture(Arc<RwLock<CaptureFlags>>);

impl AccessLogCapture {
    pub fn new(flags: CaptureFlags) -> Self {
        Self(Arc::new(RwLock::new(flags)))
    }

    /// Snapshot the current flags under the read lock.
    pub fn load(&self) -> CaptureFlags {
        *self.0.read().expect("access log capture lock poisoned")
    }

    /// Replace the flags under the write lock.
    pub fn store(&self, flags: CaptureFlags) {
        *self.0.write().expect("access log capture lock poisoned") = flags;
    }

    /// Apply the capture flags of every reloaded config until the channel closes.
    pub async fn follow(self, mut updates: tokio::sync::mpsc::UnboundedReceiver<ServerConfig>) {
        while let Some(config) = updates.recv().await {
            let flags = config.access_log_capture.load();
            if flags != self.load() {
                tracing::info!(
                    request_body = flags.request_body,
                    response_body = flags.response_body,
                    "Access log capture updated"
                );
                self.store(flags);
            }
        }
    }
}

impl Serialize for AccessLogCapture {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.load().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AccessLogCapture {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        CaptureFlags::deserialize(deserializer).map(Self::new)
    }
}

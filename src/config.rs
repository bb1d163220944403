//! # Configuration Module
//!
//! A single [`AppConfig`] is handed to [`App::start`](crate::App::start) and
//! is read-only from that point on. The structs derive `serde::Deserialize`
//! so embedders can load them from any serde-compatible source (TOML, YAML,
//! JSON, env layering), and every field has a production-safe default.
//!
//! ## Sections
//!
//! - top level: `host` / `port`
//! - `server`: worker sizing, connection and payload limits, temp directory
//! - `http`: default error-body shape and keep-alive timeout
//! - `socket`: per-connection TCP tuning
//! - `logger`: carried for the embedder's log subscriber; the crate itself
//!   only emits `tracing` events

use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

/// Default port used when the configured value does not parse.
pub const DEFAULT_PORT: u16 = 8080;

/// Top-level configuration passed to `start()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Hostname or IP address to bind. `"localhost"` is normalized to
    /// `"127.0.0.1"` at startup.
    pub host: String,
    /// Port, kept as a string so it can come straight from an environment
    /// variable. Invalid or non-positive values fall back to 8080.
    pub port: String,
    /// Server-specific options.
    pub server: ServerConfig,
    /// HTTP behavior options.
    pub http: HttpConfig,
    /// Per-socket TCP options.
    pub socket: SocketConfig,
    /// Logger options, consumed by the embedder's subscriber.
    pub logger: LoggerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: "8080".to_string(),
            server: ServerConfig::default(),
            http: HttpConfig::default(),
            socket: SocketConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve the effective bind host, folding `localhost` to its IPv4
    /// loopback form.
    pub fn normalized_host(&self) -> String {
        if self.host == "localhost" {
            "127.0.0.1".to_string()
        } else {
            self.host.clone()
        }
    }

    /// Parse the configured port, falling back to 8080 for anything that is
    /// not a positive integer.
    pub fn normalized_port(&self) -> u16 {
        match self.port.parse::<u16>() {
            Ok(p) if p > 0 => p,
            _ => {
                warn!(port = %self.port, "Port is not usable, falling back to {}", DEFAULT_PORT);
                DEFAULT_PORT
            }
        }
    }
}

/// Worker sizing, connection limits and payload thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Number of scheduler worker threads. Zero or negative means
    /// "hardware concurrency".
    pub workers: i32,
    /// Listen backlog and rough cap on simultaneous connections.
    pub max_connections: i32,
    /// Maximum request size in bytes (headers during the read phase, body
    /// via Content-Length).
    pub max_request_size: usize,
    /// Socket read chunk size used when spilling request bodies.
    pub max_chunk_size: usize,
    /// Chunk size for disk writes during multipart parsing.
    pub max_chunk_size_disk: usize,
    /// Largest single uploaded file kept in memory.
    pub max_file_size_in_memory: usize,
    /// Cap on the combined size of in-memory uploaded files per request.
    pub max_files_size_in_memory: usize,
    /// Directory for spill files, created at startup if missing.
    pub tmp_dir: PathBuf,
    /// Stack size for connection and handler coroutines.
    pub stack_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_connections: 2048,
            max_request_size: 100 * 1024 * 1024,
            max_chunk_size: 128 * 1024,
            max_chunk_size_disk: 512 * 1024,
            max_file_size_in_memory: 1024 * 1024,
            max_files_size_in_memory: 10 * 1024 * 1024,
            tmp_dir: std::env::temp_dir().join("trellis_tmp"),
            stack_size: 0x10000,
        }
    }
}

/// Shape of framework-generated error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseClass {
    /// `text/plain` bodies like `Not found`.
    Plain,
    /// `application/json` bodies like `{"message":"Not found"}`.
    Json,
}

impl Default for ResponseClass {
    fn default() -> Self {
        ResponseClass::Plain
    }
}

/// HTTP behavior options.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Error-body shape for framework-generated responses.
    pub response_class: ResponseClass,
    /// Seconds advertised in the `Keep-Alive: timeout=` response header.
    pub keep_alive_timeout: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            response_class: ResponseClass::Plain,
            keep_alive_timeout: 30,
        }
    }
}

/// Per-connection TCP socket tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Set TCP_NODELAY on accepted sockets.
    pub tcp_no_delay: bool,
    /// SO_RCVBUF for accepted sockets, zero leaves the kernel default.
    pub rcv_buf_size: usize,
    /// SO_SNDBUF for accepted sockets, zero leaves the kernel default.
    pub snd_buf_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_no_delay: true,
            rcv_buf_size: 512 * 1024,
            snd_buf_size: 512 * 1024,
        }
    }
}

/// What an asynchronous log buffer does when it fills up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Drop the oldest buffered record.
    DiscardOldest,
    /// Drop the incoming record.
    DiscardNewest,
    /// Block the producer until space frees up.
    Block,
}

/// Logger options. The framework emits `tracing` events and never installs
/// a subscriber itself; these knobs are carried so the embedder can
/// configure one consistently.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Minimum severity, e.g. `"info"`.
    pub level: String,
    /// Flush after every record.
    pub force_flush: bool,
    /// Buffer records and write from a background consumer.
    #[serde(rename = "async")]
    pub async_log: bool,
    /// Size of the asynchronous buffer.
    pub buffer_size: usize,
    /// Behavior when the buffer overflows.
    pub overflow_strategy: OverflowStrategy,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            force_flush: false,
            async_log: true,
            buffer_size: 16384,
            overflow_strategy: OverflowStrategy::DiscardOldest,
        }
    }
}

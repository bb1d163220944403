#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Once;
use std::time::Duration;
use trellis::{App, AppConfig};

static TRACING: Once = Once::new();

/// Install a test subscriber once per test binary. Honors `RUST_LOG`,
/// defaults to errors only so failures stay readable.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Grab a port that was free a moment ago. Good enough for tests that
/// bind right away.
pub fn free_port() -> u16 {
    let probe = TcpListener::bind("127.0.0.1:0").expect("bind probe socket");
    let port = probe.local_addr().expect("probe addr").port();
    drop(probe);
    port
}

/// Test configuration bound to loopback on a fresh port with a private
/// temp directory.
pub fn test_config(tmp_dir: &std::path::Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.host = "127.0.0.1".to_string();
    cfg.port = free_port().to_string();
    cfg.server.workers = 2;
    cfg.server.tmp_dir = tmp_dir.to_path_buf();
    cfg
}

/// Start the app and return the bound address once it accepts connections.
pub fn start_app(app: &App, cfg: AppConfig) -> SocketAddr {
    init_tracing();
    app.start(cfg).expect("server should start");
    let addr = app.local_addr().expect("server should expose its address");
    for _ in 0..50 {
        if TcpStream::connect(addr).is_ok() {
            return addr;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("server did not become ready at {addr}");
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect to test server");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("set read timeout");
    stream
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// One parsed HTTP response off the wire.
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
            .map(|line| line[name.len() + 1..].trim().to_string())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Write a raw request and read exactly one response, honoring either
/// `Content-Length` or chunked framing so keep-alive sockets stay usable.
pub fn round_trip(stream: &mut TcpStream, raw_request: &[u8]) -> RawResponse {
    stream.write_all(raw_request).expect("write request");
    stream.flush().expect("flush request");
    read_response(stream)
}

pub fn read_response(stream: &mut TcpStream) -> RawResponse {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).expect("read response head");
        assert!(n > 0, "connection closed before response head completed");
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code in status line");

    let mut rest = buf[head_end + 4..].to_vec();
    let lowered = head.to_ascii_lowercase();

    let body = if lowered.contains("transfer-encoding: chunked") {
        while find_subslice(&rest, b"0\r\n\r\n").is_none() {
            let n = stream.read(&mut tmp).expect("read chunked body");
            assert!(n > 0, "connection closed before chunk terminator");
            rest.extend_from_slice(&tmp[..n]);
        }
        decode_chunked(&rest)
    } else {
        let content_length: usize = head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with("content-length:"))
            .and_then(|line| line.split(':').nth(1))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        while rest.len() < content_length {
            let n = stream.read(&mut tmp).expect("read body");
            assert!(n > 0, "connection closed before body completed");
            rest.extend_from_slice(&tmp[..n]);
        }
        rest.truncate(content_length);
        rest
    };

    RawResponse { status, head, body }
}

fn decode_chunked(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let line_end = find_subslice(&data[pos..], b"\r\n").expect("chunk size line") + pos;
        let size_str = String::from_utf8_lossy(&data[pos..line_end]);
        let size = usize::from_str_radix(size_str.trim(), 16).expect("hex chunk size");
        pos = line_end + 2;
        if size == 0 {
            break;
        }
        out.extend_from_slice(&data[pos..pos + size]);
        pos += size + 2; // skip chunk data and trailing CRLF
    }
    out
}

//! Per-connection request pipeline.
//!
//! One coroutine runs one connection. Requests on a connection are handled
//! strictly in order: the next head read does not start until the previous
//! response is fully on the wire. Clean disconnects (end of stream,
//! connection reset, shutdown) end the loop silently; protocol errors
//! produce a framework error response and the loop continues unless the
//! close flag was set.

use crate::app::AppCore;
use crate::error::{Error, Result};
use crate::http::request::ClientInfo;
use crate::http::response::default_error_response;
use crate::http::upload::unique_temp_path;
use crate::http::{ChunkWriter, HeaderMap, Method, Request, Response};
use bytes::{Buf, BytesMut};
use memchr::memmem;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::Ordering;
use tracing::{debug, error};

/// Prefix for request-body spill files under the temp directory.
pub(crate) const UPLOAD_SPILL_PREFIX: &str = "upload";

/// Socket read size for the header phase and plain bodies.
const READ_CHUNK: usize = 8192;

/// Parsed request line and headers, before any body handling.
struct Head {
    method: Method,
    uri: String,
    headers: HeaderMap,
}

/// Whether the connection loop should keep serving after an iteration.
enum Flow {
    Continue,
    Close,
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Standard WebSocket upgrade signature: a `Connection` header carrying
/// the `upgrade` token plus `Upgrade: websocket`.
fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade = headers
        .get("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrade = headers
        .get("connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    upgrade && connection_upgrade
}

fn cooperative_yield() {
    if may::coroutine::is_coroutine() {
        may::coroutine::yield_now();
    }
}

pub(crate) struct Connection {
    stream: may::net::TcpStream,
    peer: SocketAddr,
    buf: BytesMut,
    close: bool,
}

impl Connection {
    pub(crate) fn new(stream: may::net::TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            buf: BytesMut::with_capacity(READ_CHUNK),
            close: false,
        }
    }

    /// Serve requests until the client disconnects, an error forces a
    /// close, or the server begins shutting down.
    pub(crate) fn run(mut self, core: &AppCore) {
        if !core.running.load(Ordering::Acquire) {
            return;
        }

        loop {
            if !core.running.load(Ordering::Relaxed) {
                break;
            }

            match self.serve_one(core) {
                Ok(Flow::Continue) => continue,
                Ok(Flow::Close) => break,
                Err(err) => {
                    error!(
                        peer = %self.peer,
                        error = %err,
                        "Error while handling connection"
                    );
                    let status = if err.status() == 400 { 400 } else { 500 };
                    let response = default_error_response(status, core.response_class);
                    if self.write_buffered(response, true, core.keep_alive_timeout).is_err() {
                        break;
                    }
                    if self.close {
                        break;
                    }
                }
            }
        }
    }

    /// One request/response cycle.
    fn serve_one(&mut self, core: &AppCore) -> Result<Flow> {
        let head = match self.read_head(core.max_request_size)? {
            Some(head) => head,
            None => return Ok(Flow::Close),
        };

        let is_websocket = is_websocket_upgrade(&head.headers);

        let mut request = Request::new(head.method, head.uri, head.headers);

        let is_multipart = request
            .headers()
            .get("content-type")
            .map(|ct| starts_with_ignore_case(ct, "multipart/form-data"))
            .unwrap_or(false);

        if is_multipart {
            let content_length = request
                .headers()
                .get("content-length")
                .ok_or_else(|| Error::client("Missing Content-Length for multipart"))?
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::client("Invalid Content-Length"))?;
            if content_length > core.max_request_size as u64 {
                return Err(Error::client("Max request size reached"));
            }

            let spill = unique_temp_path(&core.tmp_dir, UPLOAD_SPILL_PREFIX);
            self.stream_body_to_file(content_length as usize, core.max_chunk_size, &spill)?;
            request.attach_spill(spill);
        } else {
            let content_length = match request.headers().get("content-length") {
                Some(value) => value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Error::client("Invalid Content-Length"))?,
                None => 0,
            };
            if content_length > core.max_request_size {
                return Err(Error::client("Max request size reached"));
            }
            if content_length > 0 {
                let body = self.read_body(content_length)?;
                request.set_body(body);
            }
        }

        request.set_client(ClientInfo::new(self.peer.ip().to_string(), self.peer.port()));

        if is_websocket {
            debug!(peer = %self.peer, "WebSocket upgrade detected, leaving request loop");
            return Ok(Flow::Close);
        }

        self.handle_request(core, request);

        if self.close {
            Ok(Flow::Close)
        } else {
            Ok(Flow::Continue)
        }
    }

    /// Read until the blank line terminating the request head, then parse
    /// it. `Ok(None)` means the connection ended cleanly.
    fn read_head(&mut self, max_request_size: usize) -> Result<Option<Head>> {
        let mut tmp = [0u8; READ_CHUNK];
        loop {
            if let Some(end) = memmem::find(&self.buf, b"\r\n\r\n") {
                return self.parse_head(end + 4).map(Some);
            }
            if self.buf.len() > max_request_size {
                return Err(Error::client("Request head exceeds the configured limit"));
            }

            let n = match self.stream.read(&mut tmp) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => match e.kind() {
                    io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof => return Ok(None),
                    _ => return Err(Error::Io(e)),
                },
            };
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
    }

    fn parse_head(&mut self, head_len: usize) -> Result<Head> {
        let mut storage = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut storage);

        let consumed = match parsed
            .parse(&self.buf[..head_len])
            .map_err(|e| Error::client(format!("Malformed request head: {e}")))?
        {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                return Err(Error::client("Truncated request head"));
            }
        };

        let method = Method::from_token(parsed.method.unwrap_or(""));
        let uri = parsed.path.unwrap_or("/").to_string();

        let mut headers = HeaderMap::new();
        for header in parsed.headers.iter() {
            headers.insert(header.name, String::from_utf8_lossy(header.value).into_owned());
        }

        self.buf.advance(consumed);
        Ok(Head {
            method,
            uri,
            headers,
        })
    }

    /// Read a Content-Length delimited body into memory, draining the
    /// already-buffered bytes first.
    fn read_body(&mut self, content_length: usize) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(content_length.min(READ_CHUNK * 8));

        let buffered = self.buf.len().min(content_length);
        body.extend_from_slice(&self.buf[..buffered]);
        self.buf.advance(buffered);

        let mut tmp = [0u8; READ_CHUNK];
        while body.len() < content_length {
            let n = self.stream.read(&mut tmp).map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::server("Connection closed unexpectedly"));
            }
            let need = content_length - body.len();
            let take = n.min(need);
            body.extend_from_slice(&tmp[..take]);
            if n > take {
                self.buf.extend_from_slice(&tmp[take..n]);
            }
        }

        Ok(body)
    }

    /// Stream a Content-Length delimited body to `path`, alternating
    /// between draining buffered bytes and socket reads of `chunk_size`.
    fn stream_body_to_file(
        &mut self,
        content_length: usize,
        chunk_size: usize,
        path: &std::path::Path,
    ) -> Result<()> {
        let result = self.stream_body_inner(content_length, chunk_size, path);
        if result.is_err() {
            let _ = fs::remove_file(path);
        }
        result
    }

    fn stream_body_inner(
        &mut self,
        content_length: usize,
        chunk_size: usize,
        path: &std::path::Path,
    ) -> Result<()> {
        let mut file = fs::File::create(path)
            .map_err(|e| Error::server(format!("Can't open temp file: {e}")))?;

        let mut remaining = content_length;
        let mut chunk = vec![0u8; chunk_size.max(1)];

        while remaining > 0 {
            if !self.buf.is_empty() {
                let take = self.buf.len().min(remaining);
                file.write_all(&self.buf[..take])
                    .map_err(|e| Error::server(format!("Incomplete write to file: {e}")))?;
                self.buf.advance(take);
                remaining -= take;
                cooperative_yield();
                continue;
            }

            let n = self.stream.read(&mut chunk).map_err(Error::Io)?;
            if n == 0 {
                return Err(Error::server("Connection closed unexpectedly"));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }

        Ok(())
    }

    /// Run the middleware chain for `request` and write its response.
    /// Chain errors become the framework error response for their status;
    /// write errors force the connection closed.
    fn handle_request(&mut self, core: &AppCore, request: Request) {
        let keep_alive = request.keep_alive();

        let response = match (core.chain)(&request) {
            Ok(response) => response,
            Err(err) => {
                error!(
                    peer = %self.peer,
                    method = %request.method(),
                    uri = request.uri(),
                    error = %err,
                    "Request chain failed"
                );
                default_error_response(err.status(), core.response_class)
            }
        };

        let written = if response.stream {
            self.write_streaming(response, keep_alive, core.keep_alive_timeout)
        } else {
            self.write_buffered(response, keep_alive, core.keep_alive_timeout)
        };

        if let Err(err) = written {
            error!(peer = %self.peer, error = %err, "Error while writing response");
            self.close = true;
            let fallback = default_error_response(500, core.response_class);
            let _ = self.write_buffered(fallback, false, core.keep_alive_timeout);
        }
    }

    fn connection_lines(&mut self, head: &mut String, keep_alive: bool, timeout: u64) {
        if keep_alive {
            head.push_str("Connection: keep-alive\r\n");
            let _ = write!(head, "Keep-Alive: timeout={timeout}\r\n");
        } else {
            head.push_str("Connection: close\r\n");
            self.close = true;
        }
    }

    /// Serialize a buffered response as one message with `Content-Length`.
    fn write_buffered(
        &mut self,
        response: Response,
        keep_alive: bool,
        timeout: u64,
    ) -> io::Result<()> {
        let mut head = String::with_capacity(256);
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            response.status,
            crate::http::status_reason(response.status)
        );
        for (name, value) in response.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            let _ = write!(head, "{name}: {value}\r\n");
        }
        for cookie in &response.cookies {
            let _ = write!(head, "Set-Cookie: {cookie}\r\n");
        }
        self.connection_lines(&mut head, keep_alive, timeout);
        let _ = write!(head, "Content-Length: {}\r\n\r\n", response.body.len());

        self.stream.write_all(head.as_bytes())?;
        self.stream.write_all(&response.body)?;
        self.stream.flush()?;

        if self.close {
            let _ = self.stream.shutdown(Shutdown::Write);
        }
        Ok(())
    }

    /// Emit the chunked header prelude, drive the streaming callback, then
    /// write the zero-chunk terminator.
    fn write_streaming(
        &mut self,
        mut response: Response,
        keep_alive: bool,
        timeout: u64,
    ) -> io::Result<()> {
        let mut head = String::with_capacity(256);
        let _ = write!(
            head,
            "HTTP/1.1 {} {}\r\n",
            response.status,
            crate::http::status_reason(response.status)
        );
        for (name, value) in response.headers.iter() {
            // chunked framing replaces any length/encoding headers
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            let _ = write!(head, "{name}: {value}\r\n");
        }
        head.push_str("Transfer-Encoding: chunked\r\n");
        for cookie in &response.cookies {
            let _ = write!(head, "Set-Cookie: {cookie}\r\n");
        }
        self.connection_lines(&mut head, keep_alive, timeout);
        head.push_str("\r\n");

        self.stream.write_all(head.as_bytes())?;

        if let Some(callback) = response.callback.take() {
            let mut writer = ChunkWriter::new(&mut self.stream);
            callback(&mut writer)?;
        }

        self.stream.write_all(b"0\r\n\r\n")?;
        self.stream.flush()?;

        if self.close {
            let _ = self.stream.shutdown(Shutdown::Write);
        }
        Ok(())
    }
}

//! The parsed HTTP request handed to middleware and handlers.

use super::{HeaderMap, Method};
use std::path::{Path, PathBuf};

/// Remote endpoint of the client that sent the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInfo {
    remote_addr: String,
    remote_port: u16,
}

impl ClientInfo {
    pub fn new(remote_addr: impl Into<String>, remote_port: u16) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            remote_port,
        }
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }
}

/// An incoming HTTP request.
///
/// Either the body buffer or the spill path is populated, never both: when
/// a multipart payload is streamed to disk the body stays empty and
/// [`Request::spill_path`] points at the temp file under the configured
/// temp directory.
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Vec<u8>,
    spill_path: Option<PathBuf>,
    client: ClientInfo,
}

impl Request {
    pub fn new(method: Method, uri: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers,
            body: Vec::new(),
            spill_path: None,
            client: ClientInfo::default(),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Raw request target exactly as received, query string included.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Request path with any query string stripped. No percent-decoding is
    /// performed.
    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("/")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Temp file the body was streamed to, if it was spilled to disk.
    pub fn spill_path(&self) -> Option<&Path> {
        self.spill_path.as_deref()
    }

    pub fn client(&self) -> &ClientInfo {
        &self.client
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        debug_assert!(self.spill_path.is_none(), "body and spill path are exclusive");
        self.body = body;
    }

    pub fn attach_spill(&mut self, path: PathBuf) {
        debug_assert!(self.body.is_empty(), "body and spill path are exclusive");
        self.spill_path = Some(path);
    }

    pub(crate) fn set_client(&mut self, client: ClientInfo) {
        self.client = client;
    }

    /// Whether the client asked for a persistent connection: true when the
    /// `Connection` header is absent or case-insensitively `keep-alive`.
    pub fn keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            None => true,
            Some(value) => value.eq_ignore_ascii_case("keep-alive"),
        }
    }

    /// Look up a cookie from the `Cookie` header. Pairs are split on `;`,
    /// names and values trimmed around `=`; the first occurrence of a name
    /// wins.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        let header = self.headers.get("cookie")?;
        for pair in header.split(';') {
            let pair = pair.trim_start();
            let Some(eq) = pair.find('=') else {
                continue;
            };
            let (candidate, value) = pair.split_at(eq);
            if candidate.trim_end() == name {
                return Some(value[1..].trim());
            }
        }
        None
    }
}

//! Core HTTP types shared by the request pipeline, router and responses:
//! the method enum, the case-insensitive header map, status reason phrases
//! and the chunked-transfer write helper.

pub mod context;
pub mod cookie;
pub mod mime;
pub mod multipart;
pub mod request;
pub mod response;
pub mod upload;

pub use context::HttpContext;
pub use cookie::Cookie;
pub use request::{ClientInfo, Request};
pub use response::Response;
pub use upload::UploadedFile;

use std::collections::HashMap;
use std::io::{self, Write};

/// HTTP request methods. Anything outside the closed set maps to
/// [`Method::Unknown`] and back to the literal `"UNKNOWN"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Unknown,
}

impl Method {
    /// Parse a method token. Unrecognized tokens become [`Method::Unknown`].
    pub fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            _ => Method::Unknown,
        }
    }

    /// The canonical wire token for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Unknown => "UNKNOWN",
        }
    }
}

impl Default for Method {
    fn default() -> Self {
        Method::Unknown
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Method::from_token(s))
    }
}

/// Reason phrase for a status code. Unlisted codes reuse a generic phrase
/// so the status line is always well-formed.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "OK",
    }
}

/// Header map with ASCII-case-insensitive keys.
///
/// Keys are normalized to lowercase for lookup; the casing of the first
/// insertion is kept as the canonical form used when the map is written to
/// the wire. Re-inserting an existing key overwrites the value (last write
/// wins), so the map never holds duplicates.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: HashMap<String, HeaderEntry>,
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    name: String,
    value: String,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header. Lookup is case-insensitive and the latest value
    /// wins; the first-seen spelling of the name is preserved for output.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        let value = value.into();
        self.entries
            .entry(key)
            .and_modify(|e| e.value = value.clone())
            .or_insert(HeaderEntry { name, value });
    }

    /// Insert only when no value is present yet. Used by the response
    /// constructors so caller-supplied headers override the defaults.
    pub fn insert_if_absent(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        self.entries.entry(key).or_insert(HeaderEntry {
            name,
            value: value.into(),
        });
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(|e| e.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries
            .remove(&name.to_ascii_lowercase())
            .map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(canonical name, value)` pairs in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|e| (e.name.as_str(), e.value.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// Writer handed to streaming response callbacks. Each `send_chunk` call
/// emits one `<hex-size>\r\n<bytes>\r\n` frame; the pipeline writes the
/// `0\r\n\r\n` terminator after the callback returns.
pub struct ChunkWriter<'a> {
    sink: &'a mut dyn Write,
}

impl<'a> ChunkWriter<'a> {
    pub fn new(sink: &'a mut dyn Write) -> Self {
        Self { sink }
    }

    /// Write one chunk frame. Empty input is skipped because a zero-length
    /// chunk would terminate the stream early.
    pub fn send_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write!(self.sink, "{:X}\r\n", data.len())?;
        self.sink.write_all(data)?;
        self.sink.write_all(b"\r\n")
    }
}

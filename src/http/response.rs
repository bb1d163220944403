//! HTTP response construction: buffered bodies, streaming callbacks, the
//! framework's default error bodies, and Set-Cookie attachment.

use crate::config::ResponseClass;
use crate::error::Result;
use crate::http::cookie::Cookie;
use crate::http::mime::mime_type;
use crate::http::{ChunkWriter, HeaderMap};
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Callback driving a chunked streaming response. Invoked once after the
/// header prelude is on the wire; every `send_chunk` call becomes one
/// chunked-transfer frame and the pipeline writes the terminator.
pub type StreamFn = Box<dyn FnOnce(&mut ChunkWriter<'_>) -> io::Result<()> + Send>;

/// Read size for the file-streaming callback.
const FILE_CHUNK_SIZE: usize = 8192;

/// An outgoing HTTP response.
///
/// Constructed through one of the variant constructors ([`plain`],
/// [`json`], [`file`], [`stream`], [`redirect`]) and optionally refined
/// with the builder methods. Middleware receives responses mutably and may
/// adjust status, headers and body before serialization.
///
/// [`plain`]: Response::plain
/// [`json`]: Response::json
/// [`file`]: Response::file
/// [`stream`]: Response::stream
/// [`redirect`]: Response::redirect
pub struct Response {
    /// Body bytes for buffered responses; empty when streaming.
    pub body: Vec<u8>,
    /// Response headers, case-insensitive keys.
    pub headers: HeaderMap,
    /// Fully serialized `Set-Cookie` lines in attachment order.
    pub cookies: Vec<String>,
    /// HTTP status code.
    pub status: u16,
    /// Streaming callback, present iff `stream` is set.
    pub callback: Option<StreamFn>,
    /// Whether this response is written with chunked transfer encoding.
    pub stream: bool,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("body_len", &self.body.len())
            .field("stream", &self.stream)
            .finish()
    }
}

impl Default for Response {
    fn default() -> Self {
        Self {
            body: Vec::new(),
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            status: 200,
            callback: None,
            stream: false,
        }
    }
}

impl Response {
    /// A `text/plain` response with the given body.
    pub fn plain(body: impl Into<String>) -> Self {
        let mut response = Response::default();
        response.body = body.into().into_bytes();
        response.headers.insert_if_absent("Content-Type", "text/plain");
        response
    }

    /// An `application/json` response serializing the given value.
    pub fn json(value: serde_json::Value) -> Self {
        let mut response = Response::default();
        response.body = serde_json::to_vec(&value).unwrap_or_default();
        response
            .headers
            .insert_if_absent("Content-Type", "application/json");
        response
    }

    /// A streaming response sending a file from disk.
    ///
    /// Missing files yield a 404 and non-regular files a 400, both as
    /// plain bodies. Otherwise the response carries the MIME type for the
    /// extension, `Content-Length`, an `ETag` of the form
    /// `"<mtime>-<size>"`, and a callback that reads the file in 8 KiB
    /// chunks. The callback opens the file when invoked and the handle is
    /// closed on every exit path.
    pub fn file(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();

        let metadata = match fs::metadata(path) {
            Ok(m) => m,
            Err(_) => {
                let mut response = Response::plain("File not found");
                response.status = 404;
                return response;
            }
        };
        if !metadata.is_file() {
            let mut response = Response::plain("Bad request");
            response.status = 400;
            return response;
        }

        let mut response = Response::default();
        response.stream = true;

        let file_size = metadata.len();
        response
            .headers
            .insert_if_absent("Content-Type", mime_type(path));
        response
            .headers
            .insert_if_absent("Content-Length", file_size.to_string());

        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        response
            .headers
            .insert("ETag", format!("\"{mtime}-{file_size}\""));

        let path = path.to_path_buf();
        response.callback = Some(Box::new(move |writer: &mut ChunkWriter<'_>| {
            let mut file = fs::File::open(&path)?;
            let mut buffer = [0u8; FILE_CHUNK_SIZE];
            let mut total_sent: u64 = 0;
            while total_sent < file_size {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                writer.send_chunk(&buffer[..read])?;
                total_sent += read as u64;
            }
            Ok(())
        }));

        response
    }

    /// A chunked streaming response driven by a caller-supplied callback.
    /// Defaults to `application/octet-stream`; see
    /// [`stream_with_content_type`](Response::stream_with_content_type).
    pub fn stream<F>(callback: F) -> Self
    where
        F: FnOnce(&mut ChunkWriter<'_>) -> io::Result<()> + Send + 'static,
    {
        Self::stream_with_content_type(callback, "application/octet-stream")
    }

    /// A chunked streaming response with an explicit content type. Always
    /// carries `Cache-Control: no-cache`.
    pub fn stream_with_content_type<F>(callback: F, content_type: impl Into<String>) -> Self
    where
        F: FnOnce(&mut ChunkWriter<'_>) -> io::Result<()> + Send + 'static,
    {
        let mut response = Response::default();
        response.stream = true;
        response.callback = Some(Box::new(callback));
        response.headers.insert_if_absent("Cache-Control", "no-cache");
        response
            .headers
            .insert_if_absent("Content-Type", content_type.into());
        response
    }

    /// A redirect to `location` with status 302.
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::redirect_with_status(location, 302)
    }

    /// A redirect with an explicit status. Anything outside the redirect
    /// set {301, 302, 303, 307, 308} is coerced to 302.
    pub fn redirect_with_status(location: impl Into<String>, status: u16) -> Self {
        let status = match status {
            301 | 302 | 303 | 307 | 308 => status,
            _ => 302,
        };
        let mut response = Response::default();
        response.status = status;
        response.headers.insert("Location", location.into());
        response.headers.insert_if_absent("Content-Type", "text/plain");
        response
    }

    /// Set the status code, returning `self` for chaining.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Set a header, returning `self` for chaining. Overrides any default
    /// the constructor put in place.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Validate and attach a cookie as a `Set-Cookie` line. Fails when the
    /// cookie violates its `__Secure-`/`__Host-` prefix constraints.
    pub fn set_cookie(&mut self, cookie: Cookie) -> Result<()> {
        let line = cookie.serialize()?;
        self.cookies.push(line);
        Ok(())
    }
}

/// The framework-generated response for an error status, shaped by the
/// configured response class. Bodies are canonical strings; internal error
/// details never reach the wire.
pub fn default_error_response(status: u16, class: ResponseClass) -> Response {
    let message = match status {
        400 => "Bad request",
        404 => "Not found",
        _ => "Internal server error",
    };
    let mut response = match class {
        ResponseClass::Plain => Response::plain(message),
        ResponseClass::Json => Response::json(serde_json::json!({ "message": message })),
    };
    response.status = status;
    response
}

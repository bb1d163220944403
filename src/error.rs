//! Error taxonomy for the framework.
//!
//! Every fallible operation returns [`Result`]. Errors are grouped by where
//! they surface on the wire: client protocol violations become 400s, routing
//! misses become 404s, and everything else collapses to a 500 with a
//! canonical body. Internal error messages are logged, never written to the
//! socket.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All error conditions the framework distinguishes.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request, missing required header, oversize payload.
    /// Surfaces as a 400 with the canonical body for the configured
    /// response class.
    #[error("{message}")]
    Client {
        /// Internal description, log-only.
        message: String,
    },

    /// Accept/bind/listen or socket-option failure, temp-file create/write
    /// failure, unexpected EOF. On the startup path this aborts `start()`;
    /// on the request path it surfaces as a 500.
    #[error("server error: {0}")]
    Server(String),

    /// Underlying I/O failure that has not been classified further.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Multipart parse failure or boundary violation. Surfaces as a 500
    /// when caught mid-request; silently dropped parts are not errors.
    #[error("processing error: {0}")]
    Processing(String),

    /// No route matched the request. Surfaces as a 404 "Not found".
    #[error("no route matched the request")]
    RouteNotFound,

    /// Anything propagated from user code, including caught handler
    /// panics. Surfaces as a 500 "Internal server error".
    #[error("handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Shorthand for a client protocol violation.
    pub fn client(message: impl Into<String>) -> Self {
        Error::Client {
            message: message.into(),
        }
    }

    /// Shorthand for a server-side system failure.
    pub fn server(message: impl Into<String>) -> Self {
        Error::Server(message.into())
    }

    /// Shorthand for a processing (multipart/boundary) failure.
    pub fn processing(message: impl Into<String>) -> Self {
        Error::Processing(message.into())
    }

    /// The HTTP status this error surfaces as on the request path.
    pub fn status(&self) -> u16 {
        match self {
            Error::Client { .. } => 400,
            Error::RouteNotFound => 404,
            Error::Server(_) | Error::Io(_) | Error::Processing(_) | Error::Handler(_) => 500,
        }
    }
}

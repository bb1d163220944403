//! # trellis
//!
//! A coroutine-based HTTP/1.1 server framework built on the [`may`]
//! runtime. The core pieces:
//!
//! - **Acceptor and request pipeline**: one coroutine per connection with
//!   keep-alive; requests on a connection are handled strictly in order.
//! - **Streaming request parser**: heads parsed with `httparse`, large
//!   `multipart/form-data` bodies spilled to temp files so memory stays
//!   bounded regardless of upload size.
//! - **Path trie router**: method-aware segment trie with `{name}`
//!   parameters, frozen once the server starts.
//! - **Middleware chain**: composed right-to-left around the router so
//!   the first registered middleware runs outermost.
//! - **Response types**: plain, JSON, file, generic stream and redirect,
//!   with buffered or chunked serialization and a validating Set-Cookie
//!   builder.
//!
//! ## Example
//!
//! ```rust,no_run
//! use trellis::{App, AppConfig, Method, Response};
//!
//! let app = App::new();
//! app.route(Method::Get, "/ping", |_ctx| Response::plain("pong"))
//!     .unwrap();
//! app.route(Method::Get, "/user/{id}", |ctx| {
//!     Response::plain(format!("user {}", ctx.param("id").unwrap_or("?")))
//! })
//! .unwrap();
//!
//! app.start(AppConfig::default()).unwrap();
//! app.wait();
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod middleware;
pub mod router;

mod server;

pub use app::App;
pub use config::{
    AppConfig, HttpConfig, LoggerConfig, OverflowStrategy, ResponseClass, ServerConfig,
    SocketConfig,
};
pub use error::{Error, Result};
pub use http::{
    ChunkWriter, Cookie, HeaderMap, HttpContext, Method, Request, Response, UploadedFile,
};
pub use middleware::{Middleware, Next};
pub use router::{Handler, ParamVec, PathTrie, Route};

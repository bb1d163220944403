//! The top-level server object.
//!
//! ## Lifecycle
//!
//! An [`App`] collects routes and middleware, then [`App::start`] freezes
//! both, binds the listener, sizes the coroutine scheduler and spawns the
//! accept loops. [`App::stop`] is idempotent and [`App::wait`] blocks the
//! calling thread until a stop has been observed. SIGINT, SIGTERM and
//! SIGQUIT are wired to invoke stop exactly once.
//!
//! ## Shared state
//!
//! Everything the hot path touches is read-only after `start`: the
//! configuration values are copied into an [`AppCore`], the trie snapshot
//! and middleware chain are baked into one composed closure, and the only
//! mutable cell left is the atomic running flag (release stores, acquire
//! loads). Registration calls after `start` fail instead of racing the
//! serving side.
//!
//! ## Dispatch
//!
//! The terminal chain stage resolves the route, builds the
//! [`HttpContext`] (which runs multipart parsing), and invokes the
//! handler. Sync handlers run inline on the connection coroutine; async
//! handlers get their own coroutine and reply over a channel. Panics in
//! user code are caught at this boundary and surface as 500s, never as a
//! dead worker.

use crate::config::{AppConfig, ResponseClass, SocketConfig};
use crate::error::{Error, Result};
use crate::http::multipart::MultipartConfig;
use crate::http::response::default_error_response;
use crate::http::{HttpContext, Method, Request, Response};
use crate::middleware::{self, Chain, Middleware};
use crate::router::{Handler, PathTrie, Route};
use crate::server::{self, connection::Connection};
use may::net::TcpListener;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::fs;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, error, info, warn};

/// Read-only state shared by the accept loops and every connection
/// coroutine. Built once during startup.
pub(crate) struct AppCore {
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) chain: Chain,
    pub(crate) response_class: ResponseClass,
    pub(crate) max_request_size: usize,
    pub(crate) max_chunk_size: usize,
    pub(crate) tmp_dir: PathBuf,
    pub(crate) keep_alive_timeout: u64,
    pub(crate) stack_size: usize,
    pub(crate) socket: SocketConfig,
}

struct Inner {
    running: Arc<AtomicBool>,
    trie: Mutex<PathTrie>,
    middlewares: Mutex<Vec<Arc<dyn Middleware>>>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    acceptors: Mutex<Vec<may::coroutine::JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    wait_mutex: Mutex<()>,
    wait_cv: Condvar,
    signals_registered: AtomicBool,
    signals_handle: Mutex<Option<signal_hook::iterator::backend::Handle>>,
}

/// HTTP server framework entry point. Cheap to clone; clones share the
/// same underlying server.
#[derive(Clone)]
pub struct App {
    inner: Arc<Inner>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                running: Arc::new(AtomicBool::new(false)),
                trie: Mutex::new(PathTrie::new()),
                middlewares: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                acceptors: Mutex::new(Vec::new()),
                local_addr: Mutex::new(None),
                wait_mutex: Mutex::new(()),
                wait_cv: Condvar::new(),
                signals_registered: AtomicBool::new(false),
                signals_handle: Mutex::new(None),
            }),
        }
    }

    /// Register a synchronous handler for `(method, pattern)`. The handler
    /// runs inline on the connection coroutine.
    pub fn route<F>(&self, method: Method, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(HttpContext) -> Response + Send + Sync + 'static,
    {
        self.insert_route(method, pattern, Handler::Sync(Arc::new(handler)))
    }

    /// Register an asynchronous handler for `(method, pattern)`. The
    /// handler runs on its own coroutine and may block on coroutine-aware
    /// primitives; the response is relayed back over a channel.
    pub fn route_async<F>(&self, method: Method, pattern: &str, handler: F) -> Result<()>
    where
        F: Fn(HttpContext) -> Response + Send + Sync + 'static,
    {
        self.insert_route(method, pattern, Handler::Async(Arc::new(handler)))
    }

    fn insert_route(&self, method: Method, pattern: &str, handler: Handler) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            return Err(Error::server("Can't add route after server started"));
        }
        self.inner
            .trie
            .lock()
            .unwrap()
            .insert(method, pattern, handler)
    }

    /// Register a middleware stage. The order of registration is the order
    /// of wrapping: the first middleware added runs outermost. Fails once
    /// the server has started.
    pub fn add_middleware(&self, middleware: Arc<dyn Middleware>) -> Result<()> {
        if self.inner.running.load(Ordering::Acquire) {
            return Err(Error::server("Can't add middleware after server started"));
        }
        self.inner.middlewares.lock().unwrap().push(middleware);
        Ok(())
    }

    /// Start serving. Freezes routes and middleware, creates the temp
    /// directory if missing, binds the listener and spawns the accept
    /// coroutines. Returns once the accept loops are running.
    pub fn start(&self, cfg: AppConfig) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::server("Server is already running"));
        }
        match self.start_inner(cfg) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.running.store(false, Ordering::Release);
                self.teardown();
                Err(err)
            }
        }
    }

    fn start_inner(&self, cfg: AppConfig) -> Result<()> {
        let host = cfg.normalized_host();
        let port = cfg.normalized_port();

        if !cfg.server.tmp_dir.exists() {
            fs::create_dir_all(&cfg.server.tmp_dir)
                .map_err(|e| Error::server(format!("Can't create tmp directory: {e}")))?;
            debug!(path = %cfg.server.tmp_dir.display(), "Created tmp directory");
        }

        let plan = server::worker_plan(cfg.server.workers);
        if cfg.server.workers <= 0 {
            debug!(
                workers = plan.workers,
                "Worker count derived from hardware concurrency"
            );
        }

        may::config()
            .set_workers(plan.workers)
            .set_stack_size(cfg.server.stack_size);

        let listener = server::bind_listener(&host, port, cfg.server.max_connections)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::server(format!("Failed to resolve local address: {e}")))?;
        let listener = Arc::new(listener);
        *self.inner.listener.lock().unwrap() = Some(Arc::clone(&listener));
        *self.inner.local_addr.lock().unwrap() = Some(local_addr);

        // freeze routing and middleware into the composed chain
        let trie = Arc::new(self.inner.trie.lock().unwrap().clone());
        let terminal = build_terminal(trie, &cfg);
        let middlewares = self.inner.middlewares.lock().unwrap().clone();
        let chain = middleware::compose(&middlewares, terminal);

        let core = Arc::new(AppCore {
            running: Arc::clone(&self.inner.running),
            chain,
            response_class: cfg.http.response_class,
            max_request_size: cfg.server.max_request_size,
            max_chunk_size: cfg.server.max_chunk_size,
            tmp_dir: cfg.server.tmp_dir.clone(),
            keep_alive_timeout: cfg.http.keep_alive_timeout,
            stack_size: cfg.server.stack_size,
            socket: cfg.socket.clone(),
        });

        info!(
            host = %host,
            port = local_addr.port(),
            workers = plan.workers,
            acceptors = plan.acceptors,
            regular_workers = plan.regular,
            "Starting server"
        );

        let mut handles = self.inner.acceptors.lock().unwrap();
        for _ in 0..plan.acceptors {
            let core = Arc::clone(&core);
            let listener = Arc::clone(&listener);
            let handle = unsafe {
                may::coroutine::Builder::new()
                    .stack_size(cfg.server.stack_size)
                    .spawn(move || accept_loop(core, listener))
            }
            .map_err(|e| Error::server(format!("Failed to spawn acceptor: {e}")))?;
            handles.push(handle);
        }
        drop(handles);

        self.register_signals();
        Ok(())
    }

    /// Stop serving. Safe to call from any thread and idempotent; only the
    /// first call does the teardown.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.teardown();
        info!("Server stopped");
    }

    fn teardown(&self) {
        let handles: Vec<_> = {
            let mut guard = self.inner.acceptors.lock().unwrap();
            guard.drain(..).collect()
        };
        for handle in handles {
            unsafe {
                handle.coroutine().cancel();
            }
            let _ = handle.join();
        }

        // last reference to the listener closes the socket
        *self.inner.listener.lock().unwrap() = None;
        *self.inner.local_addr.lock().unwrap() = None;

        if let Some(handle) = self.inner.signals_handle.lock().unwrap().take() {
            handle.close();
        }

        drop(self.inner.wait_mutex.lock().unwrap());
        self.inner.wait_cv.notify_all();
    }

    /// Block the calling thread until the server has stopped.
    pub fn wait(&self) {
        let mut guard = self.inner.wait_mutex.lock().unwrap();
        while self.inner.running.load(Ordering::Acquire) {
            guard = self.inner.wait_cv.wait(guard).unwrap();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    /// Print all registered routes to stdout. Useful when checking that a
    /// service wired its handlers the way it meant to.
    pub fn dump_routes(&self) {
        let mut routes = self.inner.trie.lock().unwrap().routes();
        routes.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        println!("[routes] count={}", routes.len());
        for route in routes {
            let kind = if route.is_async() { "async" } else { "sync" };
            println!("[route] {} {} ({kind})", route.method, route.pattern);
        }
    }

    fn register_signals(&self) {
        if self.inner.signals_registered.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut signals = match Signals::new([SIGINT, SIGTERM, SIGQUIT]) {
            Ok(signals) => signals,
            Err(err) => {
                warn!(error = %err, "Failed to register signal handlers");
                return;
            }
        };
        *self.inner.signals_handle.lock().unwrap() = Some(signals.handle());

        let app = self.clone();
        let spawned = std::thread::Builder::new()
            .name("trellis-signals".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!(signal, "Termination signal received");
                    app.stop();
                }
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn signal thread");
        }
    }
}

/// The terminal chain stage: trie lookup, context construction (including
/// multipart parsing) and handler dispatch.
fn build_terminal(trie: Arc<PathTrie>, cfg: &AppConfig) -> Chain {
    let response_class = cfg.http.response_class;
    let multipart_cfg = MultipartConfig::from(&cfg.server);
    let stack_size = cfg.server.stack_size;

    Arc::new(move |request: &Request| {
        let Some((route, params)) = trie.find(request.method(), request.path()) else {
            return Ok(default_error_response(404, response_class));
        };
        let ctx = HttpContext::create(request.clone(), params, &multipart_cfg)?;
        dispatch(&route, ctx, stack_size)
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Invoke a route's handler. Sync handlers run inline; async handlers are
/// spawned onto their own coroutine with the response relayed over a
/// channel. Panics are caught either way and surface as handler errors.
fn dispatch(route: &Route, ctx: HttpContext, stack_size: usize) -> Result<Response> {
    match &route.handler {
        Handler::Sync(handler) => {
            let handler = Arc::clone(handler);
            catch_unwind(AssertUnwindSafe(move || handler(ctx))).map_err(|panic| {
                error!(
                    pattern = %route.pattern,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked"
                );
                Error::Handler(panic_message(panic.as_ref()))
            })
        }
        Handler::Async(handler) => {
            let handler = Arc::clone(handler);
            let pattern = route.pattern.clone();
            let (tx, rx) = may::sync::mpsc::channel();

            let spawned = unsafe {
                may::coroutine::Builder::new()
                    .stack_size(stack_size)
                    .spawn(move || {
                        let outcome = catch_unwind(AssertUnwindSafe(|| handler(ctx)))
                            .map_err(|panic| {
                                error!(
                                    pattern = %pattern,
                                    panic = %panic_message(panic.as_ref()),
                                    "Handler panicked"
                                );
                                Error::Handler(panic_message(panic.as_ref()))
                            });
                        let _ = tx.send(outcome);
                    })
            };
            spawned.map_err(|e| Error::server(format!("Failed to spawn handler coroutine: {e}")))?;

            match rx.recv() {
                Ok(result) => result,
                Err(_) => Err(Error::Handler("handler reply channel closed".to_string())),
            }
        }
    }
}

/// Accept loop body, one per acceptor coroutine. Errors are logged and the
/// loop continues unless the server is shutting down.
fn accept_loop(core: Arc<AppCore>, listener: Arc<TcpListener>) {
    if !core.running.load(Ordering::Acquire) {
        return;
    }

    while core.running.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = server::apply_connection_options(&stream, &core.socket) {
                    error!(peer = %peer, error = %err, "Failed to set socket option");
                    continue;
                }

                let stack_size = core.stack_size;
                let core = Arc::clone(&core);
                let spawned = unsafe {
                    may::coroutine::Builder::new()
                        .stack_size(stack_size)
                        .spawn(move || {
                            Connection::new(stream, peer).run(&core);
                        })
                };
                if let Err(err) = spawned {
                    error!(error = %err, "Failed to spawn connection coroutine");
                }
            }
            Err(err) => {
                if !core.running.load(Ordering::Relaxed) {
                    return;
                }
                error!(error = %err, "Error in acceptor");
            }
        }
    }
}

//! Middleware chain composed around the terminal router handler.
//!
//! A middleware sees every request before the router and every response on
//! the way back out. It may short-circuit by not calling [`Next::run`],
//! and it may rewrite the response it gets back. The registration order is
//! frozen when the server starts; composition is right-to-left so the
//! first registered middleware runs outermost.

use crate::error::Result;
use crate::http::{Request, Response};
use std::sync::Arc;

/// The composed remainder of the chain, ending in the router.
pub(crate) type Chain = Arc<dyn Fn(&Request) -> Result<Response> + Send + Sync>;

/// Continuation handed to [`Middleware::handle`].
pub struct Next<'a> {
    chain: &'a Chain,
}

impl Next<'_> {
    /// Invoke the rest of the chain for `request`.
    pub fn run(&self, request: &Request) -> Result<Response> {
        (self.chain)(request)
    }
}

/// A single middleware stage.
///
/// ```rust,ignore
/// struct RequestLog;
///
/// impl Middleware for RequestLog {
///     fn handle(&self, req: &Request, next: Next<'_>) -> Result<Response> {
///         tracing::info!(method = %req.method(), uri = req.uri(), "request");
///         let mut response = next.run(req)?;
///         response.headers.insert("X-Served-By", "trellis");
///         Ok(response)
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    /// Process `request`, normally delegating to `next` and optionally
    /// adjusting the response it returns.
    fn handle(&self, request: &Request, next: Next<'_>) -> Result<Response>;
}

/// Fold the middleware list around the terminal handler, right to left.
pub(crate) fn compose(middlewares: &[Arc<dyn Middleware>], terminal: Chain) -> Chain {
    let mut chain = terminal;
    for middleware in middlewares.iter().rev() {
        let middleware = Arc::clone(middleware);
        let next = chain;
        chain = Arc::new(move |request: &Request| {
            middleware.handle(request, Next { chain: &next })
        });
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HeaderMap, Method};
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Recorder {
        fn handle(&self, request: &Request, next: Next<'_>) -> Result<Response> {
            self.log.lock().unwrap().push(format!("{}:before", self.label));
            let response = next.run(request)?;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            Ok(response)
        }
    }

    struct ShortCircuit;

    impl Middleware for ShortCircuit {
        fn handle(&self, _request: &Request, _next: Next<'_>) -> Result<Response> {
            Ok(Response::plain("blocked").with_status(403))
        }
    }

    fn terminal() -> Chain {
        Arc::new(|_req: &Request| Ok(Response::plain("terminal")))
    }

    fn request() -> Request {
        Request::new(Method::Get, "/", HeaderMap::new())
    }

    #[test]
    fn test_first_registered_runs_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder {
                label: "outer",
                log: Arc::clone(&log),
            }),
            Arc::new(Recorder {
                label: "inner",
                log: Arc::clone(&log),
            }),
        ];
        let chain = compose(&middlewares, terminal());
        let response = chain(&request()).unwrap();
        assert_eq!(response.body, b"terminal");
        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[test]
    fn test_short_circuit_skips_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ShortCircuit),
            Arc::new(Recorder {
                label: "never",
                log: Arc::clone(&log),
            }),
        ];
        let chain = compose(&middlewares, terminal());
        let response = chain(&request()).unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.body, b"blocked");
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_response_rewriting() {
        struct Stamp;
        impl Middleware for Stamp {
            fn handle(&self, request: &Request, next: Next<'_>) -> Result<Response> {
                let mut response = next.run(request)?;
                response.headers.insert("X-Stamp", "v1");
                Ok(response)
            }
        }
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(Stamp)];
        let chain = compose(&middlewares, terminal());
        let response = chain(&request()).unwrap();
        assert_eq!(response.headers.get("x-stamp"), Some("v1"));
    }

    #[test]
    fn test_empty_chain_is_terminal() {
        let chain = compose(&[], terminal());
        assert_eq!(chain(&request()).unwrap().body, b"terminal");
    }
}

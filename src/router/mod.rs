//! Method-aware path-segment trie router.
//!
//! Patterns are plain segment lists where `{name}` marks a dynamic segment
//! matching any single non-empty segment and binding it under `name`.
//! Lookup prefers literal children and falls back to the dynamic child of
//! each node. The trie is built during registration and frozen once the
//! server starts; the hot path only reads.

use crate::error::{Error, Result};
use crate::http::{HttpContext, Method, Response};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Most route patterns bind only a few parameters, so the bindings live
/// inline on the stack up to this count.
pub const MAX_INLINE_PARAMS: usize = 8;

/// Parameters bound during a trie lookup, in path order.
pub type ParamVec = SmallVec<[(String, String); MAX_INLINE_PARAMS]>;

/// Handler function shared by both dispatch variants.
pub type HandlerFn = Arc<dyn Fn(HttpContext) -> Response + Send + Sync>;

/// How a route's handler is dispatched.
///
/// `Sync` handlers run inline on the connection coroutine. `Async`
/// handlers are spawned onto their own coroutine and the response is
/// received over a channel, so they may block on channels, timers or
/// other coroutine-aware primitives without holding up serialization
/// state. The variant is fixed at registration; dispatch inspects the tag
/// once.
#[derive(Clone)]
pub enum Handler {
    Sync(HandlerFn),
    Async(HandlerFn),
}

impl Handler {
    pub fn handler_fn(&self) -> &HandlerFn {
        match self {
            Handler::Sync(f) | Handler::Async(f) => f,
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Handler::Async(_))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Sync(_) => f.write_str("Handler::Sync"),
            Handler::Async(_) => f.write_str("Handler::Async"),
        }
    }
}

/// One registered route: a method, the pattern it was registered under,
/// and its handler.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    pub pattern: String,
    pub handler: Handler,
}

impl Route {
    pub fn new(method: Method, pattern: impl Into<String>, handler: Handler) -> Self {
        Self {
            method,
            pattern: pattern.into(),
            handler,
        }
    }

    pub fn is_async(&self) -> bool {
        self.handler.is_async()
    }
}

#[derive(Debug, Default, Clone)]
struct TrieNode {
    /// Terminal routes of this node, keyed by method.
    values: HashMap<Method, Arc<Route>>,
    /// Literal children by segment.
    children: HashMap<String, TrieNode>,
    /// Parameter name bound by the dynamic child edge.
    param_name: String,
    /// Dynamic child matching any single segment.
    dynamic_child: Option<Box<TrieNode>>,
}

/// The route table. Built at registration time, immutable while serving.
#[derive(Debug, Default, Clone)]
pub struct PathTrie {
    root: TrieNode,
}

/// Collapse a trailing slash, except for the root itself.
fn normalize_path(path: &str) -> &str {
    if path.is_empty() {
        return "/";
    }
    if path.len() > 1 && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

/// Split a normalized path into segments. The root is zero segments.
fn split_path(path: &str) -> Vec<&str> {
    if path == "/" {
        return Vec::new();
    }
    path.strip_prefix('/').unwrap_or(path).split('/').collect()
}

fn is_dynamic_segment(segment: &str) -> bool {
    segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}')
}

fn is_broken_segment(segment: &str) -> bool {
    (segment.starts_with('{') && !segment.ends_with('}'))
        || (!segment.starts_with('{') && segment.ends_with('}'))
}

fn extract_param_name(segment: &str) -> &str {
    if segment.len() > 2 {
        &segment[1..segment.len() - 1]
    } else {
        ""
    }
}

impl PathTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. Fails on empty or malformed segments, on dynamic
    /// segments without a name, and when the (method, pattern) pair is
    /// already taken. Conflicting parameter names at a shared dynamic
    /// position are not rejected; the most recent insertion's name wins.
    pub fn insert(&mut self, method: Method, pattern: &str, handler: Handler) -> Result<()> {
        let normalized = normalize_path(pattern);
        let segments = split_path(normalized);

        let mut node = &mut self.root;

        for segment in segments {
            if segment.is_empty() {
                return Err(Error::server(format!(
                    "Empty segment in path: {normalized}"
                )));
            }
            if is_broken_segment(segment) {
                return Err(Error::server(format!(
                    "Malformed dynamic segment: {segment}"
                )));
            }

            if is_dynamic_segment(segment) {
                let param_name = extract_param_name(segment);
                if param_name.is_empty() {
                    return Err(Error::server(format!(
                        "Dynamic segment without name: {normalized}"
                    )));
                }
                if node.dynamic_child.is_none() {
                    node.dynamic_child = Some(Box::default());
                }
                node.param_name = param_name.to_string();
                node = node
                    .dynamic_child
                    .as_deref_mut()
                    .ok_or_else(|| Error::server("dynamic child missing after creation"))?;
            } else {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }

        if node.values.contains_key(&method) {
            return Err(Error::server(format!(
                "Route already exists for method: {normalized}"
            )));
        }

        node.values
            .insert(method, Arc::new(Route::new(method, normalized, handler)));
        Ok(())
    }

    /// Resolve a request path. Literal children are preferred at every
    /// step; otherwise the dynamic child matches and its parameter name is
    /// bound to the segment. Empty segments make the lookup fail.
    pub fn find(&self, method: Method, path: &str) -> Option<(Arc<Route>, ParamVec)> {
        let normalized = normalize_path(path);
        let segments = split_path(normalized);

        let mut node = &self.root;
        let mut params = ParamVec::new();

        for segment in segments {
            if segment.is_empty() {
                return None;
            }
            if let Some(child) = node.children.get(segment) {
                node = child;
            } else if let Some(dynamic) = node.dynamic_child.as_deref() {
                params.push((node.param_name.clone(), segment.to_string()));
                node = dynamic;
            } else {
                return None;
            }
        }

        node.values
            .get(&method)
            .map(|route| (Arc::clone(route), params))
    }

    /// All registered routes, in no particular order.
    pub fn routes(&self) -> Vec<Arc<Route>> {
        let mut out = Vec::new();
        collect_routes(&self.root, &mut out);
        out
    }
}

fn collect_routes(node: &TrieNode, out: &mut Vec<Arc<Route>>) {
    out.extend(node.values.values().cloned());
    for child in node.children.values() {
        collect_routes(child, out);
    }
    if let Some(dynamic) = &node.dynamic_child {
        collect_routes(dynamic, out);
    }
}

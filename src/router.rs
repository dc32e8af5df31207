//! Ordered route table.
//!
//! Routes are scanned linearly in registration order and the first one whose
//! method and path qualify wins. Order is the whole tie-break policy: an
//! `Exact` route registered before an overlapping `Prefix` route shadows it
//! for the exact path, and vice versa.
//!
//! The table itself is a plain value. Once a [`Server`](crate::Server) is
//! running it shares the table read-only with the listener thread, and every
//! mutation is refused with [`Error::ServerBusy`](crate::Error::ServerBusy).

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::handler::{self, BoxedHandler, HandlerResult};
use crate::method::Method;
use crate::request::Request;
use crate::response::Response;

/// How a route's path is compared with the request path.
/// Both modes ignore ASCII case.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// The request path equals the route path.
    #[default]
    Exact,
    /// The request path starts with the route path.
    Prefix,
}

/// Identity of a registered route, used to unregister it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct RouteHandle(u64);

/// A registered (method, path, match mode, handler) entry. Immutable.
pub struct Route {
    handle: RouteHandle,
    method: Method,
    path: String,
    mode: MatchMode,
    handler: BoxedHandler,
}

impl Route {
    pub fn handle(&self) -> RouteHandle { self.handle }
    pub fn method(&self) -> Method { self.method }
    pub fn path(&self) -> &str { &self.path }
    pub fn mode(&self) -> MatchMode { self.mode }

    pub(crate) fn handler(&self) -> &BoxedHandler { &self.handler }

    /// Whether this route accepts `method` (exact string) and `path`.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        self.method.as_str() == method && self.matches_path(path)
    }

    fn matches_path(&self, path: &str) -> bool {
        match self.mode {
            MatchMode::Exact => path.eq_ignore_ascii_case(&self.path),
            MatchMode::Prefix => path
                .as_bytes()
                .get(..self.path.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(self.path.as_bytes())),
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("handle", &self.handle)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// The application's routes, in registration order.
#[derive(Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
    next_handle: u64,
}

impl RouteTable {
    pub fn new() -> Self { Self::default() }

    /// Appends a route. The path is normalised with [`normalize_path`].
    ///
    /// ```rust
    /// use tickserve::{MatchMode, Method, RouteTable};
    ///
    /// let mut routes = RouteTable::new();
    /// let hello = routes.register(Method::Get, "/hello", MatchMode::Exact, |_, res| {
    ///     res.write_text("hello")
    /// });
    /// assert!(routes.find("GET", "/HELLO").is_some());
    /// assert!(routes.unregister(hello));
    /// ```
    pub fn register<F, R>(&mut self, method: Method, path: &str, mode: MatchMode, handler: F) -> RouteHandle
    where
        F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
        R: HandlerResult + 'static,
    {
        self.insert(method, path, mode, handler::boxed(handler))
    }

    pub(crate) fn insert(&mut self, method: Method, path: &str, mode: MatchMode, handler: BoxedHandler) -> RouteHandle {
        let handle = RouteHandle(self.next_handle);
        self.next_handle += 1;
        self.routes.push(Arc::new(Route {
            handle,
            method,
            path: normalize_path(path),
            mode,
            handler,
        }));
        handle
    }

    /// Removes the route with this handle. Returns `false` if there was none.
    pub fn unregister(&mut self, handle: RouteHandle) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.handle != handle);
        self.routes.len() != before
    }

    /// First route, in registration order, accepting `method` and `path`.
    pub fn find(&self, method: &str, path: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| r.matches(method, path))
    }

    pub fn get(&self, handle: RouteHandle) -> Option<&Arc<Route>> {
        self.routes.iter().find(|r| r.handle == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize { self.routes.len() }
    pub fn is_empty(&self) -> bool { self.routes.is_empty() }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.routes.iter()).finish()
    }
}

/// Cleans up a route path: empty becomes `/`, a leading `/` is added when
/// missing, and spaces become `-`.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace(' ', "-");
    if path.starts_with('/') { path } else { format!("/{path}") }
}

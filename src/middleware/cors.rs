//! Cross-origin resource sharing.
//!
//! [`register`] stores a route whose handler first writes the four
//! `Access-Control-Allow-*` headers, then registers a sibling OPTIONS route at
//! the same path and match mode that answers preflight requests with those
//! headers and an empty body. The real handler never sees a preflight.
//!
//! Header values are joined once, at registration.
//!
//! ```rust
//! use tickserve::{MatchMode, Method, RouteTable};
//! use tickserve::middleware::cors::{self, CorsOptions};
//!
//! let mut routes = RouteTable::new();
//! let options = CorsOptions::default()
//!     .with_origins(["https://app.example"])
//!     .with_methods([tickserve::Method::Get, tickserve::Method::Post]);
//! let pair = cors::register(&mut routes, Method::Post, "/scores", MatchMode::Exact,
//!     |req, res| res.write_text(req.text().unwrap_or_default()),
//!     &options,
//! ).unwrap();
//! assert!(pair.preflight.is_some());
//! assert!(routes.find("OPTIONS", "/scores").is_some());
//! ```

use std::fmt;
use std::sync::Arc;

use http::header::{self, HeaderValue};
use serde::Deserialize;

use crate::error::{Error, HandlerError};
use crate::handler::{self, BoxedHandler, ErasedHandler, HandlerResult};
use crate::method::Method;
use crate::request::Request;
use crate::response::Response;
use crate::router::{MatchMode, RouteHandle, RouteTable};

/// What cross-origin requests a route allows.
#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorsOptions {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<Method>,
    pub allow_credentials: bool,
    pub allowed_headers: Vec<String>,
    #[serde(skip)]
    on_preflight: Option<BoxedHandler>,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: vec![Method::Post, Method::Get, Method::Options],
            allow_credentials: true,
            allowed_headers: [
                "Content-Type",
                "Content-Encoding",
                "Authorization",
                "X-Authentication",
                "X-Authorization",
                "X-Request-Id",
                "traceparent",
                "tracestate",
            ]
            .map(str::to_owned)
            .to_vec(),
            on_preflight: None,
        }
    }
}

impl CorsOptions {
    pub fn with_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.allowed_methods = methods.into_iter().collect();
        self
    }

    pub fn with_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    pub fn with_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_headers = headers.into_iter().map(Into::into).collect();
        self
    }

    /// Runs `hook` on every preflight, after the CORS headers are written.
    /// If the hook leaves the response open it is closed afterwards.
    pub fn on_preflight<F, R>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
        R: HandlerResult + 'static,
    {
        self.on_preflight = Some(handler::boxed(hook));
        self
    }
}

impl fmt::Debug for CorsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorsOptions")
            .field("allowed_origins", &self.allowed_origins)
            .field("allowed_methods", &self.allowed_methods)
            .field("allow_credentials", &self.allow_credentials)
            .field("allowed_headers", &self.allowed_headers)
            .field("on_preflight", &self.on_preflight.is_some())
            .finish()
    }
}

// ── Precomputed headers ───────────────────────────────────────────────────────

/// The four `Access-Control-Allow-*` values, joined and validated up front.
#[derive(Clone, Debug)]
pub struct CorsHeaders {
    origin: HeaderValue,
    methods: HeaderValue,
    credentials: HeaderValue,
    headers: HeaderValue,
}

impl CorsHeaders {
    pub fn new(options: &CorsOptions) -> Result<Self, Error> {
        let methods: Vec<&str> = options.allowed_methods.iter().map(|m| m.as_str()).collect();
        Ok(Self {
            origin: joined("access-control-allow-origin", options.allowed_origins.as_slice())?,
            methods: joined("access-control-allow-methods", methods.as_slice())?,
            credentials: HeaderValue::from_static(if options.allow_credentials { "true" } else { "false" }),
            headers: joined("access-control-allow-headers", options.allowed_headers.as_slice())?,
        })
    }

    pub fn apply(&self, res: &mut Response) -> Result<(), Error> {
        res.insert_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, self.origin.clone())?;
        res.insert_header(header::ACCESS_CONTROL_ALLOW_METHODS, self.methods.clone())?;
        res.insert_header(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, self.credentials.clone())?;
        res.insert_header(header::ACCESS_CONTROL_ALLOW_HEADERS, self.headers.clone())
    }
}

/// Comma-joins `values`, dropping repeats but keeping first-seen order.
fn joined<S: AsRef<str>>(name: &str, values: &[S]) -> Result<HeaderValue, Error> {
    let mut seen: Vec<&str> = Vec::with_capacity(values.len());
    for v in values {
        if !seen.contains(&v.as_ref()) {
            seen.push(v.as_ref());
        }
    }
    let value = seen.join(",");
    HeaderValue::from_str(&value).map_err(|_| Error::InvalidHeader(format!("{name}: {value}")))
}

// ── Wrapped handlers ──────────────────────────────────────────────────────────

struct CorsHandler {
    headers: Arc<CorsHeaders>,
    inner: BoxedHandler,
}

impl ErasedHandler for CorsHandler {
    fn call(&self, req: &Request, res: &mut Response) -> Result<(), HandlerError> {
        self.headers.apply(res)?;
        self.inner.call(req, res)
    }
}

struct PreflightHandler {
    headers: Arc<CorsHeaders>,
    hook: Option<BoxedHandler>,
}

impl ErasedHandler for PreflightHandler {
    fn call(&self, req: &Request, res: &mut Response) -> Result<(), HandlerError> {
        self.headers.apply(res)?;
        if let Some(hook) = &self.hook {
            hook.call(req, res)?;
        }
        if !res.is_closed() {
            res.close()?;
        }
        Ok(())
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

/// Handles of a CORS-wrapped route and its preflight sibling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CorsRoute {
    pub route: RouteHandle,
    /// `None` when the wrapped route is itself an OPTIONS route.
    pub preflight: Option<RouteHandle>,
}

/// Registers `handler` wrapped with CORS headers, plus an OPTIONS preflight
/// route at the same path unless `method` is already OPTIONS.
///
/// Invalid header values are reported before anything is registered.
pub fn register<F, R>(
    routes: &mut RouteTable,
    method: Method,
    path: &str,
    mode: MatchMode,
    handler: F,
    options: &CorsOptions,
) -> Result<CorsRoute, Error>
where
    F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
    R: HandlerResult + 'static,
{
    let headers = Arc::new(CorsHeaders::new(options)?);

    let route = routes.insert(method, path, mode, Arc::new(CorsHandler {
        headers: Arc::clone(&headers),
        inner: handler::boxed(handler),
    }));

    let preflight = (method != Method::Options).then(|| {
        routes.insert(Method::Options, path, mode, Arc::new(PreflightHandler {
            headers,
            hook: options.on_preflight.clone(),
        }))
    });

    Ok(CorsRoute { route, preflight })
}

/// Removes both routes of a [`register`] call. Returns `false` if the main
/// route was already gone.
pub fn unregister(routes: &mut RouteTable, cors: CorsRoute) -> bool {
    if let Some(preflight) = cors.preflight {
        routes.unregister(preflight);
    }
    routes.unregister(cors.route)
}

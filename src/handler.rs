//! Route handler capability and type erasure.
//!
//! # How handlers are stored
//!
//! The route table holds handlers of *different* closure types in one `Vec`,
//! so each is hidden behind the [`ErasedHandler`] trait object:
//!
//! ```text
//! |req, res| res.write_text("hi")          ← user writes this
//!        ↓ routes.register(Method::Get, "/", MatchMode::Exact, …)
//! Arc::new(FnHandler(closure))             ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(&req, &mut res)             ← on the host thread, at drain time
//! ```
//!
//! A handler is a single capability. Fan-out to several listeners, if wanted,
//! belongs in the closure itself.

use std::sync::Arc;

use crate::error::HandlerError;
use crate::request::Request;
use crate::response::Response;

/// Internal dispatch interface. Implemented by plain closures and by the
/// CORS wrappers.
pub(crate) trait ErasedHandler {
    fn call(&self, req: &Request, res: &mut Response) -> Result<(), HandlerError>;
}

/// A type-erased handler, shared between the route table and queued units.
pub(crate) type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Handler return values ─────────────────────────────────────────────────────

/// Conversion of a handler's return value into its outcome.
///
/// Handlers may return `()` or any `Result<(), E>` whose error converts into
/// a boxed error, so `?` works on [`Response`] writes inside a handler.
pub trait HandlerResult {
    fn into_outcome(self) -> Result<(), HandlerError>;
}

impl HandlerResult for () {
    fn into_outcome(self) -> Result<(), HandlerError> { Ok(()) }
}

impl<E> HandlerResult for Result<(), E>
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn into_outcome(self) -> Result<(), HandlerError> {
        self.map_err(|e| HandlerError::Failed(e.into()))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype wrapper bridging a concrete closure to [`ErasedHandler`].
struct FnHandler<F>(F);

impl<F, R> ErasedHandler for FnHandler<F>
where
    F: Fn(&Request, &mut Response) -> R,
    R: HandlerResult,
{
    fn call(&self, req: &Request, res: &mut Response) -> Result<(), HandlerError> {
        (self.0)(req, res).into_outcome()
    }
}

pub(crate) fn boxed<F, R>(handler: F) -> BoxedHandler
where
    F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
    R: HandlerResult + 'static,
{
    Arc::new(FnHandler(handler))
}

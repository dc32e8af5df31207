//! Middleware layer.
//!
//! Middleware wraps a route's handler before it is stored in the route table.
//! Wrapping happens once, at registration; nothing is recomputed per request.
//!
//! Built-in middleware:
//! - [`cors`] — cross-origin headers plus an automatic OPTIONS preflight route

pub mod cors;

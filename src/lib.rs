//! # tickserve
//!
//! An HTTP endpoint for applications that live on one thread and move in
//! ticks: game loops, simulations, UI hosts, anything whose own APIs must not
//! be touched from another thread.
//!
//! ## The contract
//!
//! Network accept blocks; the host must not. So tickserve splits the work:
//!
//! - **Listener thread** — one per running [`Server`]. Accepts connections,
//!   matches them against the [`RouteTable`], answers `404` itself when nothing
//!   matches, and queues everything else.
//! - **Host thread** — yours. Call [`Server::drain`] once per tick for each
//!   [`Phase`] you have; queued handlers run right there, in arrival order,
//!   each isolated from the others' failures and panics.
//!
//! What tickserve deliberately leaves out:
//!
//! - **TLS and HTTP/2** — put a proxy in front if you need them
//! - **Backpressure** — the queue is unbounded; a host that stops draining
//!   accumulates requests
//! - **Graceful drain** — [`Server::stop`] abandons in-flight requests
//! - **Handler timeouts** — a slow handler is slow on the host thread
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use tickserve::middleware::cors::CorsOptions;
//! use tickserve::{MatchMode, Method, Phase, Server, ServerConfig};
//!
//! fn main() -> Result<(), tickserve::Error> {
//!     let mut server = Server::new(ServerConfig::default().with_port(3000));
//!
//!     server.register(Method::Get, "/status", MatchMode::Exact, |_, res| {
//!         res.write_json(r#"{"ok":true}"#)
//!     })?;
//!     server.register_cors(Method::Post, "/scores", MatchMode::Exact, |req, res| {
//!         match req.text() {
//!             Ok(body) if !body.is_empty() => res.write_text("stored"),
//!             _ => res.bad_request(Some("empty body")),
//!         }
//!     }, &CorsOptions::default())?;
//!
//!     server.start()?;
//!     loop {
//!         // ... advance the host one tick ...
//!         server.drain(Phase::First);
//!     }
//! }
//! ```
//!
//! Code on any other thread that needs the host thread can use the
//! [`CrossThreadInvoker`] from [`Server::invoker`].

mod config;
mod error;
mod handler;
mod invoker;
mod listener;
mod method;
mod request;
mod response;
mod router;
mod scheduler;
mod server;

pub mod middleware;

pub use config::{LogOptions, ServerConfig};
pub use error::{Error, HandlerError};
pub use handler::HandlerResult;
pub use invoker::{Completion, CrossThreadInvoker};
pub use method::{Method, UnknownMethod};
pub use request::Request;
pub use response::{ContentType, Response};
pub use router::{normalize_path, MatchMode, Route, RouteHandle, RouteTable};
pub use scheduler::{DispatchUnit, MainThreadScheduler, Phase};
pub use server::{DispatchPolicy, Server, ServerState};

//! Unified error types.

use std::any::Any;
use std::io;

/// The error type returned by tickserve's fallible operations.
///
/// A request that matches no route is not an error: the listener answers it
/// with `404 Not Found` on the accept thread and nothing else happens.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listening socket could not be bound. Fatal for this server
    /// instance only; the listener thread has already exited.
    #[error("failed to bind {addr}: {source}")]
    Startup {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The route table was mutated while the server is running.
    /// The table is left untouched.
    #[error("server is busy: routes cannot change while it is running")]
    ServerBusy,

    /// The listener did not shut down cleanly and was forced closed.
    #[error("listener failed to close cleanly: {0}")]
    Shutdown(String),

    /// A write, header or status change was attempted on a closed response.
    #[error("response is already closed")]
    ResponseClosed,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The scheduler was dropped before queued work could run.
    #[error("scheduler dropped the work before running it")]
    SchedulerClosed,

    /// The handler finished without producing a response; the connection
    /// is dropped.
    #[error("handler finished without a response")]
    NoResponse,

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a single handler invocation.
///
/// Caught at the dispatch boundary, logged, and confined to the one
/// dispatch unit that produced it.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(Box<dyn std::error::Error + Send + Sync>),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Converts a payload captured by `catch_unwind` into a readable error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Self::Panicked(message)
    }
}

impl From<Error> for HandlerError {
    fn from(e: Error) -> Self {
        match e {
            Error::Handler(inner) => inner,
            other => Self::Failed(Box::new(other)),
        }
    }
}

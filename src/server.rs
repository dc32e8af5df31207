//! Embedded HTTP server and its lifecycle.
//!
//! # Threads
//!
//! A [`Server`] lives on the host thread. [`Server::start`] spawns exactly one
//! background thread that binds the socket and runs the accept loop; handlers
//! only ever run on the host thread, inside [`Server::drain`].
//!
//! ```text
//! listener thread:  accept → RouteTable::find ─┬─ no match → 404, close
//!                                              └─ match → scheduler queue
//! host thread:      tick → drain(phase) → handler(&Request, &mut Response)
//! ```
//!
//! # Lifecycle
//!
//! `Stopped → Starting → Listening → Stopping → Stopped`. While the server is
//! anywhere but `Stopped`, the route table is frozen: every mutation fails
//! with [`Error::ServerBusy`] and leaves the table as it was.
//!
//! # Shutdown is best effort
//!
//! [`Server::stop`] interrupts the blocked `accept`, closes the socket and
//! joins the thread. Connections already accepted but not yet answered are
//! abandoned; their clients see the connection close without a response.
//! Units already queued still run at the next drain, writing into the void.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::{fmt, io};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::config::ServerConfig;
use crate::error::{Error, HandlerError};
use crate::handler::HandlerResult;
use crate::invoker::CrossThreadInvoker;
use crate::listener::ListenerLoop;
use crate::method::Method;
use crate::middleware::cors::{self, CorsOptions, CorsRoute};
use crate::request::Request;
use crate::response::Response;
use crate::router::{MatchMode, RouteHandle, RouteTable};
use crate::scheduler::{MainThreadScheduler, Phase};

/// How the accept loop hands matched requests to the host thread.
///
/// The two are never mixed within one server.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Queue the unit and go straight back to `accept`. Highest accept
    /// throughput; any number of requests may wait in the (unbounded) queue,
    /// and "accepted" says nothing about "handled".
    #[default]
    FireAndForget,
    /// Matched requests reach the host one at a time, and `accept` waits
    /// until the current one's handler has run and its response is closed.
    /// Handling is paced by the host's tick rate, and a slow handler stalls
    /// `accept`. Connections still sending their request head do not.
    BlockingHandoff,
}

/// Lifecycle of a server's listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped   => "stopped",
            Self::Starting  => "starting",
            Self::Listening => "listening",
            Self::Stopping  => "stopping",
        })
    }
}

/// State shared between the server handle and its listener thread.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self { Self(AtomicU8::new(ServerState::Stopped as u8)) }

    pub(crate) fn set(&self, state: ServerState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> ServerState {
        match self.0.load(Ordering::SeqCst) {
            1 => ServerState::Starting,
            2 => ServerState::Listening,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// An HTTP endpoint embedded in a single-threaded host.
///
/// ```rust,no_run
/// use tickserve::{MatchMode, Method, Phase, Server, ServerConfig};
///
/// let mut server = Server::new(ServerConfig::default().with_port(8080));
/// server.register(Method::Get, "/hello", MatchMode::Exact, |_, res| {
///     res.write_json(r#"{"message":"Hello World"}"#)
/// })?;
/// server.start()?;
///
/// loop {
///     // ... the host's own per-tick work ...
///     server.drain(Phase::First);
/// #   break;
/// }
/// # Ok::<(), tickserve::Error>(())
/// ```
pub struct Server {
    config: ServerConfig,
    routes: Arc<RouteTable>,
    scheduler: Arc<MainThreadScheduler>,
    state: Arc<StateCell>,
    running: Option<Running>,
}

impl Server {
    /// Creates a stopped server whose scheduler is bound to the calling
    /// thread, which is taken to be the host thread.
    pub fn new(config: ServerConfig) -> Self {
        let scheduler = Arc::new(MainThreadScheduler::new(config.phase));
        Self::with_scheduler(config, scheduler)
    }

    /// Creates a stopped server feeding an existing scheduler. The scheduler's
    /// phase wins over `config.phase`.
    pub fn with_scheduler(mut config: ServerConfig, scheduler: Arc<MainThreadScheduler>) -> Self {
        config.phase = scheduler.phase();
        Self {
            config,
            routes: Arc::new(RouteTable::new()),
            scheduler,
            state: Arc::new(StateCell::new()),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig { &self.config }
    pub fn routes(&self) -> &RouteTable { &self.routes }
    pub fn scheduler(&self) -> &Arc<MainThreadScheduler> { &self.scheduler }
    pub fn state(&self) -> ServerState { self.state.get() }

    /// True from `start` until `stop` has fully finished.
    pub fn is_running(&self) -> bool {
        self.state() != ServerState::Stopped
    }

    /// The bound address while running. Reflects the real port when the
    /// configured port is `0`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn invoker(&self) -> CrossThreadInvoker {
        CrossThreadInvoker::new(Arc::clone(&self.scheduler))
    }

    /// Runs queued work for `phase`. The host calls this once per tick for
    /// every phase it has.
    pub fn drain(&self, phase: Phase) -> usize {
        self.scheduler.drain(phase)
    }

    // ── Route registration ────────────────────────────────────────────────────

    /// Mutable access to the route table, refused while running.
    pub fn routes_mut(&mut self) -> Result<&mut RouteTable, Error> {
        if self.is_running() {
            warn!("server is busy, routes cannot change while it is running");
            return Err(Error::ServerBusy);
        }
        self.reap();
        Arc::get_mut(&mut self.routes).ok_or(Error::ServerBusy)
    }

    pub fn register<F, R>(&mut self, method: Method, path: &str, mode: MatchMode, handler: F) -> Result<RouteHandle, Error>
    where
        F: Fn(&Request, &mut Response) -> R + Send + Sync + 'static,
        R: HandlerResult + 'static,
    {
        Ok(self.routes_mut()?.register(method, path, mode, handler))
    }

    /// Removes a route. `Ok(false)` if no route had this handle.
    pub fn unregister(&mut self, handle: RouteHandle) -> Result<bool, Error> {
        Ok(self.routes_mut()?.unregister(handle))
    }

    /// Registers a CORS-wrapped route and its OPTIONS preflight sibling.
    /// See [`cors::register`].
    pub fn register_cors<F, R>(
        &mut self,
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
        cors::register(self.routes_mut()?, method, path, mode, handler, options)
    }

    pub fn unregister_cors(&mut self, pair: CorsRoute) -> Result<bool, Error> {
        Ok(cors::unregister(self.routes_mut()?, pair))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Binds the socket and starts the accept loop on its own thread.
    ///
    /// Returns once the socket is bound. A bind failure is returned as
    /// [`Error::Startup`]; the thread has exited and the server is stopped.
    /// Starting a running server only logs a warning.
    pub fn start(&mut self) -> Result<(), Error> {
        match self.state() {
            ServerState::Starting | ServerState::Listening => {
                warn!("server is already running");
                return Ok(());
            }
            ServerState::Stopping => {
                warn!("server is still stopping");
                return Err(Error::ServerBusy);
            }
            ServerState::Stopped => self.reap(),
        }

        let addr = self.config.bind_addr();
        self.state.set(ServerState::Starting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let listener = ListenerLoop::new(
            self.config.clone(),
            Arc::clone(&self.routes),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.state),
        );

        let spawned = thread::Builder::new()
            .name("http server".to_owned())
            .spawn(move || listener.run(shutdown_rx, ready_tx));
        let thread = match spawned {
            Ok(t) => t,
            Err(source) => {
                self.state.set(ServerState::Stopped);
                return Err(Error::Startup { addr, source });
            }
        };

        match ready_rx.recv() {
            Ok(Ok(local_addr)) => {
                self.running = Some(Running { shutdown: shutdown_tx, thread, local_addr });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                self.state.set(ServerState::Stopped);
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                self.state.set(ServerState::Stopped);
                Err(Error::Startup {
                    addr,
                    source: io::Error::other("listener thread exited before binding"),
                })
            }
        }
    }

    /// Interrupts the accept loop, closes the socket and joins the thread.
    ///
    /// Does not wait for queued or in-flight requests. Stopping a stopped
    /// server only logs a warning.
    pub fn stop(&mut self) -> Result<(), Error> {
        let Some(running) = self.running.take() else {
            warn!("server is not running");
            return Ok(());
        };

        self.state.set(ServerState::Stopping);
        // Fails only if the thread is already gone, which is fine.
        let _ = running.shutdown.send(true);
        let joined = running.thread.join();
        self.state.set(ServerState::Stopped);
        shutdown_result(joined, running.local_addr)
    }

    /// Joins a listener thread that ended on its own.
    fn reap(&mut self) {
        if let Some(running) = self.running.take() {
            if running.thread.join().is_err() {
                error!(addr = %running.local_addr, "listener thread panicked");
            }
        }
    }
}

/// Maps the listener thread's join result. A panic is reported as
/// [`Error::Shutdown`] carrying the panic message.
fn shutdown_result(joined: thread::Result<()>, addr: SocketAddr) -> Result<(), Error> {
    joined.map_err(|payload| {
        let reason = match HandlerError::from_panic(payload) {
            HandlerError::Panicked(message) => message,
            other => other.to_string(),
        };
        error!(%addr, %reason, "listener failed to close cleanly; forced closed");
        Error::Shutdown(reason)
    })
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.stop();
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("routes", &self.routes)
            .finish()
    }
}

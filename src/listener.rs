//! The background accept loop.
//!
//! One OS thread per running server owns a current-thread tokio runtime and
//! the listening socket. For every accepted connection it matches the request
//! against the route table:
//!
//! - no match: `404 Not Found` is written right here, on the listener thread,
//!   and the scheduler is never touched;
//! - match: the request body is buffered, a [`DispatchUnit`] is built and
//!   handed to the host thread according to the [`DispatchPolicy`].
//!
//! Every connection is read on its own task, so a client that connects and
//! sends nothing never holds up anyone else. Under blocking hand-off the
//! matched requests take turns through a one-permit semaphore, and `accept`
//! waits while a turn is taken.
//!
//! Shutdown is a `watch` signal raced against `accept` with `biased` select,
//! so a blocked accept is interrupted deterministically. The socket is then
//! dropped and in-flight connections are aborted without a response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc::SyncSender;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{LogOptions, ServerConfig};
use crate::error::Error;
use crate::invoker::CrossThreadInvoker;
use crate::request::{self, Request};
use crate::response::{self, HttpResponse, Response};
use crate::router::RouteTable;
use crate::scheduler::{DispatchUnit, MainThreadScheduler};
use crate::server::{DispatchPolicy, ServerState, StateCell};

/// Everything the listener thread needs, moved onto it at start.
pub(crate) struct ListenerLoop {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    state: Arc<StateCell>,
}

/// Per-request routing and hand-off. Shared by all connection tasks.
struct Dispatcher {
    routes: Arc<RouteTable>,
    scheduler: Arc<MainThreadScheduler>,
    invoker: CrossThreadInvoker,
    policy: DispatchPolicy,
    /// One turn at the host thread; `Some` only under blocking hand-off.
    handoff: Option<Semaphore>,
    log: LogOptions,
}

/// Marks the server stopped however the listener thread ends.
struct StoppedOnExit(Arc<StateCell>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.set(ServerState::Stopped);
    }
}

impl ListenerLoop {
    pub(crate) fn new(
        config: ServerConfig,
        routes: Arc<RouteTable>,
        scheduler: Arc<MainThreadScheduler>,
        state: Arc<StateCell>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher {
            routes,
            invoker: CrossThreadInvoker::new(Arc::clone(&scheduler)),
            scheduler,
            policy: config.policy,
            handoff: (config.policy == DispatchPolicy::BlockingHandoff).then(|| Semaphore::new(1)),
            log: config.log,
        });
        Self { config, dispatcher, state }
    }

    /// Thread body. Reports the bind result through `ready`, then serves
    /// until `shutdown` fires.
    pub(crate) fn run(self, shutdown: watch::Receiver<bool>, ready: SyncSender<Result<SocketAddr, Error>>) {
        let _guard = StoppedOnExit(Arc::clone(&self.state));

        let runtime = match tokio::runtime::Builder::new_current_thread().enable_io().build() {
            Ok(rt) => rt,
            Err(source) => {
                let _ = ready.send(Err(Error::Startup { addr: self.config.bind_addr(), source }));
                return;
            }
        };
        runtime.block_on(self.listen(shutdown, ready));
    }

    async fn listen(self, mut shutdown: watch::Receiver<bool>, ready: SyncSender<Result<SocketAddr, Error>>) {
        let addr = self.config.bind_addr();
        let bound = match TcpListener::bind(&addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(v) => v,
            Err(source) => {
                error!(%addr, error = %source, "failed to bind");
                let _ = ready.send(Err(Error::Startup { addr, source }));
                return;
            }
        };

        self.state.set(ServerState::Listening);
        if self.config.log.started_listening {
            let config = self.config.clone().with_port(local_addr.port());
            for route in self.dispatcher.routes.iter() {
                info!(method = %route.method(), prefix = %config.prefix_for(route.path()), "route bound");
            }
            info!(addr = %local_addr, policy = ?self.dispatcher.policy, "server listening");
        }
        let _ = ready.send(Ok(local_addr));

        let mut tasks = JoinSet::new();

        loop {
            // Blocking hand-off: hold off accepting while a matched request
            // is with the host.
            if let Some(gate) = &self.dispatcher.handoff {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    turn = gate.acquire() => drop(turn),
                }
            }

            tokio::select! {
                // Shutdown first, so a stop request wins over queued connections.
                biased;

                _ = shutdown.changed() => break,

                res = listener.accept() => {
                    let (stream, peer) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(serve_connection(Arc::clone(&self.dispatcher), stream, peer));
                }

                // Reap finished connection tasks.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        self.state.set(ServerState::Stopping);
        drop(listener);
        let abandoned = tasks.len();
        tasks.shutdown().await;

        if self.config.log.closed_listening {
            info!(addr = %local_addr, abandoned, "server closed");
        }
    }
}

async fn serve_connection(dispatcher: Arc<Dispatcher>, stream: TcpStream, peer: SocketAddr) {
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| {
        let dispatcher = Arc::clone(&dispatcher);
        async move { dispatcher.dispatch(req, peer).await }
    });

    // One request per connection: each accepted connection is one unit.
    if let Err(e) = http1::Builder::new()
        .keep_alive(false)
        .serve_connection(io, svc)
        .await
    {
        debug!(%peer, "connection ended: {e}");
    }
}

impl Dispatcher {
    /// Routes one request and waits for its response.
    ///
    /// An `Err` makes hyper drop the connection without writing anything,
    /// which is what the client sees when a handler fails.
    async fn dispatch(&self, req: hyper::Request<Incoming>, peer: SocketAddr) -> Result<HttpResponse, Error> {
        let (parts, body) = req.into_parts();
        if self.log.received_routes {
            info!(method = %parts.method, uri = %parts.uri, %peer, "request");
            debug!(headers = ?parts.headers, "request headers");
        }

        let route = {
            let path = request::decode_path(parts.uri.path());
            match self.routes.find(parts.method.as_str(), &path) {
                Some(route) => Arc::clone(route),
                None => {
                    debug!(method = %parts.method, %path, "no route matched");
                    return Ok(response::not_found());
                }
            }
        };

        let body = body.collect().await?.to_bytes();

        // Held until the response is back, so matched requests reach the
        // host one at a time. The semaphore is never closed.
        let _turn = match &self.handoff {
            Some(gate) => gate.acquire().await.ok(),
            None => None,
        };
        let request = Request::from_parts(parts.method.as_str().to_owned(), parts.uri, parts.headers, body, Some(peer));
        let path = request.path().to_owned();
        let (response, pending) = Response::channel();
        let unit = DispatchUnit::new(route, request, response);

        match self.policy {
            DispatchPolicy::FireAndForget => self.scheduler.enqueue(unit),
            DispatchPolicy::BlockingHandoff => {
                if let Err(e) = self.invoker.submit(move || unit.run_logged()).wait().await {
                    warn!(%path, error = %e, "blocking hand-off did not complete");
                }
            }
        }

        match pending.await {
            Ok(res) => {
                if self.log.response_info {
                    info!(%path, status = %res.status(), "response");
                }
                Ok(res)
            }
            Err(_) => {
                warn!(%path, "handler finished without a response; dropping connection");
                Err(Error::NoResponse)
            }
        }
    }
}

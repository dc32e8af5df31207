//! Hand-off queue between the listener thread and the host thread.
//!
//! The host application is single-threaded and only advances at discrete
//! synchronisation points. It calls [`MainThreadScheduler::drain`] once per
//! tick for every [`Phase`] it has; the scheduler only runs work when the
//! phase matches the one it was configured for.
//!
//! # Guarantees
//!
//! - [`enqueue`](MainThreadScheduler::enqueue) never blocks on the consumer
//!   and never rejects. The queue is unbounded: under sustained overload it
//!   grows without limit. There is no backpressure signal.
//! - Work runs in FIFO order, exactly once, on the host thread.
//! - Each unit is isolated: a handler that fails or panics is logged and the
//!   rest of the drain carries on.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::HandlerError;
use crate::request::Request;
use crate::response::Response;
use crate::router::Route;

/// An opaque synchronisation point in the host's tick.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    First,
    Second,
    Third,
}

// ── DispatchUnit ──────────────────────────────────────────────────────────────

/// A matched route paired with one request and its response.
///
/// Single use: it runs once, succeeds or fails, and is gone.
pub struct DispatchUnit {
    route: Arc<Route>,
    request: Request,
    response: Response,
}

impl DispatchUnit {
    pub fn new(route: Arc<Route>, request: Request, response: Response) -> Self {
        Self { route, request, response }
    }

    pub fn route(&self) -> &Route { &self.route }

    /// Invokes the handler, catching panics.
    ///
    /// A response the handler left open is closed here. On failure the
    /// response is dropped unclosed, so the client gets no response.
    pub fn run(self) -> Result<(), HandlerError> {
        let Self { route, request, mut response } = self;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            route.handler().call(&request, &mut response)
        }));
        match outcome {
            Ok(Ok(())) if response.is_closed() => Ok(()),
            Ok(Ok(())) => response.close().map_err(HandlerError::from),
            Ok(Err(e)) => Err(e),
            Err(payload) => Err(HandlerError::from_panic(payload)),
        }
    }

    /// Runs the unit and logs a failure instead of returning it.
    pub(crate) fn run_logged(self) {
        let method = self.route.method();
        let path = self.request.path().to_owned();
        if let Err(e) = self.run() {
            error!(%method, %path, error = %e, "request handler failed");
        }
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

pub(crate) type Call = Box<dyn FnOnce() + Send + 'static>;

/// One queued item. Routed requests and cross-thread calls share one queue so
/// their relative order is preserved.
pub(crate) enum Job {
    Dispatch(DispatchUnit),
    Call(Call),
}

impl Job {
    fn run(self) {
        match self {
            Self::Dispatch(unit) => unit.run_logged(),
            Self::Call(call) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(call)) {
                    error!(error = %HandlerError::from_panic(payload), "scheduled call failed");
                }
            }
        }
    }
}

// ── MainThreadScheduler ───────────────────────────────────────────────────────

/// Thread-safe FIFO of work destined for the host thread.
pub struct MainThreadScheduler {
    phase: Phase,
    host: ThreadId,
    queue: Mutex<VecDeque<Job>>,
}

impl MainThreadScheduler {
    /// Creates a scheduler bound to the calling thread, which becomes the only
    /// thread allowed to [`drain`](Self::drain).
    pub fn new(phase: Phase) -> Self {
        Self::for_thread(phase, thread::current().id())
    }

    pub fn for_thread(phase: Phase, host: ThreadId) -> Self {
        Self { phase, host, queue: Mutex::new(VecDeque::with_capacity(8)) }
    }

    pub fn phase(&self) -> Phase { self.phase }
    pub fn host_thread(&self) -> ThreadId { self.host }

    pub fn is_host_thread(&self) -> bool {
        thread::current().id() == self.host
    }

    /// Queues a unit for the next matching drain.
    pub fn enqueue(&self, unit: DispatchUnit) {
        self.push(Job::Dispatch(unit));
    }

    pub(crate) fn push(&self, job: Job) {
        self.lock().push_back(job);
    }

    /// Units currently waiting.
    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    /// Runs everything queued so far, in order, on the calling thread.
    ///
    /// Does nothing when `phase` is not this scheduler's phase or when called
    /// off the host thread. Work queued while draining waits for the next
    /// call. Returns how many units ran.
    pub fn drain(&self, phase: Phase) -> usize {
        if phase != self.phase {
            return 0;
        }
        if !self.is_host_thread() {
            warn!(?phase, "drain called off the host thread; ignoring");
            return 0;
        }

        // Take the batch and release the lock before running anything, so
        // handlers may enqueue without deadlocking.
        let batch = std::mem::take(&mut *self.lock());
        let count = batch.len();
        for job in batch {
            job.run();
        }
        if count > 0 {
            debug!(?phase, count, "drained");
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        // Jobs never run under the lock, so a poisoned queue is still intact.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MainThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadScheduler")
            .field("phase", &self.phase)
            .field("host", &self.host)
            .field("queued", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::method::Method;
    use crate::router::{MatchMode, RouteTable};

    type Log = Arc<Mutex<Vec<usize>>>;

    /// A route whose handler records `id` into `log`.
    fn unit(log: &Log, id: usize) -> DispatchUnit {
        let mut table = RouteTable::new();
        let log = Arc::clone(log);
        let handle = table.register(Method::Get, "/", MatchMode::Exact, move |_, _| {
            log.lock().unwrap().push(id);
        });
        let route = Arc::clone(table.get(handle).unwrap());
        DispatchUnit::new(route, Request::new("GET", "/"), Response::new())
    }

    fn failing(kind: &'static str) -> DispatchUnit {
        let mut table = RouteTable::new();
        let handle = match kind {
            "panic" => table.register(Method::Get, "/", MatchMode::Exact, |_, _| -> () {
                panic!("handler exploded")
            }),
            _ => table.register(Method::Get, "/", MatchMode::Exact, |_, _| Err::<(), _>("bad input")),
        };
        let route = Arc::clone(table.get(handle).unwrap());
        DispatchUnit::new(route, Request::new("GET", "/"), Response::new())
    }

    #[test]
    fn drain_runs_in_fifo_order() {
        let sched = MainThreadScheduler::new(Phase::First);
        let log = Log::default();
        for id in 0..20 {
            sched.enqueue(unit(&log, id));
        }
        assert_eq!(sched.len(), 20);
        assert_eq!(sched.drain(Phase::First), 20);
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert!(sched.is_empty());
    }

    #[test]
    fn concurrent_producers_keep_enqueue_order() {
        let sched = Arc::new(MainThreadScheduler::new(Phase::First));
        let executed = Log::default();
        let enqueued = Log::default();
        let next = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..8)
            .map(|_| {
                let sched = Arc::clone(&sched);
                let executed = Arc::clone(&executed);
                let enqueued = Arc::clone(&enqueued);
                let next = Arc::clone(&next);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let id = next.fetch_add(1, Ordering::SeqCst);
                        // Hold the record lock across enqueue so the record
                        // reflects the queue's order.
                        let mut record = enqueued.lock().unwrap();
                        sched.enqueue(unit(&executed, id));
                        record.push(id);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(sched.drain(Phase::First), 400);
        assert_eq!(*executed.lock().unwrap(), *enqueued.lock().unwrap());
    }

    #[test]
    fn failing_handlers_do_not_stop_the_drain() {
        let sched = MainThreadScheduler::new(Phase::Second);
        let log = Log::default();
        sched.enqueue(unit(&log, 1));
        sched.enqueue(failing("panic"));
        sched.enqueue(unit(&log, 2));
        sched.enqueue(failing("error"));
        sched.enqueue(unit(&log, 3));

        assert_eq!(sched.drain(Phase::Second), 5);
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
        assert!(sched.is_empty());
    }

    #[test]
    fn other_phases_leave_the_queue_alone() {
        let sched = MainThreadScheduler::new(Phase::Third);
        let log = Log::default();
        sched.enqueue(unit(&log, 1));

        assert_eq!(sched.drain(Phase::First), 0);
        assert_eq!(sched.drain(Phase::Second), 0);
        assert_eq!(sched.len(), 1);
        assert_eq!(sched.drain(Phase::Third), 1);
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn drain_off_the_host_thread_is_refused() {
        let sched = Arc::new(MainThreadScheduler::new(Phase::First));
        let log = Log::default();
        sched.enqueue(unit(&log, 1));

        let remote = Arc::clone(&sched);
        let ran = thread::spawn(move || remote.drain(Phase::First)).join().unwrap();
        assert_eq!(ran, 0);
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn work_queued_during_a_drain_waits_for_the_next_one() {
        let sched = Arc::new(MainThreadScheduler::new(Phase::First));
        let log = Log::default();
        let inner = Arc::clone(&sched);
        let inner_log = Arc::clone(&log);
        sched.push(Job::Call(Box::new(move || inner.enqueue(unit(&inner_log, 9)))));

        assert_eq!(sched.drain(Phase::First), 1);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(sched.drain(Phase::First), 1);
        assert_eq!(*log.lock().unwrap(), vec![9]);
    }

    #[test]
    fn run_closes_a_response_left_open() {
        let mut table = RouteTable::new();
        let handle = table.register(Method::Get, "/", MatchMode::Exact, |_, res| {
            res.set_status(http::StatusCode::ACCEPTED)
        });
        let route = Arc::clone(table.get(handle).unwrap());
        let (res, mut rx) = Response::channel();
        DispatchUnit::new(route, Request::new("GET", "/"), res).run().unwrap();
        assert_eq!(rx.try_recv().unwrap().status(), http::StatusCode::ACCEPTED);
    }

    #[test]
    fn failed_run_abandons_the_response() {
        let (res, mut rx) = Response::channel();
        let DispatchUnit { route, request, .. } = failing("error");
        let err = DispatchUnit::new(route, request, res).run().unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
        assert!(rx.try_recv().is_err());
    }
}

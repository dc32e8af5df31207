//! Blocking hand-off to the host thread.
//!
//! [`CrossThreadInvoker::execute_on_main_thread`] lets any thread run a
//! closure on the host thread and wait for it. On the host thread itself the
//! closure runs inline and the queue is never touched.
//!
//! There is no timeout: the caller waits until the host's next drain of the
//! scheduler's phase, however long that takes.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::error;

use crate::error::{Error, HandlerError};
use crate::scheduler::{Job, MainThreadScheduler};

/// Submits closures to a [`MainThreadScheduler`] and waits for them.
#[derive(Clone, Debug)]
pub struct CrossThreadInvoker {
    scheduler: Arc<MainThreadScheduler>,
}

impl CrossThreadInvoker {
    pub fn new(scheduler: Arc<MainThreadScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Arc<MainThreadScheduler> { &self.scheduler }

    /// Runs `work` on the host thread and returns its value.
    ///
    /// Called on the host thread, `work` runs immediately. Otherwise it is
    /// queued and the calling thread blocks until a drain runs it. A panic in
    /// `work` is logged and returned as [`Error::Handler`]; the caller is
    /// released either way.
    ///
    /// # Panics
    ///
    /// Panics if called off the host thread from within an async runtime;
    /// use [`submit`](Self::submit) and await the [`Completion`] there.
    pub fn execute_on_main_thread<F, T>(&self, work: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.scheduler.is_host_thread() {
            return run_caught(work).map_err(Error::from);
        }
        self.submit(work).wait_blocking()
    }

    /// Queues `work` for the host thread without waiting.
    pub fn submit<F, T>(&self, work: F) -> Completion<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.scheduler.push(Job::Call(Box::new(move || {
            // The waiter may have given up; nothing to do then.
            let _ = tx.send(run_caught(work));
        })));
        Completion { rx }
    }
}

/// Completion signal of a submitted closure.
#[must_use = "dropping a Completion does not cancel the work"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, HandlerError>>,
}

impl<T> Completion<T> {
    /// Waits asynchronously for the host to run the work.
    pub async fn wait(self) -> Result<T, Error> {
        flatten(self.rx.await)
    }

    /// Blocks the current thread until the host runs the work.
    pub fn wait_blocking(self) -> Result<T, Error> {
        flatten(self.rx.blocking_recv())
    }
}

fn flatten<T>(received: Result<Result<T, HandlerError>, oneshot::error::RecvError>) -> Result<T, Error> {
    match received {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::SchedulerClosed),
    }
}

fn run_caught<F, T>(work: F) -> Result<T, HandlerError>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(work)).map_err(|payload| {
        let e = HandlerError::from_panic(payload);
        error!(error = %e, "work scheduled on the host thread failed");
        e
    })
}

//! The scheduler behind the blocking and spawning façades.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::executor::{LocalPool, LocalSpawner};
use futures::future::RemoteHandle;
use futures::task::LocalSpawnExt;
use scopeguard::defer;
use thiserror::Error;

thread_local! {
    /// Whether a scheduler is currently driving tasks on this thread. This is an explicit flag
    /// rather than a reliance on the executor's own nesting detection, so the refusal is a
    /// stable part of the contract and not an implementation accident.
    static SCHEDULER_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// The blocking façade was invoked from inside an active scheduler.
///
/// `run_blocking` parks the calling thread of control until the given work completes. Called
/// from within a task, it would park the very scheduler that has to complete that work, so the
/// blocking façade is for outermost callers only. Tasks compose with other tasks by awaiting.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error(
    "run_blocking invoked from inside an active scheduler; the blocking façade is for outermost callers only"
)]
pub struct ReentrancyError;

/// A single-threaded cooperative scheduler with two invocation styles for the same work.
///
/// The blocking façade drives a unit of suspendable work to completion and returns its value.
/// The spawning façade starts the work and hands back a [`TaskHandle`] immediately, resolved by
/// the same scheduler the next time it runs.
///
/// # Example
///
/// ```
/// use interleave::Scheduler;
///
/// let scheduler = Scheduler::new();
///
/// let task = scheduler.spawn(async { 2 + 2 });
/// let sum = scheduler.run_blocking(task);
///
/// assert_eq!(sum, 4);
/// ```
pub struct Scheduler {
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
}

impl Scheduler {
    /// Creates a scheduler with an empty task pool.
    #[must_use]
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();

        Self {
            pool: RefCell::new(pool),
            spawner,
        }
    }

    /// Drives `future` to completion on this scheduler and returns its output.
    ///
    /// Previously spawned tasks make interleaved progress while the future is being driven.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an active scheduler on the current thread. Use
    /// [`try_run_blocking`][Self::try_run_blocking] to receive the refusal as a value instead.
    pub fn run_blocking<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        match self.try_run_blocking(future) {
            Ok(output) => output,
            Err(error) => panic!("{error}"),
        }
    }

    /// Drives `future` to completion on this scheduler, refusing with [`ReentrancyError`] if a
    /// scheduler is already active on the current thread.
    pub fn try_run_blocking<F>(&self, future: F) -> Result<F::Output, ReentrancyError>
    where
        F: Future,
    {
        if SCHEDULER_ACTIVE.get() {
            return Err(ReentrancyError);
        }

        SCHEDULER_ACTIVE.set(true);
        defer! {
            SCHEDULER_ACTIVE.set(false);
        }

        Ok(self.pool.borrow_mut().run_until(future))
    }

    /// Starts `future` as a task on this scheduler and returns a handle to it immediately.
    ///
    /// The task makes progress whenever the scheduler runs, typically while a
    /// [`run_blocking`][Self::run_blocking] call is driving other work. Await the handle to
    /// retrieve the output.
    ///
    /// Dropping the handle cancels the task at its next suspension point; call
    /// [`TaskHandle::detach`] to let it run to completion unobserved.
    pub fn spawn<F>(&self, future: F) -> TaskHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: Send + 'static,
    {
        let inner = self
            .spawner
            .spawn_local_with_handle(future)
            .expect("the task pool outlives its spawner, so spawning cannot fail");

        TaskHandle { inner: Some(inner) }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

/// Runs a unit of suspendable work to completion on a fresh scheduler.
///
/// Convenience for the common case where no tasks need to be spawned alongside the work.
///
/// # Panics
///
/// Panics if called from inside an active scheduler on the current thread.
pub fn run_blocking<F>(future: F) -> F::Output
where
    F: Future,
{
    Scheduler::new().run_blocking(future)
}

/// A handle to a spawned task that can be awaited to retrieve its output.
///
/// Dropping the handle cancels the task; [`detach`][Self::detach] releases the task to run to
/// completion without an observer.
#[derive(Debug)]
pub struct TaskHandle<T> {
    inner: Option<RemoteHandle<T>>,
}

impl<T> TaskHandle<T>
where
    T: Send + 'static,
{
    /// Releases the task to run to completion on its scheduler; the output is discarded.
    pub fn detach(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.forget();
        }
    }
}

impl<T> Future for TaskHandle<T>
where
    T: Send + 'static,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self
            .get_mut()
            .inner
            .as_mut()
            .expect("TaskHandle polled after completion");

        Pin::new(inner).poll(cx)
    }
}

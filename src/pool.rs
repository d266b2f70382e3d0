//! Bounded worker pool that runs crawler pipelines concurrently.
//!
//! The pool owns a bounded `kanal` channel of capacity `N` and at most `N`
//! worker tasks. Workers are spawned lazily by [`WorkerPool::submit`] and exit
//! once the queue is empty, so an idle pool holds no tasks at all.
//!
//! # Concurrency Model
//!
//! - `submit` enqueues first (blocking while the queue is full) and then
//!   spawns a worker if fewer than `N` are running
//! - a worker that finds the queue empty re-checks under the state lock before
//!   exiting, so a task enqueued concurrently is never stranded
//! - a worker that dies while tasks remain is replaced (`check_worker`)
//! - [`WorkerPool::wait`] resolves once no task is pending and no worker runs
//!
//! Tasks from one worker run in the order that worker dequeued them; there is
//! no ordering across workers.
//!
//! # Example
//!
//! ```
//! use predator::pool::WorkerPool;
//!
//! # async fn example() -> Result<(), predator::pool::PoolError> {
//! let pool = WorkerPool::new(4, true)?;
//! for i in 0..10 {
//!     pool.submit(async move {
//!         tracing::info!(i, "task ran");
//!         Ok(())
//!     })
//!     .await?;
//! }
//! pool.close().await;
//! assert_eq!(pool.running(), 0);
//! # Ok(())
//! # }
//! ```

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use kanal::{AsyncReceiver, AsyncSender};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, error, instrument, warn};

use crate::error::CrawlError;

/// A unit of work executed by a pool worker.
pub type Task = Pin<Box<dyn Future<Output = Result<(), CrawlError>> + Send + 'static>>;

/// Errors returned by pool construction and submission.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was closed before the task was submitted.
    #[error("worker pool already closed")]
    AlreadyClosed,

    /// Capacity must be at least one.
    #[error("invalid worker pool capacity {capacity}")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: usize,
    },
}

#[derive(Debug, Default)]
struct State {
    stopped: bool,
    running: usize,
}

struct Shared {
    capacity: usize,
    block_panic: bool,
    sender: AsyncSender<Task>,
    receiver: AsyncReceiver<Task>,
    state: Mutex<State>,
    pending: AtomicUsize,
    idle: Notify,
    completed: AtomicUsize,
    failed: AtomicUsize,
    panicked: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded-concurrency executor with lazy worker spin-up and graceful drain.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.shared.capacity)
            .field("block_panic", &self.shared.block_panic)
            .field("running", &self.running())
            .field("pending", &self.pending())
            .finish()
    }
}

impl WorkerPool {
    /// Creates a pool running at most `capacity` tasks at once.
    ///
    /// With `block_panic` a panicking task is logged and its worker replaced;
    /// without it the panic is resumed and tears down that worker task.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidCapacity`] when `capacity` is zero.
    pub fn new(capacity: usize, block_panic: bool) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity { capacity });
        }
        let (sender, receiver) = kanal::bounded_async(capacity);
        debug!(capacity, block_panic, "creating worker pool");
        Ok(Self {
            shared: Arc::new(Shared {
                capacity,
                block_panic,
                sender,
                receiver,
                state: Mutex::new(State::default()),
                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                completed: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                panicked: AtomicUsize::new(0),
            }),
        })
    }

    /// Enqueues `task`, waiting while the queue is full.
    ///
    /// A task that submits further tasks into a saturated pool will wait for
    /// queue space, so handlers that fan out should keep the fan-out below the
    /// pool capacity.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyClosed`] once [`close`](Self::close) has begun.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = Result<(), CrawlError>> + Send + 'static,
    {
        if self.shared.lock().stopped {
            return Err(PoolError::AlreadyClosed);
        }
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.shared.sender.send(Box::pin(task)).await.is_err() {
            finish_task(&self.shared);
            return Err(PoolError::AlreadyClosed);
        }
        check_worker(&self.shared);
        Ok(())
    }

    /// Waits until the queue is empty and every worker has exited.
    #[instrument(level = "debug", skip(self))]
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Refuses new submissions, drains queued work, then closes the queue.
    #[instrument(level = "debug", skip(self))]
    pub async fn close(&self) {
        self.shared.lock().stopped = true;
        self.wait().await;
        // Closing an already closed channel is harmless.
        let _ = self.shared.sender.close();
        debug!(
            completed = self.completed(),
            failed = self.failed(),
            panicked = self.panicked(),
            "worker pool closed"
        );
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of live workers.
    #[must_use]
    pub fn running(&self) -> usize {
        self.shared.lock().running
    }

    /// Tasks submitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Whether `close()` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.lock().stopped
    }

    /// Tasks that returned `Ok`.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    /// Tasks that returned an error.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Tasks that panicked.
    #[must_use]
    pub fn panicked(&self) -> usize {
        self.shared.panicked.load(Ordering::SeqCst)
    }

    fn is_idle(&self) -> bool {
        let state = self.shared.lock();
        state.running == 0 && self.shared.pending.load(Ordering::SeqCst) == 0
    }
}

/// Spawns a worker when tasks are queued and fewer than `capacity` run.
fn check_worker(shared: &Arc<Shared>) {
    let mut state = shared.lock();
    if state.running >= shared.capacity || shared.receiver.is_empty() {
        return;
    }
    state.running += 1;
    drop(state);
    tokio::spawn(run_worker(Arc::clone(shared)));
}

fn finish_task(shared: &Shared) {
    if shared.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
        shared.idle.notify_waiters();
    }
}

/// Marks a task finished even when it unwinds.
struct TaskGuard<'a>(&'a Shared);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        finish_task(self.0);
    }
}

/// Releases a worker slot if the worker dies, and spins up a replacement.
struct WorkerGuard {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.shared.lock().running -= 1;
        warn!("worker exited abnormally");
        if !self.shared.receiver.is_empty() {
            check_worker(&self.shared);
        }
        self.shared.idle.notify_waiters();
    }
}

async fn run_worker(shared: Arc<Shared>) {
    let mut guard = WorkerGuard {
        shared: Arc::clone(&shared),
        armed: true,
    };
    loop {
        let task = match shared.receiver.try_recv() {
            Ok(Some(task)) => task,
            Ok(None) => {
                let mut state = shared.lock();
                if shared.receiver.is_empty() {
                    state.running -= 1;
                    guard.armed = false;
                    drop(state);
                    shared.idle.notify_waiters();
                    return;
                }
                continue;
            }
            Err(_) => {
                shared.lock().running -= 1;
                guard.armed = false;
                shared.idle.notify_waiters();
                return;
            }
        };

        let _task_guard = TaskGuard(&shared);
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => {
                shared.completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Err(error)) => {
                shared.failed.fetch_add(1, Ordering::SeqCst);
                warn!(error = %error, "pool task failed");
            }
            Err(payload) => {
                shared.panicked.fetch_add(1, Ordering::SeqCst);
                if !shared.block_panic {
                    std::panic::resume_unwind(payload);
                }
                error!(panic = %panic_message(payload.as_ref()), "pool task panicked");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            WorkerPool::new(0, false).unwrap_err(),
            PoolError::InvalidCapacity { capacity: 0 }
        );
    }

    #[tokio::test]
    async fn test_wait_on_fresh_pool_returns() {
        let pool = WorkerPool::new(2, false).unwrap();
        pool.wait().await;
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_all_tasks_run_and_pool_drains() {
        let pool = WorkerPool::new(3, false).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.running(), 0);
        assert_eq!(pool.completed(), 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_never_exceeds_capacity() {
        let pool = WorkerPool::new(2, false).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            pool.submit(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
            assert!(pool.running() <= 2);
        }
        pool.wait().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_task_errors_are_counted_not_fatal() {
        let pool = WorkerPool::new(1, false).unwrap();
        pool.submit(async { Err(CrawlError::EmptyProxyPool) })
            .await
            .unwrap();
        pool.submit(async { Ok(()) }).await.unwrap();
        pool.wait().await;
        assert_eq!(pool.failed(), 1);
        assert_eq!(pool.completed(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_block_panic_keeps_pool_alive() {
        let pool = WorkerPool::new(1, true).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(async { panic!("boom") }).await.unwrap();
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        }
        pool.wait().await;
        assert_eq!(pool.panicked(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unblocked_panic_replaces_worker() {
        let pool = WorkerPool::new(1, false).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(async { panic!("worker dies") }).await.unwrap();
        let after = Arc::clone(&counter);
        pool.submit(async move {
            after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        pool.wait().await;
        assert_eq!(pool.panicked(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_close_fails() {
        let pool = WorkerPool::new(2, false).unwrap();
        pool.submit(async { Ok(()) }).await.unwrap();
        pool.close().await;
        assert!(pool.is_closed());
        assert_eq!(pool.completed(), 1);
        assert_eq!(
            pool.submit(async { Ok(()) }).await.unwrap_err(),
            PoolError::AlreadyClosed
        );
    }
}

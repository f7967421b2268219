//! Worker pool running long workspace operations.
//!
//! Every task inherits the [`Subject`] and the tracing span of the code that
//! submitted it, so audit logs inside the task name the right user.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};
use ws_config::{PoolConfig, PoolKind};
use ws_core::error::{Result, WsError};
use ws_core::Subject;

/// Result of a task submitted with [`TaskPool::submit`].
///
/// Dropping the handle doesn't cancel the task.
#[must_use = "a TaskHandle does nothing unless awaited"]
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A handle that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        let (tx, handle) = Self::channel();
        let _ = tx.send(result);
        handle
    }
}

impl<T: Send + 'static> TaskHandle<T> {
    /// Run `fut` on the tokio runtime outside any pool, keeping the caller's subject.
    pub fn detached<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, handle) = Self::channel();
        let subject = Subject::current();
        tokio::spawn(
            subject
                .scope(async move {
                    let _ = tx.send(fut.await);
                })
                .in_current_span(),
        );
        handle
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(WsError::server(
                "Task was cancelled before completing",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Bounded or unbounded pool of tokio tasks with graceful shutdown.
pub struct TaskPool {
    kind: PoolKind,
    permits: Option<Arc<Semaphore>>,
    tasks: Mutex<JoinSet<()>>,
    shutting_down: AtomicBool,
    shutdown_timeout: Duration,
    forced_shutdown_timeout: Duration,
}

impl TaskPool {
    pub fn new(config: &PoolConfig) -> Self {
        let permits = match config.kind {
            PoolKind::Fixed => Some(Arc::new(Semaphore::new(config.size.max(1)))),
            PoolKind::Cached => None,
        };
        Self {
            kind: config.kind,
            permits,
            tasks: Mutex::new(JoinSet::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            forced_shutdown_timeout: Duration::from_secs(config.forced_shutdown_timeout_secs),
        }
    }

    /// Override the two shutdown waits.
    pub fn with_shutdown_timeouts(mut self, graceful: Duration, forced: Duration) -> Self {
        self.shutdown_timeout = graceful;
        self.forced_shutdown_timeout = forced;
        self
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Tasks spawned and not yet reaped, including those waiting for a permit.
    pub fn active_count(&self) -> usize {
        let mut tasks = self.lock_tasks();
        reap(&mut tasks);
        tasks.len()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rejected() -> WsError {
        WsError::conflict("Task pool is shut down and doesn't accept new tasks")
    }

    /// Wrap `fut` with the caller's subject, span and a pool permit.
    fn wrap<F>(&self, fut: F) -> BoxFuture<'static, ()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        let subject = Subject::current();
        async move {
            let _permit = match permits {
                Some(permits) => match permits.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
                None => None,
            };
            subject.scope(fut).await;
        }
        .in_current_span()
        .boxed()
    }

    /// Run `fut` in the pool without waiting for its outcome.
    pub fn execute<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        if self.is_shutdown() {
            return Err(Self::rejected());
        }
        reap(&mut tasks);
        tasks.spawn(self.wrap(fut));
        Ok(())
    }

    /// Run `fut` in the pool and return a handle to its result.
    pub fn submit<F, T>(&self, fut: F) -> Result<TaskHandle<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.try_submit(fut).map_err(|_| Self::rejected())
    }

    /// Like [`submit`](Self::submit), but hands `fut` back when the pool is shut down.
    pub fn try_submit<F, T>(&self, fut: F) -> std::result::Result<TaskHandle<T>, F>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        if self.is_shutdown() {
            return Err(fut);
        }
        reap(&mut tasks);
        let (tx, handle) = TaskHandle::channel();
        tasks.spawn(self.wrap(async move {
            let _ = tx.send(fut.await);
        }));
        Ok(handle)
    }

    /// Run `fut` in the pool, or detached from it once the pool is shut down.
    ///
    /// For work that must complete regardless, such as stopping a runtime.
    pub fn submit_or_detach<F, T>(&self, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        match self.try_submit(fut) {
            Ok(handle) => handle,
            Err(fut) => {
                debug!("Task pool is shut down, running task detached");
                TaskHandle::detached(fut)
            }
        }
    }

    /// Stop accepting tasks and wait for the running ones.
    ///
    /// Waits `shutdown_timeout` for tasks to finish, then cancels the rest and
    /// waits up to `forced_shutdown_timeout` for the cancellation to land.
    pub async fn shutdown(&self) {
        let mut tasks = {
            let mut guard = self.lock_tasks();
            if self.shutting_down.swap(true, Ordering::SeqCst) {
                debug!("Task pool is already shut down");
                return;
            }
            std::mem::take(&mut *guard)
        };

        info!("Shutting down task pool ({} task(s) pending)", tasks.len());
        if timeout(self.shutdown_timeout, drain(&mut tasks)).await.is_ok() {
            info!("Task pool terminated");
            return;
        }

        warn!(
            "Task pool didn't terminate within {:?}, cancelling {} task(s)",
            self.shutdown_timeout,
            tasks.len()
        );
        tasks.abort_all();
        if timeout(self.forced_shutdown_timeout, drain(&mut tasks))
            .await
            .is_err()
        {
            error!("Couldn't terminate task pool, {} task(s) left", tasks.len());
        }
    }
}

fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Pool task panicked: {}", e);
            }
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!("Pool task panicked: {}", e);
            }
        }
    }
}

/// Counts down to zero; waiters are released when it gets there.
#[derive(Debug)]
pub struct CountDownLatch {
    count: AtomicUsize,
    zero: Notify,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: AtomicUsize::new(count),
            zero: Notify::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn count_down(&self) {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1));
        if previous == Ok(1) {
            self.zero.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fixed(size: usize) -> TaskPool {
        TaskPool::new(&PoolConfig::fixed(size))
    }

    #[tokio::test]
    async fn test_submit_returns_result() {
        let pool = fixed(2);
        let handle = pool.submit(async { Ok(21 * 2) }).unwrap();
        assert_eq!(handle.await.unwrap(), 42);

        let failing = pool
            .submit(async { Err::<(), _>(WsError::infrastructure("boom")) })
            .unwrap();
        assert_eq!(failing.await.unwrap_err().message(), "boom");
    }

    #[tokio::test]
    async fn test_subject_is_propagated() {
        let pool = fixed(1);
        let handle = Subject::new("u1", "alice")
            .scope(async { pool.submit(async { Ok(Subject::current()) }).unwrap() })
            .await;
        assert_eq!(handle.await.unwrap().user_name, "alice");
    }

    #[tokio::test]
    async fn test_fixed_pool_bounds_concurrency() {
        let pool = fixed(1);
        let started = Instant::now();
        let a = pool
            .submit(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .unwrap();
        let b = pool
            .submit(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .unwrap();
        a.await.unwrap();
        b.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_cached_pool_runs_everything_at_once() {
        let pool = TaskPool::new(&PoolConfig::cached());
        let started = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                pool.submit(async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_shutdown_waits_and_rejects_new_tasks() {
        let pool = fixed(2);
        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        pool.execute(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

        pool.shutdown().await;
        assert!(done.load(Ordering::SeqCst));
        assert!(pool.is_shutdown());
        assert!(pool.execute(async {}).unwrap_err().is_conflict());
        assert!(pool.try_submit(async { Ok(()) }).is_err());

        let detached = pool.submit_or_detach(async { Ok("still runs") });
        assert_eq!(detached.await.unwrap(), "still runs");
    }

    #[tokio::test]
    async fn test_shutdown_cancels_stuck_tasks() {
        let pool = fixed(1).with_shutdown_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        let handle = pool
            .submit(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap();

        let started = Instant::now();
        pool.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(handle.await.is_err());
    }

    #[tokio::test]
    async fn test_latch() {
        let latch = Arc::new(CountDownLatch::new(2));
        let waiter = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        latch.count_down();
        assert_eq!(latch.count(), 1);
        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 0);
        waiter.await.unwrap();
        CountDownLatch::new(0).wait().await;
    }

    #[tokio::test]
    async fn test_ready_and_detached_handles() {
        assert_eq!(TaskHandle::ready(Ok(7)).await.unwrap(), 7);
        let handle = Subject::new("u2", "bob")
            .scope(async { TaskHandle::detached(async { Ok(Subject::current().user_id) }) })
            .await;
        assert_eq!(handle.await.unwrap(), "u2");
    }
}

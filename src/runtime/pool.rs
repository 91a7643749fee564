//! Host executors.
//!
//! Plain job runners that an [`AsyncExecutor`](super::AsyncExecutor) wraps:
//! a thread per job, a fixed pool, the calling thread, and an adapter over a
//! tokio runtime.

use super::executor::{Executor, Job};
use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// Starts a new named thread for every job.
#[derive(Debug)]
pub struct ThreadPerTaskExecutor {
    name: String,
    spawned: AtomicU64,
}

impl ThreadPerTaskExecutor {
    /// Threads are named `{name}-{n}`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spawned: AtomicU64::new(0),
        }
    }
}

impl Executor for ThreadPerTaskExecutor {
    fn execute(&self, job: Job) {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let thread_name = format!("{}-{}", self.name, n);
        if let Err(e) = thread::Builder::new().name(thread_name).spawn(job) {
            error!(executor = %self.name, error = %e, "failed to spawn thread, job dropped");
        }
    }
}

/// Runs every job inline on the submitting thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, job: Job) {
        job()
    }
}

/// Submits jobs to a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    /// Wrap a runtime handle.
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Wrap the runtime the caller is running in, if any.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    name: String,
    queue: Mutex<PoolQueue>,
    available: Condvar,
}

/// A fixed set of named worker threads sharing one FIFO queue.
///
/// Dropping the pool stops it: queued jobs still run, then the workers exit.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Start `config.worker_threads` workers named `{config.name}-worker-{i}`.
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(PoolShared {
            name: config.name.clone(),
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(config.worker_threads)),
        };
        for i in 0..config.worker_threads {
            let mut builder = thread::Builder::new().name(format!("{}-worker-{}", config.name, i));
            if let Some(size) = config.thread_stack_size {
                builder = builder.stack_size(size);
            }
            let shared = pool.shared.clone();
            let handle = builder.spawn(move || worker_loop(&shared)).map_err(|e| {
                Error::Internal(format!("failed to start worker {} of {}: {}", i, config.name, e))
            })?;
            pool.workers.lock().push(handle);
        }
        debug!(pool = %config.name, workers = config.worker_threads, "thread pool started");
        Ok(pool)
    }

    /// Number of worker threads still attached.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    /// Stop accepting jobs, let the workers drain the queue, and join them.
    ///
    /// Called from one of the pool's own workers, that worker is not joined;
    /// it exits after its current job.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
        }
        self.shared.available.notify_all();

        let current = thread::current().id();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.shared.name, "worker exited with a panic");
            }
        }
        debug!(pool = %self.shared.name, "thread pool stopped");
    }
}

impl Executor for ThreadPool {
    fn execute(&self, job: Job) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            warn!(pool = %self.shared.name, "job submitted after shutdown, dropped");
            return;
        }
        queue.jobs.push_back(job);
        drop(queue);
        self.shared.available.notify_one();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(pool = %shared.name, "job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_thread_per_task_names_threads() {
        let executor = ThreadPerTaskExecutor::new("tpt");
        let (tx, rx) = mpsc::channel();
        for _ in 0..2 {
            let tx = tx.clone();
            executor.execute(Box::new(move || {
                let _ = tx.send(thread::current().name().map(str::to_string));
            }));
        }
        let mut names: Vec<_> = (0..2).map(|_| rx.recv().unwrap().unwrap()).collect();
        names.sort();
        assert_eq!(names, vec!["tpt-0", "tpt-1"]);
    }

    #[test]
    fn test_pool_runs_and_drains_on_shutdown() {
        let config = ExecutorConfig::new("drain").with_worker_threads(2);
        let pool = ThreadPool::new(&config).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            pool.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(pool.worker_count(), 0);

        // Rejected after shutdown.
        let c = counter.clone();
        pool.execute(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(pool.queued(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let config = ExecutorConfig::new("panic").with_worker_threads(1);
        let pool = ThreadPool::new(&config).unwrap();
        pool.execute(Box::new(|| panic!("job")));
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            let _ = tx.send(1);
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tokio_executor() {
        let executor = TokioExecutor::current().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        executor.execute(Box::new(move || {
            let _ = tx.send(5);
        }));
        assert_eq!(rx.await.unwrap(), 5);
    }
}

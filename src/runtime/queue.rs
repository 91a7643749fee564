//! AsyncQueue: per-key serialized execution.
//!
//! Tasks submitted under the same key run one at a time in submission order;
//! different keys run independently. The presence of a key in the map means a
//! task for that key is in flight, and its deque holds the tasks waiting
//! behind it. The key is removed as soon as its deque drains.

use super::async_value::{Async, AsyncResult};
use super::context::ExecContext;
use super::executor::Job;
use crate::metrics::QueueMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{trace, warn};

// Jobs are `Send` but not `Sync`; the mutex only makes the map shareable.
type Waiting = VecDeque<Mutex<Job>>;

struct QueueInner<K> {
    queues: DashMap<K, Waiting>,
    metrics: QueueMetrics,
}

/// Serializes asynchronous tasks per key.
///
/// ```rust,ignore
/// let queue = AsyncQueue::new();
/// let a = queue.exec("account-1", || async { debit().await });
/// let b = queue.exec("account-1", || async { credit().await }); // starts after `a` settles
/// ```
pub struct AsyncQueue<K> {
    inner: Arc<QueueInner<K>>,
}

impl<K> Clone for AsyncQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for AsyncQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> fmt::Debug for AsyncQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("active_keys", &self.inner.queues.len())
            .finish()
    }
}

impl<K> AsyncQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queues: DashMap::new(),
                metrics: QueueMetrics::default(),
            }),
        }
    }

    /// Run `task` after every task previously submitted under `key` has
    /// settled.
    ///
    /// The caller's execution context is captured now and restored when the
    /// task starts and when its result is delivered. A failing task only
    /// rejects its own value; the next task still runs.
    pub fn exec<T, F, Fut>(&self, key: K, task: F) -> Async<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        self.inner.metrics.submitted.inc();
        let context = ExecContext::current();
        let (result, promise) = Async::pending();

        let inner = self.inner.clone();
        let entry_key = key.clone();
        let start: Job = Box::new(move || {
            let running = context
                .clone()
                .enter(|| Async::coroutine(async move { task().await }));
            running.when_complete(move |outcome| {
                if outcome.is_ok() {
                    inner.metrics.completed.inc();
                } else {
                    inner.metrics.failed.inc();
                }
                let outcome = outcome.clone();
                context.enter(|| promise.complete(outcome));
                QueueInner::advance(&inner, &entry_key);
            });
        });

        let run_now = match self.inner.queues.entry(key) {
            Entry::Occupied(mut waiting) => {
                waiting.get_mut().push_back(Mutex::new(start));
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                self.inner.metrics.active_keys.inc();
                Some(start)
            }
        };
        // The shard lock is released before the task runs. A free key starts
        // now, even from inside another queue task on this thread.
        if let Some(start) = run_now {
            start();
        }
        result
    }

    /// Number of keys with a task in flight.
    pub fn len(&self) -> usize {
        self.inner.queues.len()
    }

    /// True if no key has a task in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.queues.is_empty()
    }

    /// Tasks waiting behind the one in flight for `key`.
    pub fn pending(&self, key: &K) -> usize {
        self.inner.queues.get(key).map(|q| q.len()).unwrap_or(0)
    }

    /// Counters for this queue.
    pub fn metrics(&self) -> &QueueMetrics {
        &self.inner.metrics
    }
}

impl<K: Eq + Hash + Clone> QueueInner<K> {
    fn advance(self: &Arc<Self>, key: &K) {
        let next = match self.queues.entry(key.clone()) {
            Entry::Occupied(mut waiting) => match waiting.get_mut().pop_front() {
                Some(job) => Some(job.into_inner()),
                None => {
                    waiting.remove();
                    self.metrics.active_keys.dec();
                    None
                }
            },
            Entry::Vacant(_) => None,
        };
        match next {
            Some(job) => trampoline(job),
            None => trace!("queue drained"),
        }
    }
}

thread_local! {
    static TRAMPOLINE: RefCell<Option<VecDeque<Job>>> = const { RefCell::new(None) };
}

/// Run `job`, deferring nested advances on this thread until the outermost
/// call returns, so chains of synchronously completing tasks run in a loop
/// instead of recursing.
fn trampoline(job: Job) {
    let nested = TRAMPOLINE.with(|slot| match slot.borrow_mut().as_mut() {
        Some(deferred) => {
            deferred.push_back(job);
            None
        }
        None => Some(job),
    });
    let Some(job) = nested else {
        return;
    };

    TRAMPOLINE.with(|slot| *slot.borrow_mut() = Some(VecDeque::new()));
    let _reset = ResetTrampoline;
    job();
    while let Some(next) =
        TRAMPOLINE.with(|slot| slot.borrow_mut().as_mut().and_then(|d| d.pop_front()))
    {
        next();
    }
}

struct ResetTrampoline;

impl Drop for ResetTrampoline {
    fn drop(&mut self) {
        let leftover = TRAMPOLINE.try_with(|slot| slot.borrow_mut().take()).ok().flatten();
        match leftover {
            Some(leftover) if !leftover.is_empty() => {
                // Only reachable when a job unwound.
                warn!(dropped = leftover.len(), "queued tasks dropped after a panic");
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AsyncError;
    use crate::runtime::executor::AsyncExecutor;
    use crate::runtime::local::AsyncLocal;
    use std::time::Duration;

    #[test]
    fn test_same_key_runs_in_order() {
        let queue = AsyncQueue::new();
        let gates: Vec<_> = (0..3).map(|_| Async::<u32>::pending()).collect();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut promises = Vec::new();
        let mut results = Vec::new();
        for (i, (gate, promise)) in gates.into_iter().enumerate() {
            promises.push(promise);
            let log = log.clone();
            results.push(queue.exec("k", move || async move {
                log.lock().push(format!("start {}", i));
                let v = gate.await?;
                log.lock().push(format!("end {}", i));
                Ok(v)
            }));
        }

        assert_eq!(*log.lock(), vec!["start 0"]);
        assert_eq!(queue.pending(&"k"), 2);

        for (i, promise) in promises.into_iter().enumerate() {
            promise.fulfill(i as u32);
        }
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.join().unwrap(), i as u32);
        }
        assert_eq!(
            *log.lock(),
            vec!["start 0", "end 0", "start 1", "end 1", "start 2", "end 2"]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_queue() {
        let queue = AsyncQueue::new();
        let first: Async<u32> = queue.exec(1u64, || async { Err(AsyncError::new("first")) });
        let second = queue.exec(1u64, || async { Ok(2u32) });
        assert_eq!(first.join().unwrap_err().message(), "first");
        assert_eq!(second.join().unwrap(), 2);
        assert_eq!(queue.metrics().failed.get(), 1);
        assert_eq!(queue.metrics().completed.get(), 1);
    }

    #[test]
    fn test_long_synchronous_chain() {
        let queue = AsyncQueue::new();
        let (gate, promise) = Async::<()>::pending();
        queue.exec("chain", move || async move { gate.await });
        let last = (0..10_000u32)
            .map(|i| queue.exec("chain", move || async move { Ok(i) }))
            .last()
            .unwrap();
        promise.fulfill(());
        assert_eq!(last.join().unwrap(), 9_999);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_different_keys_independent() {
        let queue = AsyncQueue::new();
        let (gate, _promise) = Async::<u32>::pending();
        let blocked = queue.exec("a", move || async move { gate.await });
        let free = queue.exec("b", || async { Ok(1u32) });
        assert_eq!(free.join().unwrap(), 1);
        assert!(!blocked.is_done());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_free_key_starts_inside_another_task() {
        let queue = AsyncQueue::new();
        let (gate, promise) = Async::<()>::pending();
        queue.exec("outer", move || async move { gate.await });

        // Started by the first task's completion, inside the advance loop.
        let q = queue.clone();
        let outer = queue.exec("outer", move || async move {
            let inner = q.exec("inner", || async { Ok(1u32) });
            let started_now = inner.is_done();
            Ok((started_now, inner.join_timeout(Duration::from_secs(2))?))
        });
        promise.fulfill(());

        assert_eq!(outer.join().unwrap(), (true, 1));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_debug_reports_active_keys() {
        let queue = AsyncQueue::new();
        let (gate, _promise) = Async::<()>::pending();
        queue.exec(7u64, move || async move { gate.await });
        assert_eq!(format!("{:?}", queue), "AsyncQueue { active_keys: 1 }");
    }

    #[test]
    fn test_task_sees_submitter_locals() {
        let local = AsyncLocal::new("submitter");
        let queue = AsyncQueue::new();
        let executor = AsyncExecutor::thread_per_task("queue-locals");
        let (gate, promise) = Async::<()>::pending();
        queue.exec("k", move || async move { gate.await });

        let l = local.clone();
        let seen = local
            .exec(5u32, || {
                queue.exec("k", move || async move {
                    AsyncExecutor::sleep(Duration::from_millis(5)).await?;
                    Ok(l.get())
                })
            })
            .unwrap();

        // Released from another executor's thread, with no locals bound.
        executor.execute(move || promise.fulfill(()));
        assert_eq!(seen.join().unwrap(), Some(5));
    }
}

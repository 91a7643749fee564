//! AsyncExecutor: executor identity, relay, yield, sleep and timeouts.

use super::async_value::{Async, AsyncResult, Promise};
use super::context::ExecContext;
use super::pool::{ThreadPerTaskExecutor, ThreadPool};
use super::task::Task;
use super::timer::Timer;
use crate::config::ExecutorConfig;
use crate::error::{AsyncError, Result};
use crate::metrics::ExecutorMetrics;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

/// A unit of work handed to an [`Executor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The host's "submit a unit of work" primitive.
pub trait Executor: Send + Sync + 'static {
    /// Run `job` at some point, on some thread.
    fn execute(&self, job: Job);
}

impl<F> Executor for F
where
    F: Fn(Job) + Send + Sync + 'static,
{
    fn execute(&self, job: Job) {
        self(job)
    }
}

static NEXT_EXECUTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Runs timer completions when no executor is current, keeping user
/// continuations off the timer thread.
fn wakeup_executor() -> &'static ThreadPerTaskExecutor {
    static WAKEUPS: OnceLock<ThreadPerTaskExecutor> = OnceLock::new();
    WAKEUPS.get_or_init(|| ThreadPerTaskExecutor::new("strand-wakeup"))
}

struct Inner {
    id: u64,
    name: String,
    executor: Arc<dyn Executor>,
    allow_blocking_join: bool,
    timer: Option<Timer>,
    metrics: ExecutorMetrics,
}

/// A logical executor that coroutines have affinity to.
///
/// Work started with [`exec`](Self::exec) sees this executor as
/// [`AsyncExecutor::get`] on every poll, and every resumption after a
/// suspension is submitted back to it. Thread affinity is a property of the
/// executor, not of a thread.
#[derive(Clone)]
pub struct AsyncExecutor {
    inner: Arc<Inner>,
}

impl AsyncExecutor {
    /// Wrap `executor` with default settings.
    pub fn new(name: impl Into<String>, executor: impl Executor) -> Self {
        Self::builder(executor).name(name).build()
    }

    /// Start building an executor around `executor`.
    pub fn builder(executor: impl Executor) -> AsyncExecutorBuilder {
        AsyncExecutorBuilder {
            name: "strand".to_string(),
            executor: Arc::new(executor),
            allow_blocking_join: true,
            timer: None,
        }
    }

    /// Wrap `executor` using the name and join policy from `config`.
    pub fn with_config(config: &ExecutorConfig, executor: impl Executor) -> Result<Self> {
        config.validate()?;
        Ok(Self::builder(executor)
            .name(config.name.clone())
            .allow_blocking_join(config.allow_blocking_join)
            .build())
    }

    /// An executor backed by its own fixed [`ThreadPool`].
    pub fn thread_pool(config: &ExecutorConfig) -> Result<Self> {
        let pool = ThreadPool::new(config)?;
        Self::with_config(config, pool)
    }

    /// An executor that starts a new thread for every job.
    pub fn thread_per_task(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), ThreadPerTaskExecutor::new(name))
    }

    /// The executor of the running coroutine, if any.
    pub fn get() -> Option<AsyncExecutor> {
        ExecContext::current().executor
    }

    /// Unique id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether `Async::join` may block threads of this executor.
    pub fn allows_blocking_join(&self) -> bool {
        self.inner.allow_blocking_join
    }

    /// Counters for this executor.
    pub fn metrics(&self) -> &ExecutorMetrics {
        &self.inner.metrics
    }

    pub(crate) fn submit(&self, job: Job) {
        self.inner.metrics.jobs_submitted.inc();
        self.inner.executor.execute(job);
    }

    /// Run `f` on this executor with `context` installed.
    pub(crate) fn execute_in(&self, context: ExecContext, f: impl FnOnce() + Send + 'static) {
        let context = context.with_executor(self.clone());
        self.submit(Box::new(move || context.enter(f)));
    }

    /// Run a coroutine on this executor.
    ///
    /// `body` is called on the executor, under the caller's AsyncLocal
    /// bindings, and the returned future is polled there on every
    /// resumption.
    pub fn exec<T, F, Fut>(&self, body: F) -> Async<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        let context = ExecContext::current().with_executor(self.clone());
        let (task, value) = Task::spawn(async move { body().await }, context);
        task.dispatch();
        value
    }

    /// Run a synchronous closure on this executor under the caller's
    /// AsyncLocal bindings.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        self.execute_in(ExecContext::current(), f);
    }

    /// A value that settles like `value` but on the current executor.
    ///
    /// Callbacks registered on the result run on the caller's executor
    /// rather than on whatever thread completed `value`. Outside an executor,
    /// or when `value` is already settled, returns `value` itself.
    pub fn relay<T>(value: Async<T>) -> Async<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let Some(executor) = Self::get() else {
            return value;
        };
        if value.is_done() {
            return value;
        }
        let context = ExecContext::current();
        let (relayed, promise) = Async::pending();
        value.when_complete(move |result| {
            let result = result.clone();
            executor.execute_in(context, move || promise.complete(result));
        });
        relayed
    }

    /// [`exec`](Self::exec) on this executor, relayed back to the caller's.
    pub fn exec_and_relay<T, F, Fut>(&self, body: F) -> Async<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        Self::relay(self.exec(body))
    }

    /// Give up the thread: the awaiting coroutine continues from a fresh job
    /// on the current executor. Outside an executor this is already settled.
    pub fn yield_now() -> Async<()> {
        match Self::get() {
            Some(executor) => {
                let (value, promise) = Async::pending();
                executor.execute(move || promise.fulfill(()));
                value
            }
            None => Async::result(()),
        }
    }

    /// Settle after `duration` without blocking a thread.
    pub fn sleep(duration: Duration) -> Async<()> {
        if duration.is_zero() {
            return Self::yield_now();
        }
        let executor = Self::get();
        let Some(timer) = Self::timer_for(executor.as_ref()) else {
            return Async::rejected(AsyncError::illegal_state("timer thread is unavailable"));
        };
        let (value, promise) = Async::pending();
        let context = ExecContext::current();
        timer.schedule(duration, move || {
            Self::complete_off_timer(executor, context, move || promise.fulfill(()))
        });
        value
    }

    /// Settle like `value`, or with a `Timeout` error if `value` is still
    /// pending after `duration`. `value` itself keeps running.
    pub fn timeout<T>(value: Async<T>, duration: Duration) -> Async<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if value.is_done() {
            return value;
        }
        let executor = Self::get();
        let Some(timer) = Self::timer_for(executor.as_ref()) else {
            return Async::rejected(AsyncError::illegal_state("timer thread is unavailable"));
        };
        let context = ExecContext::current();
        let (out, promise) = Async::pending();
        let slot: Arc<Mutex<Option<Promise<T>>>> = Arc::new(Mutex::new(Some(promise)));

        let expired = slot.clone();
        let key = timer.schedule(duration, move || {
            if let Some(promise) = expired.lock().take() {
                debug!(?duration, "async value timed out");
                let error = AsyncError::timeout(format!("no result within {:?}", duration));
                Self::complete_off_timer(executor, context, move || promise.reject(error));
            }
        });
        value.when_complete(move |result| {
            timer.cancel(key);
            if let Some(promise) = slot.lock().take() {
                promise.complete(result.clone());
            }
        });
        out
    }

    /// Hand a timer completion to `executor`, or to the wakeup threads when
    /// there is none.
    fn complete_off_timer(
        executor: Option<AsyncExecutor>,
        context: ExecContext,
        f: impl FnOnce() + Send + 'static,
    ) {
        match executor {
            Some(executor) => executor.execute_in(context, f),
            None => wakeup_executor().execute(Box::new(move || context.enter(f))),
        }
    }

    fn timer_for(executor: Option<&AsyncExecutor>) -> Option<Timer> {
        executor
            .and_then(|e| e.inner.timer.clone())
            .or_else(Timer::global)
    }
}

impl PartialEq for AsyncExecutor {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for AsyncExecutor {}

impl fmt::Debug for AsyncExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncExecutor")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("allow_blocking_join", &self.inner.allow_blocking_join)
            .finish()
    }
}

/// Builder for [`AsyncExecutor`].
pub struct AsyncExecutorBuilder {
    name: String,
    executor: Arc<dyn Executor>,
    allow_blocking_join: bool,
    timer: Option<Timer>,
}

impl AsyncExecutorBuilder {
    /// Set the name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Allow or forbid blocking joins from this executor's threads.
    pub fn allow_blocking_join(mut self, allow: bool) -> Self {
        self.allow_blocking_join = allow;
        self
    }

    /// Use a dedicated timer instead of the shared one.
    pub fn timer(mut self, timer: Timer) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Finish.
    pub fn build(self) -> AsyncExecutor {
        let id = NEXT_EXECUTOR_ID.fetch_add(1, Ordering::Relaxed);
        debug!(id, name = %self.name, allow_blocking_join = self.allow_blocking_join, "created executor");
        if self.name.is_empty() {
            warn!(id, "executor created without a name");
        }
        AsyncExecutor {
            inner: Arc::new(Inner {
                id,
                name: self.name,
                executor: self.executor,
                allow_blocking_join: self.allow_blocking_join,
                timer: self.timer,
                metrics: ExecutorMetrics::default(),
            }),
        }
    }
}

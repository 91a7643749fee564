//! Coroutine driver.
//!
//! A [`Task`] owns one coroutine (a boxed future) and its execution context.
//! Waking the task submits a poll to the context's executor, or polls inline
//! on the waking thread when there is no executor. The task state machine
//! guarantees a coroutine is never polled concurrently with itself and that
//! wake-ups arriving during a poll collapse into a single re-poll.

use super::async_value::{Async, AsyncResult};
use super::context::ExecContext;
use crate::error::AsyncError;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use tracing::trace;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    /// Suspended, waiting for a wake-up.
    Idle,
    /// A poll has been submitted.
    Scheduled,
    /// Being polled.
    Running,
    /// Woken while being polled.
    Notified,
    Complete,
}

pub(crate) struct Task {
    state: Mutex<TaskState>,
    future: Mutex<Option<BoxFuture>>,
    context: ExecContext,
}

impl Task {
    /// Create a task for `future`, returning it in the `Scheduled` state
    /// together with the value it settles.
    pub(crate) fn spawn<T, F>(future: F, context: ExecContext) -> (Arc<Task>, Async<T>)
    where
        T: Send + Sync + 'static,
        F: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        let (value, promise) = Async::pending();
        let guarded = Guarded {
            inner: Box::pin(future),
        };
        let task = Arc::new(Task {
            state: Mutex::new(TaskState::Scheduled),
            future: Mutex::new(Some(Box::pin(async move {
                promise.complete(guarded.await);
            }))),
            context,
        });
        if let Some(executor) = &task.context.executor {
            executor.metrics().tasks_spawned.inc();
        }
        (task, value)
    }

    /// Submit the first poll to the task's executor.
    pub(crate) fn dispatch(self: Arc<Self>) {
        match self.context.executor.clone() {
            Some(executor) => executor.submit(Box::new(move || self.run())),
            None => self.run(),
        }
    }

    fn schedule(self: Arc<Self>) {
        let mut state = self.state.lock();
        match *state {
            TaskState::Idle => {
                *state = TaskState::Scheduled;
                drop(state);
                if let Some(executor) = &self.context.executor {
                    executor.metrics().wakeups.inc();
                }
                self.dispatch();
            }
            TaskState::Running => *state = TaskState::Notified,
            TaskState::Scheduled | TaskState::Notified | TaskState::Complete => {}
        }
    }

    /// Poll the coroutine until it suspends or completes.
    pub(crate) fn run(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Scheduled {
                return;
            }
            *state = TaskState::Running;
        }

        let waker = Waker::from(self.clone());
        let mut cx = Context::from_waker(&waker);
        loop {
            if let Some(executor) = &self.context.executor {
                executor.metrics().polls.inc();
            }
            let ready = {
                let mut slot = self.future.lock();
                match slot.as_mut() {
                    Some(future) => {
                        let poll = self
                            .context
                            .clone()
                            .enter(|| future.as_mut().poll(&mut cx));
                        if poll.is_ready() {
                            *slot = None;
                        }
                        poll.is_ready()
                    }
                    None => true,
                }
            };

            let mut state = self.state.lock();
            if ready {
                *state = TaskState::Complete;
                if let Some(executor) = &self.context.executor {
                    executor.metrics().tasks_completed.inc();
                }
                trace!("coroutine complete");
                return;
            }
            match *state {
                TaskState::Running => {
                    *state = TaskState::Idle;
                    return;
                }
                TaskState::Notified if self.context.executor.is_some() => {
                    *state = TaskState::Scheduled;
                    drop(state);
                    self.dispatch();
                    return;
                }
                TaskState::Notified => *state = TaskState::Running,
                other => {
                    trace!(state = ?other, "unexpected task state after poll");
                    return;
                }
            }
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.clone().schedule();
    }
}

/// Converts a panic inside the coroutine into a rejection.
struct Guarded<F> {
    inner: Pin<Box<F>>,
}

impl<T, F> Future for Guarded<F>
where
    F: Future<Output = AsyncResult<T>>,
{
    type Output = AsyncResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = &mut self.inner;
        match catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => {
                if let Some(executor) = ExecContext::current().executor {
                    executor.metrics().tasks_panicked.inc();
                }
                Poll::Ready(Err(AsyncError::panic(payload)))
            }
        }
    }
}

impl<T: Send + Sync + 'static> Async<T> {
    /// Start a coroutine.
    ///
    /// The first poll runs inline on the calling thread, under the caller's
    /// context. If the coroutine completes without suspending, the returned
    /// value is already settled. Otherwise it resumes on the current
    /// executor, or inline on the waking thread when there is none.
    pub fn coroutine<F>(future: F) -> Async<T>
    where
        F: Future<Output = AsyncResult<T>> + Send + 'static,
    {
        let (task, value) = Task::spawn(future, ExecContext::current());
        task.run();
        value
    }
}

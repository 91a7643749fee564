//! The `Async<T>` value: a single-assignment result cell with continuations.

use super::context::ExecContext;
use crate::error::AsyncError;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::error;

/// Outcome of an [`Async`].
pub type AsyncResult<T> = Result<T, AsyncError>;

type Callback<T> = Box<dyn FnOnce(&AsyncResult<T>) + Send + 'static>;

enum Continuation<T> {
    Callback(Callback<T>),
    Waker(Waker),
}

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Settled(Arc<AsyncResult<T>>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
}

impl<T> Shared<T> {
    fn new(state: State<T>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            settled: Condvar::new(),
        })
    }

    /// Settle the cell. Continuations run after the lock is released, in
    /// registration order. Returns false if the cell was already settled.
    fn settle(&self, result: AsyncResult<T>) -> bool {
        let result = Arc::new(result);
        let continuations = {
            let mut state = self.state.lock();
            let State::Pending(continuations) = &mut *state else {
                return false;
            };
            let continuations = std::mem::take(continuations);
            *state = State::Settled(result.clone());
            continuations
        };
        self.settled.notify_all();

        for continuation in continuations {
            match continuation {
                Continuation::Waker(waker) => waker.wake(),
                Continuation::Callback(callback) => {
                    if catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err() {
                        error!("completion callback panicked");
                    }
                }
            }
        }
        true
    }

    fn settled(&self) -> Option<Arc<AsyncResult<T>>> {
        match &*self.state.lock() {
            State::Settled(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }
}

/// A value of type `T` that becomes available at most once, either as a
/// value or as an [`AsyncError`].
///
/// `Async` is a handle: clones observe the same cell. Awaiting it inside a
/// coroutine yields `Result<T, AsyncError>`; awaiting an already settled
/// value completes on the first poll without rescheduling.
pub struct Async<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Async<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Async<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.lock() {
            State::Pending(_) => "pending",
            State::Settled(result) if result.is_ok() => "fulfilled",
            State::Settled(_) => "rejected",
        };
        f.debug_struct("Async").field("state", &state).finish()
    }
}

impl<T: Send + Sync + 'static> Async<T> {
    /// An unsettled value and the promise that settles it.
    pub fn pending() -> (Async<T>, Promise<T>) {
        let shared = Shared::new(State::Pending(Vec::new()));
        (
            Async {
                shared: shared.clone(),
            },
            Promise {
                shared: Some(shared),
            },
        )
    }

    /// An already fulfilled value.
    pub fn result(value: T) -> Self {
        Self::settled(Ok(value))
    }

    /// An already rejected value.
    pub fn rejected(error: impl Into<AsyncError>) -> Self {
        Self::settled(Err(error.into()))
    }

    fn settled(result: AsyncResult<T>) -> Self {
        Self {
            shared: Shared::new(State::Settled(Arc::new(result))),
        }
    }

    /// Run `f` now and capture its outcome. A panic becomes a rejection.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() -> AsyncResult<T>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Self::settled(result),
            Err(payload) => Self::rejected(AsyncError::panic(payload)),
        }
    }

    /// True once settled.
    pub fn is_done(&self) -> bool {
        self.shared.settled().is_some()
    }

    /// True if settled with a value.
    pub fn is_fulfilled(&self) -> bool {
        self.shared.settled().is_some_and(|r| r.is_ok())
    }

    /// True if settled with an error.
    pub fn is_rejected(&self) -> bool {
        self.shared.settled().is_some_and(|r| r.is_err())
    }

    /// Register a callback for settlement.
    ///
    /// Callbacks run exactly once, in registration order, on the thread that
    /// settles the value; if it is already settled the callback runs now.
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce(&AsyncResult<T>) + Send + 'static,
    {
        let result = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending(continuations) => {
                    continuations.push(Continuation::Callback(Box::new(callback)));
                    return;
                }
                State::Settled(result) => result.clone(),
            }
        };
        callback(&result);
    }

    /// Transform the value once it is available.
    pub fn map<U, F>(&self, f: F) -> Async<U>
    where
        U: Send + Sync + 'static,
        T: Clone,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.chain(move |result| result.clone().map(f))
    }

    /// Turn a rejection into a value.
    pub fn recover<F>(&self, f: F) -> Async<T>
    where
        T: Clone,
        F: FnOnce(AsyncError) -> T + Send + 'static,
    {
        self.chain(move |result| Ok(result.clone().unwrap_or_else(f)))
    }

    fn chain<U, F>(&self, f: F) -> Async<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&AsyncResult<T>) -> AsyncResult<U> + Send + 'static,
    {
        if let Some(result) = self.shared.settled() {
            return Async::from_fn(|| f(&result));
        }
        let (out, promise) = Async::pending();
        self.when_complete(move |result| {
            let mapped = match catch_unwind(AssertUnwindSafe(|| f(result))) {
                Ok(mapped) => mapped,
                Err(payload) => Err(AsyncError::panic(payload)),
            };
            promise.complete(mapped);
        });
        out
    }
}

impl<T: Clone + Send + Sync + 'static> Async<T> {
    /// The outcome, if already settled.
    pub fn try_result(&self) -> Option<AsyncResult<T>> {
        self.shared.settled().map(|result| (*result).clone())
    }

    /// Block the calling thread until the value settles.
    ///
    /// Fails with `UnsupportedOperation` when called from an executor that
    /// forbids blocking joins.
    pub fn join(&self) -> AsyncResult<T> {
        check_blocking_allowed()?;
        let mut state = self.shared.state.lock();
        loop {
            if let State::Settled(result) = &*state {
                return (**result).clone();
            }
            self.shared.settled.wait(&mut state);
        }
    }

    /// Like [`join`](Self::join) with a deadline. Times out with a `Timeout`
    /// error; the value itself is left untouched.
    pub fn join_timeout(&self, timeout: Duration) -> AsyncResult<T> {
        check_blocking_allowed()?;
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if let State::Settled(result) = &*state {
                return (**result).clone();
            }
            if self
                .shared
                .settled
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                if let State::Settled(result) = &*state {
                    return (**result).clone();
                }
                return Err(AsyncError::timeout(format!(
                    "join timed out after {:?}",
                    timeout
                )));
            }
        }
    }
}

fn check_blocking_allowed() -> Result<(), AsyncError> {
    match ExecContext::current().executor {
        Some(executor) if !executor.allows_blocking_join() => Err(AsyncError::unsupported(
            format!(
                "blocking join is not allowed on executor '{}'",
                executor.name()
            ),
        )),
        _ => Ok(()),
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Async<T> {
    type Output = AsyncResult<T>;
    type IntoFuture = AwaitAsync<T>;

    #[track_caller]
    fn into_future(self) -> AwaitAsync<T> {
        AwaitAsync {
            shared: self.shared,
            slot: None,
            location: Location::caller(),
        }
    }
}

/// Future returned by `.await` on an [`Async`].
///
/// A rejection is returned with the await site appended to its step trace.
pub struct AwaitAsync<T> {
    shared: Arc<Shared<T>>,
    slot: Option<usize>,
    location: &'static Location<'static>,
}

impl<T> Unpin for AwaitAsync<T> {}

impl<T: Clone> Future for AwaitAsync<T> {
    type Output = AsyncResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut state = this.shared.state.lock();
        match &mut *state {
            State::Settled(result) => Poll::Ready(match &**result {
                Ok(value) => Ok(value.clone()),
                Err(error) => Err(error.clone().with_step(this.location)),
            }),
            State::Pending(continuations) => {
                if let Some(Continuation::Waker(waker)) =
                    this.slot.and_then(|i| continuations.get_mut(i))
                {
                    if !waker.will_wake(cx.waker()) {
                        *waker = cx.waker().clone();
                    }
                    return Poll::Pending;
                }
                this.slot = Some(continuations.len());
                continuations.push(Continuation::Waker(cx.waker().clone()));
                Poll::Pending
            }
        }
    }
}

/// The write side of a pending [`Async`].
///
/// Dropping a promise without settling it rejects the value with a
/// `Cancelled` error.
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Promise<T> {
    /// Settle with `result`.
    pub fn complete(mut self, result: AsyncResult<T>) {
        if let Some(shared) = self.shared.take() {
            shared.settle(result);
        }
    }

    /// Settle with a value.
    pub fn fulfill(self, value: T) {
        self.complete(Ok(value));
    }

    /// Settle with an error.
    pub fn reject(self, error: impl Into<AsyncError>) {
        self.complete(Err(error.into()));
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.settle(Err(AsyncError::cancelled(
                "promise dropped without a result",
            )));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_result_and_rejected() {
        let ok = Async::result(5u32);
        assert!(ok.is_fulfilled());
        assert_eq!(ok.try_result().unwrap().unwrap(), 5);

        let err: Async<u32> = Async::rejected(AsyncError::new("x"));
        assert!(err.is_rejected());
        assert_eq!(err.join().unwrap_err().message(), "x");
    }

    #[test]
    fn test_from_fn_captures_panic() {
        let value: Async<u32> = Async::from_fn(|| panic!("bad input"));
        let err = value.try_result().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Panic);
        assert_eq!(err.message(), "bad input");
    }

    #[test]
    fn test_callbacks_fire_once_in_order() {
        let (value, promise) = Async::<u32>::pending();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            value.when_complete(move |_| order.lock().push(i));
        }
        promise.fulfill(1);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);

        // Registered after settlement: runs immediately.
        let late = Arc::new(AtomicUsize::new(0));
        let l = late.clone();
        value.when_complete(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_promise_cancels() {
        let (value, promise) = Async::<u32>::pending();
        drop(promise);
        assert_eq!(value.join().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_join_across_threads() {
        let (value, promise) = Async::pending();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            promise.fulfill("done".to_string());
        });
        assert_eq!(value.join().unwrap(), "done");
        handle.join().unwrap();
    }

    #[test]
    fn test_join_timeout() {
        let (value, _promise) = Async::<u32>::pending();
        let err = value.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_timeout());
        assert!(!value.is_done());
    }

    #[test]
    fn test_map_and_recover() {
        let (value, promise) = Async::pending();
        let doubled = value.map(|v: u32| v * 2);
        promise.fulfill(21);
        assert_eq!(doubled.join().unwrap(), 42);

        let failed: Async<u32> = Async::rejected(AsyncError::new("x"));
        assert_eq!(failed.recover(|e| e.message().len() as u32).join().unwrap(), 1);
    }

    #[test]
    fn test_callback_panic_does_not_stop_others() {
        let (value, promise) = Async::<u32>::pending();
        let hits = Arc::new(AtomicUsize::new(0));
        value.when_complete(|_| panic!("callback"));
        let h = hits.clone();
        value.when_complete(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        promise.fulfill(0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

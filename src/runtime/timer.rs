//! Timer thread for `sleep` and timeouts.
//!
//! A min-heap of `(deadline, generation)` entries is drained by one
//! dedicated thread. Callbacks run on that thread and must be short; the
//! runtime only uses them to hand work back to an executor.

use super::executor::Job;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct TimerEntry {
    deadline: Instant,
    generation: u64,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Handle to a scheduled callback, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    callbacks: HashMap<u64, Job>,
    next_generation: u64,
    shutdown: bool,
}

impl TimerState {
    fn pop_expired(&mut self, now: Instant) -> Vec<Job> {
        let mut expired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let generation = entry.generation;
            self.heap.pop();
            // Cancelled entries have no callback left.
            if let Some(callback) = self.callbacks.remove(&generation) {
                expired.push(callback);
            }
        }
        expired
    }
}

struct Shared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

struct Owner {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.changed.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// A timer backed by its own thread. Clones share the thread, which stops
/// when the last clone is dropped.
#[derive(Clone)]
pub struct Timer {
    owner: Arc<Owner>,
}

impl Timer {
    /// Start a timer thread called `name`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            changed: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run(&worker))
            .map_err(|e| Error::Internal(format!("failed to start timer thread {}: {}", name, e)))?;
        debug!(%name, "timer thread started");
        Ok(Self {
            owner: Arc::new(Owner {
                shared,
                thread: Mutex::new(Some(handle)),
            }),
        })
    }

    /// The process-wide timer, started on first use.
    pub fn global() -> Option<Timer> {
        static GLOBAL: OnceLock<Option<Timer>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| match Timer::new("strand-timer") {
                Ok(timer) => Some(timer),
                Err(e) => {
                    error!(error = %e, "global timer unavailable");
                    None
                }
            })
            .clone()
    }

    /// Run `callback` on the timer thread after `delay`.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerKey {
        let shared = &self.owner.shared;
        let mut state = shared.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        state.heap.push(TimerEntry {
            deadline: Instant::now() + delay,
            generation,
        });
        state.callbacks.insert(generation, Box::new(callback));
        drop(state);
        shared.changed.notify_one();
        TimerKey(generation)
    }

    /// Cancel a callback that has not fired yet. Returns false if it already
    /// fired or was cancelled.
    pub fn cancel(&self, key: TimerKey) -> bool {
        self.owner.shared.state.lock().callbacks.remove(&key.0).is_some()
    }

    /// Number of callbacks waiting to fire.
    pub fn pending(&self) -> usize {
        self.owner.shared.state.lock().callbacks.len()
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            let dropped = state.callbacks.len();
            if dropped > 0 {
                warn!(dropped, "timer stopped with pending callbacks");
            }
            return;
        }

        let expired = state.pop_expired(Instant::now());
        if !expired.is_empty() {
            MutexGuard::unlocked(&mut state, || fire(expired));
            continue;
        }

        match state.heap.peek().map(|entry| entry.deadline) {
            Some(deadline) => {
                shared.changed.wait_until(&mut state, deadline);
            }
            None => shared.changed.wait(&mut state),
        }
    }
}

fn fire(callbacks: Vec<Job>) {
    for callback in callbacks {
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            error!("timer callback panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_fires_in_deadline_order() {
        let timer = Timer::new("timer-order").unwrap();
        let (tx, rx) = mpsc::channel();
        for (i, delay) in [30u64, 10, 20].into_iter().enumerate() {
            let tx = tx.clone();
            timer.schedule(Duration::from_millis(delay), move || {
                let _ = tx.send(i);
            });
        }
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn test_cancel() {
        let timer = Timer::new("timer-cancel").unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let key = timer.schedule(Duration::from_millis(20), move || {
            let _ = tx.send(());
        });
        assert_eq!(timer.pending(), 1);
        assert!(timer.cancel(key));
        assert!(!timer.cancel(key));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_panicking_callback_keeps_timer_alive() {
        let timer = Timer::new("timer-panic").unwrap();
        timer.schedule(Duration::from_millis(1), || panic!("timer"));
        let (tx, rx) = mpsc::channel();
        timer.schedule(Duration::from_millis(5), move || {
            let _ = tx.send(7);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }
}

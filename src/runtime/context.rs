//! The execution context carried by every coroutine.
//!
//! A context is the pair (current executor, current [`Snapshot`] of
//! AsyncLocal bindings). It is installed in a thread-local slot only for the
//! duration of a single poll or a single synchronous scope, and restored on
//! exit, so the same coroutine can be polled on any thread and always sees
//! its own context.

use super::executor::AsyncExecutor;
use super::local::Snapshot;
use std::cell::RefCell;

#[derive(Clone, Default)]
pub(crate) struct ExecContext {
    pub(crate) locals: Snapshot,
    pub(crate) executor: Option<AsyncExecutor>,
}

thread_local! {
    static CURRENT: RefCell<ExecContext> = RefCell::new(ExecContext::default());
}

impl ExecContext {
    /// Clone the context active on this thread.
    pub(crate) fn current() -> Self {
        CURRENT
            .try_with(|current| current.borrow().clone())
            .unwrap_or_default()
    }

    pub(crate) fn with_locals(mut self, locals: Snapshot) -> Self {
        self.locals = locals;
        self
    }

    pub(crate) fn with_executor(mut self, executor: AsyncExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Run `f` with this context installed, restoring the previous one
    /// afterwards (also on unwind).
    pub(crate) fn enter<R>(self, f: impl FnOnce() -> R) -> R {
        let previous = CURRENT.try_with(|current| current.replace(self)).ok();
        let _restore = Restore(previous);
        f()
    }
}

struct Restore(Option<ExecContext>);

impl Drop for Restore {
    fn drop(&mut self) {
        if let Some(previous) = self.0.take() {
            // Dropped outside the borrow: binding values may run arbitrary
            // destructors that read the context again.
            let replaced = CURRENT.try_with(|current| current.replace(previous)).ok();
            drop(replaced);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pool::DirectExecutor;

    #[test]
    fn test_enter_restores_previous_context() {
        let executor = AsyncExecutor::new("ctx-test", DirectExecutor);
        assert!(ExecContext::current().executor.is_none());

        ExecContext::default()
            .with_executor(executor.clone())
            .enter(|| {
                assert_eq!(ExecContext::current().executor, Some(executor.clone()));
            });

        assert!(ExecContext::current().executor.is_none());
    }

    #[test]
    fn test_enter_restores_on_panic() {
        let executor = AsyncExecutor::new("ctx-panic", DirectExecutor);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ExecContext::default()
                .with_executor(executor)
                .enter(|| panic!("boom"))
        }));
        assert!(result.is_err());
        assert!(ExecContext::current().executor.is_none());
    }
}

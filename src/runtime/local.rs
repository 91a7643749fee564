//! AsyncLocal: scoped values that follow a coroutine across threads.
//!
//! An [`AsyncLocal`] behaves like a thread-local whose binding belongs to a
//! *scope* rather than to a thread. Bindings live in an immutable map (the
//! [`Snapshot`]) that is part of each coroutine's execution context and is
//! reinstalled on every poll, so a value bound before a suspension is still
//! visible after the coroutine resumes on another thread.
//!
//! # Example
//!
//! ```rust,ignore
//! use strand::runtime::{AsyncLocal, Snapshot};
//! use std::sync::LazyLock;
//!
//! static TENANT: LazyLock<AsyncLocal<String>> = LazyLock::new(|| AsyncLocal::new("tenant"));
//!
//! TENANT.exec("acme".to_string(), || {
//!     assert_eq!(TENANT.get().as_deref(), Some("acme"));
//!     let snapshot = Snapshot::capture();
//!     std::thread::spawn(move || {
//!         snapshot.exec(|| assert_eq!(TENANT.get().as_deref(), Some("acme")));
//!     });
//! })?;
//! ```

use super::context::ExecContext;
use crate::error::AsyncError;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

pub(crate) type LocalValue = Arc<dyn Any + Send + Sync>;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

/// A typed context slot keyed by its own identity.
///
/// Clones of a handle share the same identity. Two locals created separately
/// are distinct even if they carry the same name.
///
/// A *non-stacking* local (the default) may only be bound to one value per
/// scope chain: binding a different value while one is active fails with an
/// `IllegalState` error, binding an equal value is a no-op. A *stacking*
/// local pushes a new value for the nested scope and pops it on exit.
pub struct AsyncLocal<T> {
    id: u64,
    name: &'static str,
    stacking: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for AsyncLocal<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name,
            stacking: self.stacking,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AsyncLocal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLocal")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("stacking", &self.stacking)
            .finish()
    }
}

impl<T> AsyncLocal<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a non-stacking local.
    pub fn new(name: &'static str) -> Self {
        Self::create(name, false)
    }

    /// Create a stacking local.
    pub fn stacking(name: &'static str) -> Self {
        Self::create(name, true)
    }

    fn create(name: &'static str, stacking: bool) -> Self {
        Self {
            id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            name,
            stacking,
            _marker: PhantomData,
        }
    }

    /// The local's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether nested bindings stack.
    pub fn is_stacking(&self) -> bool {
        self.stacking
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// The value bound in the current scope.
    pub fn get(&self) -> Option<T> {
        ExecContext::current().locals.get(self)
    }

    /// Whether the local is bound in the current scope.
    pub fn is_bound(&self) -> bool {
        ExecContext::current().locals.contains(self)
    }

    /// Run `body` with `value` bound.
    pub fn exec<R>(&self, value: T, body: impl FnOnce() -> R) -> Result<R, AsyncError> {
        self.with(value).exec(body)
    }

    /// Bind `value` for every poll of `future`.
    ///
    /// The conflict check runs now, against the caller's scope.
    pub fn exec_async<F: Future>(&self, value: T, future: F) -> Result<Scoped<F>, AsyncError> {
        self.with(value).exec_async(future)
    }

    /// Start a multi-local binding.
    pub fn with(&self, value: T) -> Bindings {
        Bindings::new().with(self, value)
    }

    fn pending(&self, value: T) -> PendingBinding {
        PendingBinding {
            id: self.id,
            name: self.name,
            stacking: self.stacking,
            value: Arc::new(value),
            same: same_value::<T>,
        }
    }
}

fn same_value<T: PartialEq + 'static>(a: &LocalValue, b: &LocalValue) -> bool {
    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

pub(crate) struct PendingBinding {
    id: u64,
    name: &'static str,
    stacking: bool,
    value: LocalValue,
    same: fn(&LocalValue, &LocalValue) -> bool,
}

/// Several locals to bind together.
///
/// Either all bindings are applied or, on a conflict, none is.
#[derive(Default)]
pub struct Bindings {
    pending: Vec<PendingBinding>,
}

impl Bindings {
    /// Empty binding set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn with<T>(mut self, local: &AsyncLocal<T>, value: T) -> Self
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.pending.push(local.pending(value));
        self
    }

    /// Run `body` with all bindings active.
    pub fn exec<R>(self, body: impl FnOnce() -> R) -> Result<R, AsyncError> {
        let context = ExecContext::current();
        let locals = context.locals.bind(&self.pending)?;
        Ok(context.with_locals(locals).enter(body))
    }

    /// Apply all bindings on every poll of `future`.
    pub fn exec_async<F: Future>(self, future: F) -> Result<Scoped<F>, AsyncError> {
        ExecContext::current().locals.bind(&self.pending)?;
        Ok(Scoped {
            mode: ScopeMode::Bind(self.pending),
            inner: Box::pin(future),
        })
    }
}

#[derive(Clone)]
pub(crate) struct Binding {
    pub(crate) name: &'static str,
    pub(crate) stacking: bool,
    /// Oldest first; the last entry is the visible value.
    pub(crate) values: Vec<LocalValue>,
}

/// An immutable capture of every bound local.
///
/// Cloning is cheap. A snapshot can be restored on any thread with
/// [`exec`](Self::exec) or [`exec_async`](Self::exec_async), and encoded for
/// another process with a [`SnapshotCodec`](super::SnapshotCodec).
#[derive(Clone, Default)]
pub struct Snapshot {
    bindings: Arc<HashMap<u64, Binding>>,
}

impl Snapshot {
    /// Capture the current scope's bindings.
    pub fn capture() -> Self {
        ExecContext::current().locals
    }

    /// A snapshot with nothing bound.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of bound locals.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// True if nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Names of the bound locals, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.bindings.values().map(|b| b.name).collect();
        names.sort_unstable();
        names
    }

    /// The visible value of `local` in this snapshot.
    pub fn get<T: Clone + 'static>(&self, local: &AsyncLocal<T>) -> Option<T> {
        self.bindings
            .get(&local.id)
            .and_then(|binding| binding.values.last())
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// The full stack of `local`, outermost first.
    pub fn stack<T: Clone + 'static>(&self, local: &AsyncLocal<T>) -> Vec<T> {
        self.bindings
            .get(&local.id)
            .map(|binding| {
                binding
                    .values
                    .iter()
                    .filter_map(|value| value.downcast_ref::<T>().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether `local` is bound.
    pub fn contains<T>(&self, local: &AsyncLocal<T>) -> bool {
        self.bindings.contains_key(&local.id)
    }

    /// Run `body` with exactly these bindings active.
    pub fn exec<R>(&self, body: impl FnOnce() -> R) -> R {
        ExecContext::current()
            .with_locals(self.clone())
            .enter(body)
    }

    /// Install exactly these bindings on every poll of `future`.
    pub fn exec_async<F: Future>(&self, future: F) -> Scoped<F> {
        Scoped {
            mode: ScopeMode::Replace(self.clone()),
            inner: Box::pin(future),
        }
    }

    /// Apply bindings, failing on a non-stacking conflict.
    pub(crate) fn bind(&self, pending: &[PendingBinding]) -> Result<Snapshot, AsyncError> {
        let mut bindings = (*self.bindings).clone();
        for binding in pending {
            match bindings.get_mut(&binding.id) {
                Some(existing) if existing.stacking => existing.values.push(binding.value.clone()),
                Some(existing) => {
                    let current = existing.values.last();
                    if !current.is_some_and(|current| (binding.same)(current, &binding.value)) {
                        return Err(AsyncError::illegal_state(format!(
                            "AsyncLocal '{}' is already bound to a different value",
                            binding.name
                        )));
                    }
                }
                None => {
                    bindings.insert(
                        binding.id,
                        Binding {
                            name: binding.name,
                            stacking: binding.stacking,
                            values: vec![binding.value.clone()],
                        },
                    );
                }
            }
        }
        Ok(Snapshot {
            bindings: Arc::new(bindings),
        })
    }

    /// Apply bindings that already passed [`bind`](Self::bind) at their call
    /// site. Used when re-entering a scope on a later poll.
    fn overlay(&self, pending: &[PendingBinding]) -> Snapshot {
        let mut bindings = (*self.bindings).clone();
        for binding in pending {
            let entry = bindings.entry(binding.id).or_insert_with(|| Binding {
                name: binding.name,
                stacking: binding.stacking,
                values: Vec::new(),
            });
            if entry.stacking {
                entry.values.push(binding.value.clone());
            } else {
                entry.values = vec![binding.value.clone()];
            }
        }
        Snapshot {
            bindings: Arc::new(bindings),
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (u64, &Binding)> {
        self.bindings.iter().map(|(id, binding)| (*id, binding))
    }

    pub(crate) fn from_entries(entries: HashMap<u64, Binding>) -> Self {
        Snapshot {
            bindings: Arc::new(entries),
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("locals", &self.names())
            .finish()
    }
}

enum ScopeMode {
    Bind(Vec<PendingBinding>),
    Replace(Snapshot),
}

/// A future running inside an AsyncLocal scope.
///
/// Returned by [`AsyncLocal::exec_async`], [`Bindings::exec_async`] and
/// [`Snapshot::exec_async`].
pub struct Scoped<F> {
    mode: ScopeMode,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let context = ExecContext::current();
        let locals = match &this.mode {
            ScopeMode::Bind(pending) => context.locals.overlay(pending),
            ScopeMode::Replace(snapshot) => snapshot.clone(),
        };
        let inner = &mut this.inner;
        context.with_locals(locals).enter(|| inner.as_mut().poll(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_get_unbound() {
        let local: AsyncLocal<u32> = AsyncLocal::new("unbound");
        assert_eq!(local.get(), None);
        assert!(!local.is_bound());
    }

    #[test]
    fn test_non_stacking_conflict() {
        let local = AsyncLocal::new("user");
        let result = local.exec(1u32, || local.exec(2u32, || ()));
        let inner = result.unwrap();
        let err = inner.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert!(err.message().contains("user"));
    }

    #[test]
    fn test_conflicting_body_never_runs() {
        let local = AsyncLocal::new("guarded");
        let mut ran = false;
        let _ = local.exec(1u32, || local.exec(2u32, || ran = true));
        assert!(!ran);
    }

    #[test]
    fn test_non_stacking_same_value_is_noop() {
        let local = AsyncLocal::new("same");
        let seen = local
            .exec("a".to_string(), || local.exec("a".to_string(), || local.get()))
            .unwrap()
            .unwrap();
        assert_eq!(seen.as_deref(), Some("a"));
    }

    #[test]
    fn test_stacking_push_and_pop() {
        let local = AsyncLocal::stacking("frame");
        local
            .exec(1u32, || {
                assert_eq!(local.get(), Some(1));
                local
                    .exec(2u32, || {
                        assert_eq!(local.get(), Some(2));
                        assert_eq!(Snapshot::capture().stack(&local), vec![1, 2]);
                    })
                    .unwrap();
                assert_eq!(local.get(), Some(1));
            })
            .unwrap();
        assert_eq!(local.get(), None);
    }

    #[test]
    fn test_snapshot_at_each_level() {
        let a = AsyncLocal::new("a");
        let b = AsyncLocal::new("b");
        let c = AsyncLocal::stacking("c");

        a.exec(1u32, || {
            let s1 = Snapshot::capture();
            assert_eq!(s1.names(), vec!["a"]);
            assert_eq!(s1.get(&a), Some(1));

            b.exec("x".to_string(), || {
                c.exec(10u64, || {
                    c.exec(11u64, || {
                        let s3 = Snapshot::capture();
                        assert_eq!(s3.len(), 3);
                        assert_eq!(s3.get(&a), Some(1));
                        assert_eq!(s3.get(&b).as_deref(), Some("x"));
                        assert_eq!(s3.stack(&c), vec![10, 11]);
                    })
                    .unwrap();
                })
                .unwrap();
            })
            .unwrap();

            // Captured snapshots are immutable.
            assert_eq!(s1.len(), 1);
        })
        .unwrap();
    }

    #[test]
    fn test_snapshot_exec_replaces_ambient() {
        let a = AsyncLocal::new("a");
        let b = AsyncLocal::new("b");
        let snapshot = a.exec(1u32, Snapshot::capture).unwrap();

        b.exec(2u32, || {
            a.exec(5u32, || {
                snapshot.exec(|| {
                    assert_eq!(a.get(), Some(1));
                    assert_eq!(b.get(), None);
                });
            })
            .unwrap();
        })
        .unwrap();
    }

    #[test]
    fn test_snapshot_restored_on_other_thread() {
        let local = AsyncLocal::new("tenant");
        let snapshot = local.exec("acme".to_string(), Snapshot::capture).unwrap();
        let local2 = local.clone();
        let seen = std::thread::spawn(move || snapshot.exec(|| local2.get()))
            .join()
            .unwrap();
        assert_eq!(seen.as_deref(), Some("acme"));
    }

    #[test]
    fn test_bindings_are_atomic() {
        let a = AsyncLocal::new("a");
        let b = AsyncLocal::new("b");
        let result = b.exec(1u32, || {
            Bindings::new()
                .with(&a, 1u32)
                .with(&b, 2u32)
                .exec(|| ())
                .map(|_| a.is_bound())
        });
        assert!(result.unwrap().is_err());
        assert!(!a.is_bound());
    }

    #[test]
    fn test_distinct_locals_with_same_name() {
        let first = AsyncLocal::new("dup");
        let second = AsyncLocal::new("dup");
        first
            .exec(1u32, || second.exec(2u32, || (first.get(), second.get())))
            .map(|inner| assert_eq!(inner.unwrap(), (Some(1), Some(2))))
            .unwrap();
    }
}

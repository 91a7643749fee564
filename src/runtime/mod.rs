//! The asynchronous execution core.
//!
//! - [`Async`] / [`Promise`]: single-assignment result cells; awaiting an
//!   `Async` inside a coroutine yields `Result<T, AsyncError>`
//! - [`AsyncExecutor`]: executor affinity, relay, yield, sleep, timeouts
//! - [`AsyncLocal`] / [`Snapshot`]: context that follows a coroutine across
//!   threads, and [`SnapshotCodec`] to ship it to another node
//! - [`AsyncQueue`]: per-key serialized execution
//! - [`AsyncFilterChain`]: ordered interceptors around a handler
//!
//! # Example
//!
//! ```rust,no_run
//! use strand::runtime::{Async, AsyncExecutor};
//! use std::time::Duration;
//!
//! let io = AsyncExecutor::thread_per_task("io");
//! let value = io.exec(|| async {
//!     AsyncExecutor::sleep(Duration::from_millis(10)).await?;
//!     let answer = Async::result(41u32).await?;
//!     Ok(answer + 1)
//! });
//! assert_eq!(value.join().unwrap(), 42);
//! ```

mod async_value;
mod codec;
mod context;
mod executor;
mod filter;
mod local;
mod pool;
mod queue;
mod task;
mod timer;

pub use async_value::{Async, AsyncResult, AwaitAsync, Promise};
pub use codec::SnapshotCodec;
pub use executor::{AsyncExecutor, AsyncExecutorBuilder, Executor, Job};
pub use filter::{AsyncFilter, AsyncFilterChain, FilterChainHandler, Next};
pub use local::{AsyncLocal, Bindings, Scoped, Snapshot};
pub use pool::{DirectExecutor, ThreadPerTaskExecutor, ThreadPool, TokioExecutor};
pub use queue::AsyncQueue;
pub use timer::{Timer, TimerKey};

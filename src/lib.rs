//! Coroutine runtime with executor affinity and context propagation, plus
//! the shard routing layer built on it.
//!
//! This crate provides:
//! - **`Async<T>`** single-assignment results that can be `.await`ed,
//!   joined, or observed with callbacks
//! - **`AsyncExecutor`** to pin coroutines to an executor and relay results
//!   back to the caller's
//! - **`AsyncLocal`** context that follows a coroutine across threads and,
//!   through a `SnapshotCodec`, across nodes
//! - **`AsyncQueue`** and **`AsyncFilterChain`** building blocks
//! - **Shard allocation and routing** for a cluster of nodes
//!
//! # Example
//!
//! ```rust,no_run
//! use strand::runtime::{AsyncExecutor, AsyncLocal};
//!
//! let tenant = AsyncLocal::<String>::new("tenant");
//! let io = AsyncExecutor::thread_per_task("io");
//!
//! let value = tenant
//!     .exec("acme".to_string(), || {
//!         let tenant = tenant.clone();
//!         io.exec(move || async move {
//!             AsyncExecutor::yield_now().await?;
//!             Ok(tenant.get().unwrap_or_default())
//!         })
//!     })
//!     .unwrap();
//! assert_eq!(value.join().unwrap(), "acme");
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                  cluster                     │
//! │  ClusterRouter ─► ClusterTransport ─►        │
//! │        ClusterDispatcher ─► HandlerRegistry  │
//! │  DefaultShardAllocationStrategy, ShardTable  │
//! └──────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌──────────────────────────────────────────────┐
//! │                  runtime                     │
//! │  Async ◄─ task driver ─► AsyncExecutor       │
//! │  AsyncLocal / Snapshot    Timer, ThreadPool  │
//! │  AsyncQueue               AsyncFilterChain   │
//! └──────────────────────────────────────────────┘
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod runtime;
pub mod testing;
pub mod types;

pub use config::{ClusterConfig, ExecutorConfig};
pub use error::{AsyncError, Error, ErrorKind, Result};
pub use types::{NodeId, RequestId, ShardId};

pub use runtime::{
    Async, AsyncExecutor, AsyncFilterChain, AsyncLocal, AsyncQueue, AsyncResult, Promise,
    Snapshot, SnapshotCodec,
};

pub use cluster::{
    ClusterDispatcher, ClusterRouter, ClusterTransport, DefaultShardAllocationStrategy,
    HandlerRegistry, LocalNetwork, ShardAllocationStrategy, ShardRebalance, ShardSet, ShardTable,
};

pub use metrics::{ClusterMetrics, Counter, ExecutorMetrics, Gauge, Histogram, QueueMetrics};

pub use testing::TestCluster;

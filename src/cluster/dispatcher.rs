//! Inbound request dispatch.
//!
//! Every inbound [`ClusterRequest`] runs through an
//! [`AsyncFilterChain`]. The first filter restores the caller's AsyncLocal
//! snapshot, user filters follow, and the terminal step calls the handler
//! registered for the request's type key. Whatever escapes the chain is
//! turned into a failed [`ClusterResponse`], so a dispatch never rejects.

use super::envelope::{ClusterBroadcast, ClusterRequest, ClusterResponse};
use super::handler::HandlerRegistry;
use crate::error::{AsyncError, Error};
use crate::metrics::ClusterMetrics;
use crate::runtime::{
    Async, AsyncExecutor, AsyncFilter, AsyncFilterChain, FilterChainHandler, Next, SnapshotCodec,
};
use crate::types::NodeId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Handles requests and broadcasts addressed to one node.
pub struct ClusterDispatcher {
    node_id: NodeId,
    registry: Arc<HandlerRegistry>,
    codec: Arc<SnapshotCodec>,
    executor: Option<AsyncExecutor>,
    routes: FilterChainHandler<ClusterRequest, ClusterResponse>,
    metrics: Arc<ClusterMetrics>,
}

impl ClusterDispatcher {
    pub fn builder(node_id: NodeId, registry: Arc<HandlerRegistry>) -> DispatcherBuilder {
        DispatcherBuilder {
            node_id,
            registry,
            codec: Arc::new(SnapshotCodec::new()),
            executor: None,
            filters: Vec::new(),
            metrics: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Handle one request. The returned value always fulfills.
    pub fn dispatch(&self, request: ClusterRequest) -> Async<ClusterResponse> {
        self.metrics.dispatched.inc();
        trace!(
            node_id = self.node_id,
            request_id = request.id,
            type_key = %request.type_key,
            "dispatching request"
        );
        match &self.executor {
            Some(executor) => {
                let routes = self.routes.clone();
                executor.exec(move || async move { routes.handle(request).await })
            }
            None => self.routes.handle(request),
        }
    }

    /// Deliver a broadcast to its handler.
    ///
    /// Rejects when no handler is registered or the handler fails; the
    /// failure is also logged and counted.
    pub fn dispatch_broadcast(&self, message: ClusterBroadcast) -> Async<()> {
        self.metrics.dispatched.inc();
        let Some(handler) = self.registry.broadcast_handler(&message.type_key) else {
            debug!(node_id = self.node_id, type_key = %message.type_key, "no broadcast handler");
            self.metrics.dispatch_failures.inc();
            return Async::rejected(Error::HandlerNotFound(message.type_key));
        };
        let snapshot = match self.codec.decode(&message.snapshot) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(node_id = self.node_id, error = %e, "undecodable broadcast snapshot");
                self.metrics.dispatch_failures.inc();
                return Async::rejected(e);
            }
        };

        let payload = message.payload;
        let deliver = move || {
            snapshot.exec(|| {
                catch_unwind(AssertUnwindSafe(|| handler(payload)))
                    .unwrap_or_else(|panic| Async::rejected(AsyncError::panic(panic)))
            })
        };
        let delivered = match &self.executor {
            Some(executor) => executor.exec(move || async move { deliver().await }),
            None => deliver(),
        };

        let metrics = self.metrics.clone();
        let node_id = self.node_id;
        let type_key = message.type_key;
        delivered.when_complete(move |result| {
            if let Err(e) = result {
                warn!(node_id, type_key = %type_key, error = %e, "broadcast handler failed");
                metrics.dispatch_failures.inc();
            }
        });
        delivered
    }
}

impl std::fmt::Debug for ClusterDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterDispatcher")
            .field("node_id", &self.node_id)
            .field("routes", &self.routes)
            .field("executor", &self.executor)
            .finish()
    }
}

/// Builder for [`ClusterDispatcher`].
pub struct DispatcherBuilder {
    node_id: NodeId,
    registry: Arc<HandlerRegistry>,
    codec: Arc<SnapshotCodec>,
    executor: Option<AsyncExecutor>,
    filters: Vec<Box<dyn FnOnce(RouteChain) -> RouteChain + Send>>,
    metrics: Option<Arc<ClusterMetrics>>,
}

type RouteChain = AsyncFilterChain<ClusterRequest, ClusterResponse>;

impl DispatcherBuilder {
    /// Codec used to restore caller snapshots. Defaults to an empty codec,
    /// which restores nothing.
    pub fn codec(mut self, codec: Arc<SnapshotCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Run handlers on `executor` instead of the delivering thread.
    pub fn executor(mut self, executor: AsyncExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Add a filter after snapshot restoration. Filters run in the order
    /// they are added.
    pub fn filter(mut self, filter: impl AsyncFilter<ClusterRequest, ClusterResponse>) -> Self {
        self.filters.push(Box::new(move |chain: RouteChain| chain.push(filter)));
        self
    }

    pub fn metrics(mut self, metrics: Arc<ClusterMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> ClusterDispatcher {
        let metrics = self.metrics.unwrap_or_default();

        let mut chain = RouteChain::new().push(restore_snapshot(self.codec.clone()));
        for add in self.filters {
            chain = add(chain);
        }
        debug!(node_id = self.node_id, filters = chain.len(), "built dispatcher");

        let registry = self.registry.clone();
        let failures = metrics.clone();
        let routes = chain.with(
            move |request: ClusterRequest| invoke_route(&registry, request),
            move |error: AsyncError| {
                failures.dispatch_failures.inc();
                ClusterResponse::failure(&error)
            },
        );

        ClusterDispatcher {
            node_id: self.node_id,
            registry: self.registry,
            codec: self.codec,
            executor: self.executor,
            routes,
            metrics,
        }
    }
}

fn restore_snapshot(codec: Arc<SnapshotCodec>) -> impl AsyncFilter<ClusterRequest, ClusterResponse> {
    move |request: ClusterRequest, next: Next<ClusterRequest, ClusterResponse>| {
        match codec.decode(&request.snapshot) {
            Ok(snapshot) => snapshot.exec(|| next.call(request)),
            Err(e) => {
                warn!(request_id = request.id, error = %e, "undecodable request snapshot");
                Async::rejected(e)
            }
        }
    }
}

fn invoke_route(registry: &HandlerRegistry, request: ClusterRequest) -> Async<ClusterResponse> {
    let Some(handler) = registry.route_handler(&request.type_key) else {
        return Async::rejected(Error::HandlerNotFound(request.type_key));
    };
    let timeout = request.timeout();
    let handled = handler(request.payload);
    if timeout.is_zero() {
        return handled.map(ClusterResponse::success);
    }
    // Handler failures settle the inner result; only this node's deadline
    // rejects the outer value.
    let settled = handled.map(Ok::<_, AsyncError>).recover(Err);
    let deadline = AsyncExecutor::timeout(settled, timeout);
    let request_id = request.id;
    Async::coroutine(async move {
        match deadline.await {
            Ok(handled) => handled.map(ClusterResponse::success),
            Err(e) if e.is_timeout() => {
                debug!(request_id, ?timeout, "handler missed the request deadline");
                Ok(ClusterResponse::timeout(format!("handler exceeded {:?}", timeout)))
            }
            Err(e) => Err(e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::envelope::{decode, encode};
    use crate::error::ErrorKind;
    use crate::runtime::AsyncLocal;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn request(type_key: &str, payload: Vec<u8>, snapshot: Vec<u8>) -> ClusterRequest {
        ClusterRequest {
            type_key: type_key.into(),
            payload,
            id: 1,
            shard_key: "k".into(),
            snapshot,
            timeout_ms: 0,
        }
    }

    #[test]
    fn test_dispatch_restores_snapshot() {
        let tenant = AsyncLocal::<String>::new("tenant");
        let codec = Arc::new(SnapshotCodec::new().with(&tenant).unwrap());
        let registry = Arc::new(HandlerRegistry::new());
        let seen = tenant.clone();
        registry
            .register_route::<u32, String, _>("whoami", move |_| {
                Async::result(seen.get().unwrap_or_default())
            })
            .unwrap();
        let dispatcher = ClusterDispatcher::builder(1, registry).codec(codec.clone()).build();

        let snapshot = tenant
            .exec("acme".to_string(), || codec.encode(&crate::runtime::Snapshot::capture()))
            .unwrap()
            .unwrap();
        let response = dispatcher
            .dispatch(request("whoami", encode(&0u32).unwrap(), snapshot))
            .join()
            .unwrap();
        assert!(response.is_success());
        assert_eq!(decode::<String>(&response.payload).unwrap(), "acme");
        assert!(!tenant.is_bound());
    }

    #[test]
    fn test_missing_handler_becomes_failure_response() {
        let dispatcher = ClusterDispatcher::builder(1, Arc::new(HandlerRegistry::new())).build();
        let response = dispatcher.dispatch(request("nope", Vec::new(), Vec::new())).join().unwrap();
        let err = response.into_result().unwrap_err();
        assert!(err.message().contains("nope"));
    }

    #[test]
    fn test_handler_error_and_panic_are_reported() {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register_route::<u32, u32, _>("fail", |_| {
                Async::rejected(AsyncError::illegal_state("not ready"))
            })
            .unwrap();
        registry
            .register_route::<u32, u32, _>("boom", |_| panic!("handler exploded"))
            .unwrap();
        let metrics = Arc::new(ClusterMetrics::default());
        let dispatcher = ClusterDispatcher::builder(1, registry).metrics(metrics.clone()).build();

        let failed = dispatcher
            .dispatch(request("fail", encode(&1u32).unwrap(), Vec::new()))
            .join()
            .unwrap();
        let err = failed.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(err.message(), "not ready");

        let panicked = dispatcher
            .dispatch(request("boom", encode(&1u32).unwrap(), Vec::new()))
            .join()
            .unwrap();
        assert_eq!(panicked.into_result().unwrap_err().kind(), ErrorKind::Panic);
        assert_eq!(metrics.dispatch_failures.get(), 2);
        assert_eq!(metrics.dispatched.get(), 2);
    }

    #[test]
    fn test_slow_handler_times_out_remotely() {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register_route::<u32, u32, _>("slow", |v| {
                AsyncExecutor::sleep(Duration::from_millis(500)).map(move |_| v)
            })
            .unwrap();
        let dispatcher = ClusterDispatcher::builder(1, registry).build();
        let mut slow = request("slow", encode(&1u32).unwrap(), Vec::new());
        slow.timeout_ms = 20;
        let response = dispatcher.dispatch(slow).join().unwrap();
        assert!(response.timed_out);
    }

    #[test]
    fn test_handler_timeout_is_not_a_deadline_miss() {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register_route::<u32, u32, _>("lookup", |_| {
                let (stuck, _promise) = Async::<u32>::pending();
                AsyncExecutor::timeout(stuck, Duration::from_millis(5))
            })
            .unwrap();
        let dispatcher = ClusterDispatcher::builder(1, registry).build();
        let mut lookup = request("lookup", encode(&1u32).unwrap(), Vec::new());
        lookup.timeout_ms = 2_000;

        let response = dispatcher.dispatch(lookup).join().unwrap();
        assert!(!response.timed_out);
        assert_eq!(response.into_result().unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_filters_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        let handler_log = log.clone();
        registry
            .register_route::<u32, u32, _>("echo", move |v| {
                handler_log.lock().push("handler");
                Async::result(v)
            })
            .unwrap();
        let (first, second) = (log.clone(), log.clone());
        let dispatcher = ClusterDispatcher::builder(1, registry)
            .filter(move |req: ClusterRequest, next: Next<ClusterRequest, ClusterResponse>| {
                first.lock().push("first");
                next.call(req)
            })
            .filter(move |req: ClusterRequest, next: Next<ClusterRequest, ClusterResponse>| {
                second.lock().push("second");
                next.call(req)
            })
            .build();

        dispatcher
            .dispatch(request("echo", encode(&3u32).unwrap(), Vec::new()))
            .join()
            .unwrap();
        assert_eq!(*log.lock(), vec!["first", "second", "handler"]);
    }

    #[test]
    fn test_broadcast_without_handler_rejects() {
        let metrics = Arc::new(ClusterMetrics::default());
        let dispatcher = ClusterDispatcher::builder(1, Arc::new(HandlerRegistry::new()))
            .metrics(metrics.clone())
            .build();
        let delivered = dispatcher.dispatch_broadcast(ClusterBroadcast {
            type_key: "evict".into(),
            payload: Vec::new(),
            snapshot: Vec::new(),
        });
        assert!(delivered.is_rejected());
        assert_eq!(metrics.dispatch_failures.get(), 1);
    }
}

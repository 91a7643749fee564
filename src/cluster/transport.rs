//! Cluster transport abstraction and an in-memory implementation.
//!
//! [`LocalNetwork`] connects dispatchers living in one process. Requests and
//! responses still go through the bincode envelope codec so the wire format
//! is exercised end to end. Partitions can be injected between node pairs:
//! requests across a partition are held without an answer until the
//! network heals, at which point they are cancelled.

use super::dispatcher::ClusterDispatcher;
use super::envelope::{decode, encode, ClusterBroadcast, ClusterRequest, ClusterResponse};
use crate::error::{AsyncError, Error};
use crate::runtime::{Async, Promise};
use crate::types::NodeId;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Delivers envelopes to other nodes.
pub trait ClusterTransport: Send + Sync {
    /// Send `request` to `node` and settle with its response.
    fn send(&self, node: NodeId, request: ClusterRequest) -> Async<ClusterResponse>;

    /// Deliver `message` to every reachable node, this one included.
    /// Settles once every delivery has finished; individual handler
    /// failures are logged, not propagated.
    fn broadcast(&self, message: ClusterBroadcast) -> Async<()>;
}

/// In-process network of dispatchers.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<BTreeMap<NodeId, Arc<ClusterDispatcher>>>,
    partitions: RwLock<HashSet<(NodeId, NodeId)>>,
    held: Mutex<Vec<Promise<ClusterResponse>>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach `dispatcher` under its node id.
    pub fn register(&self, dispatcher: Arc<ClusterDispatcher>) {
        let node_id = dispatcher.node_id();
        info!(node_id, "node joined local network");
        self.nodes.write().insert(node_id, dispatcher);
    }

    pub fn deregister(&self, node: NodeId) -> bool {
        let removed = self.nodes.write().remove(&node).is_some();
        if removed {
            info!(node_id = node, "node left local network");
        }
        removed
    }

    /// Registered node ids, ascending.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.read().keys().copied().collect()
    }

    /// A transport sending from `node`.
    pub fn transport(self: &Arc<Self>, node: NodeId) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            from: node,
        }
    }

    /// Drop traffic between `a` and `b` in both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        warn!(a, b, "partitioning nodes");
        self.partitions.write().insert(link(a, b));
    }

    /// Partition `node` from every other registered node.
    pub fn isolate(&self, node: NodeId) {
        for other in self.nodes() {
            if other != node {
                self.partition(node, other);
            }
        }
    }

    /// Remove all partitions. Requests held across them are cancelled.
    pub fn heal(&self) {
        self.partitions.write().clear();
        let held = std::mem::take(&mut *self.held.lock());
        info!(cancelled = held.len(), "healed local network");
        drop(held);
    }

    pub fn is_partitioned(&self, a: NodeId, b: NodeId) -> bool {
        a != b && self.partitions.read().contains(&link(a, b))
    }

    /// Requests currently held by partitions.
    pub fn held(&self) -> usize {
        self.held.lock().len()
    }

    fn dispatcher(&self, node: NodeId) -> Option<Arc<ClusterDispatcher>> {
        self.nodes.read().get(&node).cloned()
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("nodes", &self.nodes())
            .field("partitions", &self.partitions.read().len())
            .field("held", &self.held())
            .finish()
    }
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

/// [`ClusterTransport`] over a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: NodeId,
}

impl LocalTransport {
    pub fn node_id(&self) -> NodeId {
        self.from
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }
}

impl ClusterTransport for LocalTransport {
    fn send(&self, node: NodeId, request: ClusterRequest) -> Async<ClusterResponse> {
        let Some(dispatcher) = self.network.dispatcher(node) else {
            return Async::rejected(Error::NodeUnreachable(node));
        };
        if self.network.is_partitioned(self.from, node) {
            debug!(from = self.from, to = node, request_id = request.id, "request held by partition");
            let (value, promise) = Async::pending();
            self.network.held.lock().push(promise);
            return value;
        }

        let delivered = match encode(&request).and_then(|bytes| decode::<ClusterRequest>(&bytes)) {
            Ok(request) => request,
            Err(e) => return Async::rejected(e),
        };
        trace!(from = self.from, to = node, request_id = delivered.id, "delivering request");
        let response = dispatcher.dispatch(delivered);
        Async::coroutine(async move {
            let response = response.await?;
            let bytes = encode(&response)?;
            Ok(decode::<ClusterResponse>(&bytes)?)
        })
    }

    fn broadcast(&self, message: ClusterBroadcast) -> Async<()> {
        let targets: Vec<_> = self
            .network
            .nodes
            .read()
            .iter()
            .filter(|(node, _)| !self.network.is_partitioned(self.from, **node))
            .map(|(node, dispatcher)| (*node, dispatcher.clone()))
            .collect();
        trace!(from = self.from, targets = targets.len(), type_key = %message.type_key, "broadcasting");

        let deliveries: Vec<(NodeId, Async<()>)> = targets
            .into_iter()
            .map(|(node, dispatcher)| (node, dispatcher.dispatch_broadcast(message.clone())))
            .collect();
        Async::coroutine(async move {
            for (node, delivery) in deliveries {
                if let Err(e) = delivery.await {
                    debug!(node_id = node, error = %e, "broadcast delivery failed");
                }
            }
            Ok::<_, AsyncError>(())
        })
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("from", &self.from)
            .field("nodes", &self.network.nodes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::handler::HandlerRegistry;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn node(network: &LocalNetwork, id: NodeId) -> Arc<HandlerRegistry> {
        let registry = Arc::new(HandlerRegistry::new());
        network.register(Arc::new(ClusterDispatcher::builder(id, registry.clone()).build()));
        registry
    }

    fn echo_request(id: u64) -> ClusterRequest {
        ClusterRequest {
            type_key: "echo".into(),
            payload: encode(&id).unwrap(),
            id,
            shard_key: "k".into(),
            snapshot: Vec::new(),
            timeout_ms: 0,
        }
    }

    #[test]
    fn test_send_reaches_node() {
        let network = LocalNetwork::new();
        node(&network, 1);
        node(&network, 2)
            .register_route::<u64, u64, _>("echo", |v| Async::result(v + 1))
            .unwrap();

        let response = network.transport(1).send(2, echo_request(41)).join().unwrap();
        assert_eq!(decode::<u64>(&response.into_result().unwrap()).unwrap(), 42);
    }

    #[test]
    fn test_unknown_node_unreachable() {
        let network = LocalNetwork::new();
        let err = network.transport(1).send(9, echo_request(1)).join().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failed);
        assert!(err.message().contains("unreachable"));
    }

    #[test]
    fn test_partition_holds_then_cancels() {
        let network = LocalNetwork::new();
        node(&network, 1);
        node(&network, 2)
            .register_route::<u64, u64, _>("echo", |v| Async::result(v))
            .unwrap();
        network.isolate(2);
        assert!(network.is_partitioned(1, 2));

        let pending = network.transport(1).send(2, echo_request(1));
        assert!(!pending.is_done());
        assert_eq!(network.held(), 1);

        network.heal();
        assert_eq!(pending.join().unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(network.transport(1).send(2, echo_request(2)).join().is_ok());
    }

    #[test]
    fn test_broadcast_skips_partitioned_nodes() {
        let network = LocalNetwork::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for id in 1..=3 {
            let hits = hits.clone();
            node(&network, id)
                .register_broadcast::<String, _>("evict", move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Async::result(())
                })
                .unwrap();
        }
        network.partition(1, 3);

        let message = ClusterBroadcast {
            type_key: "evict".into(),
            payload: encode(&"user-7".to_string()).unwrap(),
            snapshot: Vec::new(),
        };
        network.transport(1).broadcast(message).join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}

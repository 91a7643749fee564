//! Outbound request routing.
//!
//! A key hashes to a shard, the [`ShardTable`] names the shard's owner, and
//! the request goes out through a [`ClusterTransport`] carrying the caller's
//! encoded AsyncLocal snapshot. The result is relayed back to the caller's
//! executor.

use super::envelope::{decode, encode, ClusterBroadcast, ClusterRequest};
use super::shards::ShardTable;
use super::transport::ClusterTransport;
use crate::config::ClusterConfig;
use crate::error::{AsyncError, Error, ErrorKind, Result};
use crate::metrics::ClusterMetrics;
use crate::runtime::{Async, AsyncExecutor, Snapshot, SnapshotCodec};
use crate::types::{NodeId, RequestId, ShardId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use twox_hash::XxHash64;

/// Routes requests to shard owners.
pub struct ClusterRouter {
    config: ClusterConfig,
    shards: Arc<ShardTable>,
    transport: Arc<dyn ClusterTransport>,
    codec: Arc<SnapshotCodec>,
    metrics: Arc<ClusterMetrics>,
    next_id: AtomicU64,
}

impl ClusterRouter {
    /// Fails if `config` is invalid or disagrees with `shards` on the shard
    /// count.
    pub fn new(
        config: ClusterConfig,
        shards: Arc<ShardTable>,
        transport: Arc<dyn ClusterTransport>,
        codec: Arc<SnapshotCodec>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        if shards.max_shards() != config.max_shards {
            return Err(Error::Config(format!(
                "router expects {} shards but the shard table has {}",
                config.max_shards,
                shards.max_shards()
            )));
        }
        Ok(Self {
            config,
            shards,
            transport,
            codec,
            metrics,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Hash a key with the configured seed.
    pub fn hash_key(&self, key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(self.config.hash_seed);
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Shard a key belongs to.
    pub fn shard_for_key(&self, key: &str) -> ShardId {
        (self.hash_key(key.as_bytes()) % self.config.max_shards as u64) as ShardId
    }

    /// Node currently owning the shard of `key`.
    pub fn node_for_key(&self, key: &str) -> Result<NodeId> {
        let shard = self.shard_for_key(key);
        self.shards.owner_of(shard).ok_or(Error::ShardUnassigned(shard))
    }

    /// Send `request` to the owner of `shard_key`'s shard with the
    /// configured route timeout.
    pub fn route<Req, Resp>(&self, type_key: &str, shard_key: &str, request: &Req) -> Async<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.route_with_timeout(type_key, shard_key, request, self.config.route_timeout)
    }

    /// Like [`route`](Self::route) with an explicit deadline.
    ///
    /// Settles with the decoded response, a `RouteTimeout` error, or the
    /// remote error rebuilt from its class name and message. The deadline
    /// does not interrupt the remote handler.
    pub fn route_with_timeout<Req, Resp>(
        &self,
        type_key: &str,
        shard_key: &str,
        request: &Req,
        timeout: Duration,
    ) -> Async<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let node = match self.node_for_key(shard_key) {
            Ok(node) => node,
            Err(e) => return Async::rejected(e),
        };
        let envelope = match self.envelope(type_key, shard_key, request, timeout) {
            Ok(envelope) => envelope,
            Err(e) => return Async::rejected(e),
        };
        let request_id = envelope.id;
        trace!(request_id, node_id = node, type_key, shard_key, "routing request");

        let started = Instant::now();
        let sent = AsyncExecutor::timeout(self.transport.send(node, envelope), timeout);
        let metrics = self.metrics.clone();
        let type_key = type_key.to_string();
        let outcome = Async::coroutine(async move {
            let result = match sent.await {
                Ok(response) => response.into_result(),
                Err(e) if e.kind() == ErrorKind::Timeout => {
                    debug!(request_id, node_id = node, type_key = %type_key, "route timed out");
                    Err(AsyncError::of_kind(
                        ErrorKind::RouteTimeout,
                        format!(
                            "{} to node {} got no response within {:?}",
                            type_key, node, timeout
                        ),
                    )
                    .with_cause(e))
                }
                Err(e) => Err(e),
            };
            let timed_out = matches!(&result, Err(e) if e.kind() == ErrorKind::RouteTimeout);
            metrics.record_route(started.elapsed(), timed_out, result.is_err() && !timed_out);
            let payload = result?;
            Ok(decode::<Resp>(&payload)?)
        });
        AsyncExecutor::relay(outcome)
    }

    /// Broadcast `message` to every node.
    pub fn broadcast<Msg: Serialize>(&self, type_key: &str, message: &Msg) -> Async<()> {
        let envelope = match self.broadcast_envelope(type_key, message) {
            Ok(envelope) => envelope,
            Err(e) => return Async::rejected(e),
        };
        self.metrics.broadcasts.inc();
        debug!(type_key, "broadcasting");
        AsyncExecutor::relay(self.transport.broadcast(envelope))
    }

    fn envelope<Req: Serialize>(
        &self,
        type_key: &str,
        shard_key: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<ClusterRequest> {
        Ok(ClusterRequest {
            type_key: type_key.to_string(),
            payload: encode(request)?,
            id: self.next_request_id(),
            shard_key: shard_key.to_string(),
            snapshot: self.codec.encode(&Snapshot::capture())?,
            timeout_ms: timeout.as_millis() as u64,
        })
    }

    fn broadcast_envelope<Msg: Serialize>(&self, type_key: &str, message: &Msg) -> Result<ClusterBroadcast> {
        Ok(ClusterBroadcast {
            type_key: type_key.to_string(),
            payload: encode(message)?,
            snapshot: self.codec.encode(&Snapshot::capture())?,
        })
    }

    fn next_request_id(&self) -> RequestId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("node_id", &self.config.node_id)
            .field("max_shards", &self.config.max_shards)
            .field("route_timeout", &self.config.route_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::allocation::ShardRebalance;
    use crate::cluster::dispatcher::ClusterDispatcher;
    use crate::cluster::handler::HandlerRegistry;
    use crate::cluster::transport::LocalNetwork;

    struct Fixture {
        router: ClusterRouter,
        remote: Arc<HandlerRegistry>,
        network: Arc<LocalNetwork>,
        metrics: Arc<ClusterMetrics>,
    }

    /// Node 1 routes; node 2 owns every shard.
    fn fixture(timeout: Duration) -> Fixture {
        let config = ClusterConfig::new(1).with_max_shards(8).with_route_timeout(timeout);
        let network = LocalNetwork::new();
        let remote = Arc::new(HandlerRegistry::new());
        network.register(Arc::new(ClusterDispatcher::builder(2, remote.clone()).build()));

        let metrics = Arc::new(ClusterMetrics::default());
        let shards = Arc::new(ShardTable::new(1, 8, metrics.clone()).unwrap());
        let mut rebalance = ShardRebalance::default();
        rebalance.to_start.insert(2, (0..8).collect());
        shards.apply_rebalance(&rebalance);

        let router = ClusterRouter::new(
            config,
            shards,
            Arc::new(network.transport(1)),
            Arc::new(SnapshotCodec::new()),
            metrics.clone(),
        )
        .unwrap();
        Fixture {
            router,
            remote,
            network,
            metrics,
        }
    }

    #[test]
    fn test_shard_for_key_is_stable_and_in_range() {
        let f = fixture(Duration::from_secs(1));
        for key in ["a", "user-1", "user-2", ""] {
            let shard = f.router.shard_for_key(key);
            assert!(shard < 8);
            assert_eq!(shard, f.router.shard_for_key(key));
        }
    }

    #[test]
    fn test_route_roundtrip() {
        let f = fixture(Duration::from_secs(1));
        f.remote
            .register_route::<String, String, _>("greet", |name| Async::result(format!("hi {}", name)))
            .unwrap();
        let reply: String = f
            .router
            .route("greet", "user-1", &"ada".to_string())
            .join()
            .unwrap();
        assert_eq!(reply, "hi ada");
        assert_eq!(f.metrics.routes.get(), 1);
    }

    #[test]
    fn test_remote_error_reconstructed() {
        let f = fixture(Duration::from_secs(1));
        f.remote
            .register_route::<u32, u32, _>("check", |_| Async::rejected(AsyncError::illegal_state("closed")))
            .unwrap();
        let err = f.router.route::<u32, u32>("check", "k", &1).join().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
        assert_eq!(err.message(), "closed");
        assert_eq!(f.metrics.route_failures.get(), 1);
    }

    #[test]
    fn test_partition_times_out() {
        let f = fixture(Duration::from_millis(30));
        f.remote
            .register_route::<u32, u32, _>("echo", |v| Async::result(v))
            .unwrap();
        f.network.partition(1, 2);
        let err = f.router.route::<u32, u32>("echo", "k", &1).join().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RouteTimeout);
        assert_eq!(err.cause().map(|c| c.kind()), Some(ErrorKind::Timeout));
        assert_eq!(f.metrics.route_timeouts.get(), 1);
        f.network.heal();
    }

    #[test]
    fn test_unassigned_shard() {
        let config = ClusterConfig::new(1).with_max_shards(8);
        let metrics = Arc::new(ClusterMetrics::default());
        let router = ClusterRouter::new(
            config,
            Arc::new(ShardTable::new(1, 8, metrics.clone()).unwrap()),
            Arc::new(LocalNetwork::new().transport(1)),
            Arc::new(SnapshotCodec::new()),
            metrics,
        )
        .unwrap();
        assert!(matches!(router.node_for_key("k"), Err(Error::ShardUnassigned(_))));
        assert!(router.route::<u32, u32>("echo", "k", &1).is_rejected());
    }

    #[test]
    fn test_new_rejects_invalid_shard_config() {
        let metrics = Arc::new(ClusterMetrics::default());
        let router = |config: ClusterConfig, table_shards: u32| {
            ClusterRouter::new(
                config,
                Arc::new(ShardTable::new(1, table_shards, metrics.clone()).unwrap()),
                Arc::new(LocalNetwork::new().transport(1)),
                Arc::new(SnapshotCodec::new()),
                metrics.clone(),
            )
        };
        let zero = ClusterConfig::new(1).with_max_shards(0);
        assert!(matches!(router(zero, 8), Err(Error::Config(_))));
        assert!(matches!(
            router(ClusterConfig::new(1).with_max_shards(16), 8),
            Err(Error::Config(_))
        ));
    }
}

//! Basic example: coroutines, context propagation, a keyed queue and a
//! routed request across an in-process three-node cluster.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use strand::runtime::{Async, AsyncExecutor, AsyncLocal, AsyncQueue, SnapshotCodec, TokioExecutor};
use strand::testing::TestCluster;
use strand::ClusterConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Deposit {
    account: String,
    amount: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter("strand=debug,info")
        .init();

    let handle = TokioExecutor::current().ok_or("not inside a tokio runtime")?;
    let executor = AsyncExecutor::new("tokio", handle);
    let tenant = AsyncLocal::<String>::new("tenant");

    // --- Coroutines ---
    println!("--- Coroutines ---");
    let greeting = tenant.exec("acme".to_string(), || {
        let tenant = tenant.clone();
        executor.exec(move || async move {
            AsyncExecutor::sleep(Duration::from_millis(10)).await?;
            Ok(format!(
                "hello from {} on {:?}",
                tenant.get().unwrap_or_default(),
                AsyncExecutor::get().map(|e| e.name().to_string())
            ))
        })
    })?;
    println!("{}", greeting.await?);

    // --- Keyed queue ---
    println!("\n--- Keyed queue ---");
    let queue = AsyncQueue::new();
    let steps: Vec<Async<String>> = (1..=3)
        .map(|i| {
            queue.exec("account-1", move || async move {
                AsyncExecutor::sleep(Duration::from_millis(5)).await?;
                Ok(format!("step {}", i))
            })
        })
        .collect();
    for step in steps {
        println!("{}", step.await?);
    }

    // --- Cluster routing ---
    println!("\n--- Cluster routing ---");
    let codec = SnapshotCodec::new().with(&tenant)?;
    let config = ClusterConfig::default().with_route_timeout(Duration::from_secs(2));
    let cluster = TestCluster::with_config(3, config, codec)?;
    cluster.settle()?;

    for node in cluster.nodes() {
        let node_id = node.node_id;
        let tenant = tenant.clone();
        node.registry
            .register_route::<Deposit, String, _>("account.deposit", move |deposit| {
                Async::result(format!(
                    "node {} credited {} to {} for {}",
                    node_id,
                    deposit.amount,
                    deposit.account,
                    tenant.get().unwrap_or_default()
                ))
            })?;
    }

    let router = &cluster.node(1).ok_or("node 1 missing")?.router;
    for account in ["alice", "bob", "carol"] {
        let deposit = Deposit {
            account: account.to_string(),
            amount: 100,
        };
        let reply: String = tenant
            .exec("acme".to_string(), || {
                router.route("account.deposit", account, &deposit)
            })?
            .await?;
        println!("{} (shard {})", reply, router.shard_for_key(account));
    }

    let metrics = cluster.node(1).ok_or("node 1 missing")?.metrics.snapshot();
    println!("\nRouter metrics:");
    println!("  Routes: {}", metrics.routes);
    println!("  Error rate: {:.2}", metrics.route_error_rate());
    println!("  Mean latency: {:.6}s", metrics.route_latency.mean());

    Ok(())
}

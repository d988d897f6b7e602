//! In-process cluster tests.
//!
//! # Test Strategy
//!
//! 1. **Join and leave**: migration events, table convergence and replica
//!    state across members
//! 2. **Split-brain**: confirmed splits fail parked invocations with
//!    `MemberLeft`; merges drain the parker
//! 3. **Partial split**: unconfirmed suspicion leaves parked work intact
//! 4. **Lifecycle**: service state, listener handles, shutdown

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::config::{
    ExecutorConfig, InvocationConfig, MigrationConfig, ParkerConfig, ReplicaSyncConfig,
};
use corelib::{
    Address, GridConfig, InMemoryMembership, Member, MemberList, MembershipService, PartitionId,
};
use grid::{GridError, LocalNetwork, NodeEngine, PartitionServiceState};
use invocation::{InvocationError, Operation, OperationContext, OperationError, Response, WaitKey};
use migration::{MigrationEvent, MigrationListener};
use parking_lot::Mutex;

fn addr(host: &str) -> Address {
    Address::new(host, 5701)
}

fn config() -> GridConfig {
    GridConfig {
        partition_count: 10,
        backup_count: 1,
        executor: ExecutorConfig {
            partition_threads: 2,
        },
        migration: MigrationConfig {
            copy_retry_delay: Duration::from_millis(1),
            ..MigrationConfig::default()
        },
        replica_sync: ReplicaSyncConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            parallelism: 4,
        },
        invocation: InvocationConfig {
            retry_budget: 100,
            retry_pause: Duration::from_millis(5),
            call_timeout: Duration::from_secs(5),
        },
        parker: ParkerConfig {
            expiry_scan_interval: Duration::from_millis(10),
        },
    }
}

/// Membership view of `local` containing `members` in join order.
fn view(local: &str, members: &[&str]) -> Arc<InMemoryMembership> {
    let view = Arc::new(InMemoryMembership::new(Member::new(addr(local), local)));
    view.merge_from(&MemberList {
        version: 1,
        members: members
            .iter()
            .map(|host| Member::new(addr(host), *host))
            .collect(),
    });
    view
}

struct Cluster {
    network: Arc<LocalNetwork>,
    views: HashMap<&'static str, Arc<InMemoryMembership>>,
    engines: HashMap<&'static str, Arc<NodeEngine>>,
}

impl Cluster {
    fn start(hosts: &[&'static str]) -> Self {
        let network = LocalNetwork::new();
        let mut views = HashMap::new();
        let mut engines = HashMap::new();
        for host in hosts {
            let membership = view(host, hosts);
            let engine =
                NodeEngine::start(config(), addr(host), membership.clone(), network.clone())
                    .unwrap();
            views.insert(*host, membership);
            engines.insert(*host, engine);
        }
        Self {
            network,
            views,
            engines,
        }
    }

    fn engine(&self, host: &str) -> &Arc<NodeEngine> {
        &self.engines[host]
    }

    fn view(&self, host: &str) -> &Arc<InMemoryMembership> {
        &self.views[host]
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for engine in self.engines.values() {
            engine.shutdown();
        }
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Default)]
struct Recorder {
    started: Mutex<HashMap<PartitionId, u32>>,
    completed: Mutex<HashMap<PartitionId, u32>>,
    failed: Mutex<HashMap<PartitionId, u32>>,
}

impl Recorder {
    fn total(map: &Mutex<HashMap<PartitionId, u32>>) -> u32 {
        map.lock().values().sum()
    }
}

impl MigrationListener for Recorder {
    fn migration_started(&self, event: &MigrationEvent) {
        *self.started.lock().entry(event.partition_id).or_default() += 1;
    }

    fn migration_completed(&self, event: &MigrationEvent) {
        *self.completed.lock().entry(event.partition_id).or_default() += 1;
    }

    fn migration_failed(&self, event: &MigrationEvent) {
        *self.failed.lock().entry(event.partition_id).or_default() += 1;
    }
}

// ============================================================================
// Operations
// ============================================================================

fn latch_key() -> WaitKey {
    WaitKey::new("latch", "l")
}

/// Waits until the latch is open.
struct Await {
    open: Arc<AtomicI64>,
}

impl Operation for Await {
    fn service_name(&self) -> &str {
        "latch"
    }

    fn run(&self, _: &OperationContext) -> Result<Response, OperationError> {
        Ok(Bytes::from_static(b"opened"))
    }

    fn wait_key(&self) -> Option<WaitKey> {
        Some(latch_key())
    }

    fn should_wait(&self, _: &OperationContext) -> bool {
        self.open.load(Ordering::SeqCst) == 0
    }
}

struct Open {
    open: Arc<AtomicI64>,
}

impl Operation for Open {
    fn service_name(&self) -> &str {
        "latch"
    }

    fn run(&self, _: &OperationContext) -> Result<Response, OperationError> {
        self.open.store(1, Ordering::SeqCst);
        Ok(Bytes::new())
    }

    fn notified_key(&self) -> Option<WaitKey> {
        Some(latch_key())
    }

    fn is_mutating(&self) -> bool {
        true
    }
}

// ============================================================================
// Join Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_moves_half_the_partitions() {
    let network = LocalNetwork::new();
    let a_view = view("a", &["a"]);
    let a = NodeEngine::start(config(), addr("a"), a_view.clone(), network.clone()).unwrap();
    assert!(a.is_master());
    assert_eq!(a.partition_table().partitions_owned_by(&addr("a")).len(), 10);

    let recorder = Arc::new(Recorder::default());
    a.add_migration_listener(Some(recorder.clone())).unwrap();

    let b_view = view("b", &["a", "b"]);
    let b = NodeEngine::start(config(), addr("b"), b_view, network.clone()).unwrap();
    assert!(!b.is_master());
    assert_eq!(b.partition_table().partitions(), a.partition_table().partitions());

    a_view.add_member(Member::new(addr("b"), "b"));
    eventually(|| Recorder::total(&recorder.completed) == 5).await;
    assert!(a.coordinator().await_idle(Duration::from_secs(5)).await);

    assert_eq!(Recorder::total(&recorder.started), 5);
    assert_eq!(Recorder::total(&recorder.failed), 0);
    for count in recorder.started.lock().values() {
        assert_eq!(*count, 1);
    }

    // the master published every commit
    assert_eq!(b.partition_table().partitions_owned_by(&addr("b")).len(), 5);
    assert_eq!(b.partition_table().partitions(), a.partition_table().partitions());
    for (id, slots) in a.partition_table().replica_addresses() {
        let mut holders: Vec<Address> = slots.into_iter().flatten().collect();
        holders.sort();
        assert_eq!(holders, vec![addr("a"), addr("b")], "partition {id}");
    }

    eventually(|| a.partition_service_state() == PartitionServiceState::Safe).await;
    assert!(a.get_owned_replica_versions().iter().all(|v| !v.is_dirty()));
    assert_eq!(a.get_migration_queue_size(), 0);

    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_operations_follow_the_new_owner() {
    let cluster = Cluster::start(&["a", "b"]);
    let a = cluster.engine("a");
    let b = cluster.engine("b");

    for p in 0..10 {
        let pid = PartitionId(p);
        let owner = a.partition_table().owner_of(pid).unwrap().unwrap();
        let open = Arc::new(AtomicI64::new(0));
        b.invoke_on_partition("latch", Arc::new(Open { open }), pid)
            .await
            .unwrap();
        let versions = cluster.engine(owner.host()).get_replica_versions(pid).unwrap();
        assert_eq!(versions.owner_version(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shrink_below_backup_count_returns_to_safe() {
    // syncs never come due, so only the departure can clear dirty backups
    let slow = GridConfig {
        replica_sync: ReplicaSyncConfig {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            parallelism: 4,
        },
        ..config()
    };
    let network = LocalNetwork::new();
    let a_view = view("a", &["a"]);
    let a = NodeEngine::start(slow.clone(), addr("a"), a_view.clone(), network.clone()).unwrap();
    let b = NodeEngine::start(slow, addr("b"), view("b", &["a", "b"]), network.clone()).unwrap();
    a_view.add_member(Member::new(addr("b"), "b"));
    eventually(|| a.partition_table().partitions_owned_by(&addr("b")).len() == 5).await;
    assert!(a.coordinator().await_idle(Duration::from_secs(5)).await);
    assert_eq!(a.partition_service_state(), PartitionServiceState::ReplicaNotSync);

    b.shutdown();
    a_view.remove_member(&addr("b"));

    eventually(|| a.partition_service_state() == PartitionServiceState::Safe).await;
    assert!(a.get_owned_replica_versions().iter().all(|v| !v.is_dirty()));
    assert_eq!(a.partition_table().partitions_owned_by(&addr("a")).len(), 10);
    for (id, slots) in a.partition_table().replica_addresses() {
        assert_eq!(slots, vec![Some(addr("a")), None], "partition {id}");
    }
    a.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departed_backup_leaves_every_table() {
    let cluster = Cluster::start(&["a", "b", "c"]);
    let a = cluster.engine("a");
    let b = cluster.engine("b");

    cluster.engine("c").shutdown();
    for host in ["a", "b"] {
        cluster.view(host).remove_member(&addr("c"));
    }

    eventually(|| {
        b.partition_table()
            .replica_addresses()
            .values()
            .all(|slots| !slots.contains(&Some(addr("c"))))
    })
    .await;
    assert!(a.coordinator().await_idle(Duration::from_secs(5)).await);
    eventually(|| b.partition_table().partitions() == a.partition_table().partitions()).await;
    eventually(|| a.partition_service_state() == PartitionServiceState::Safe).await;
}

// ============================================================================
// Split-brain Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_confirmed_split_fails_parked_invocation_and_merge_drains_parker() {
    let cluster = Cluster::start(&["a", "b", "c"]);
    let a = cluster.engine("a");
    let c = cluster.engine("c");
    let pid = a.partition_table().partitions_owned_by(&addr("c"))[0];

    let waiting = a.invoke_on_partition(
        "latch",
        Arc::new(Await {
            open: Arc::new(AtomicI64::new(0)),
        }),
        pid,
    );
    eventually(|| c.get_total_parked_operation_count() == 1).await;

    cluster
        .network
        .split(&[addr("a"), addr("b")], &[addr("c")]);
    for host in ["a", "b"] {
        cluster.view(host).remove_member(&addr("c"));
    }
    for host in ["a", "b"] {
        cluster.view("c").remove_member(&addr(host));
    }

    let err = waiting.await.unwrap_err();
    assert_eq!(err, InvocationError::MemberLeft { target: addr("c") });
    eventually(|| c.get_total_parked_operation_count() == 0).await;
    assert_eq!(a.cluster_size(), 2);
    assert_eq!(cluster.engine("b").cluster_size(), 2);
    assert_eq!(c.cluster_size(), 1);

    // both sides repair ownership on their own
    eventually(|| a.partition_table().partitions_owned_by(&addr("c")).is_empty()).await;
    eventually(|| c.partition_table().partitions_owned_by(&addr("c")).len() == 10).await;
    assert!(a.coordinator().await_idle(Duration::from_secs(5)).await);
    assert!(c.coordinator().await_idle(Duration::from_secs(5)).await);

    cluster.network.heal();
    c.merge(&a.member_list()).await.unwrap();
    for host in ["a", "b"] {
        cluster.view(host).add_member(Member::new(addr("c"), "c"));
    }

    for host in ["a", "b", "c"] {
        let engine = cluster.engine(host);
        eventually(|| engine.cluster_size() == 3).await;
    }
    assert_eq!(c.get_total_parked_operation_count(), 0);
    assert!(!c.is_master());

    eventually(|| !c.partition_table().partitions_owned_by(&addr("c")).is_empty()).await;
    assert!(a.coordinator().await_idle(Duration::from_secs(5)).await);
    assert_eq!(c.partition_table().partitions(), a.partition_table().partitions());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unconfirmed_split_lets_parked_invocation_succeed() {
    let cluster = Cluster::start(&["a", "b", "c"]);
    let a = cluster.engine("a");
    let c = cluster.engine("c");
    let pid = a.partition_table().partitions_owned_by(&addr("c"))[0];
    let open = Arc::new(AtomicI64::new(0));

    let waiting = a.invoke_on_partition("latch", Arc::new(Await { open: open.clone() }), pid);
    eventually(|| c.get_total_parked_operation_count() == 1).await;

    // b loses sight of c for a moment; nobody confirms it
    cluster.network.disconnect(&addr("b"), &addr("c"));
    cluster.view("b").suspect_member(&addr("c"), false);
    cluster.network.heal();
    cluster.view("b").clear_suspicion(&addr("c"));

    a.invoke_on_partition("latch", Arc::new(Open { open }), pid)
        .await
        .unwrap();
    assert_eq!(waiting.await.unwrap(), Bytes::from_static(b"opened"));
    assert_eq!(c.get_total_parked_operation_count(), 0);
    for host in ["a", "b", "c"] {
        assert_eq!(cluster.engine(host).cluster_size(), 3);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_merge_of_healthy_member_is_immediate() {
    let cluster = Cluster::start(&["a", "b"]);
    let b = cluster.engine("b");
    b.merge(&cluster.engine("a").member_list()).await.unwrap();
    assert_eq!(b.cluster_size(), 2);
    assert_eq!(b.get_total_parked_operation_count(), 0);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_handles() {
    let cluster = Cluster::start(&["a"]);
    let a = cluster.engine("a");

    assert!(a.add_migration_listener(None).is_err());
    let recorder = Arc::new(Recorder::default());
    let first = a.add_migration_listener(Some(recorder.clone())).unwrap();
    let second = a.add_migration_listener(Some(recorder)).unwrap();
    assert_ne!(first, second);
    assert!(a.remove_migration_listener(first));
    assert!(!a.remove_migration_listener(first));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_membership_view_must_match_address() {
    let network = LocalNetwork::new();
    let err = NodeEngine::start(config(), addr("b"), view("a", &["a"]), network).unwrap_err();
    assert!(matches!(
        err,
        GridError::Core(corelib::Error::InvalidArgument(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_leaves_the_network() {
    let cluster = Cluster::start(&["a", "b"]);
    let b = cluster.engine("b");
    assert!(cluster.network.is_registered(&addr("b")));
    b.shutdown();
    assert!(!cluster.network.is_registered(&addr("b")));
    assert_eq!(b.merge(&b.member_list()).await.unwrap_err(), GridError::Stopped);
}

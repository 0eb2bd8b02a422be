//! End-to-end replication tests over an in-process cluster.
//!
//! Each test wires several nodes onto one in-memory bus with a local
//! controller, then exercises the publish/replicate/subscribe path through
//! leader failures, restarts, and reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rivulet_common::{AckPolicy, Message, ReplicationConfig, StartPosition, StreamId};
use rivulet_log::state::StateFile;
use rivulet_log::{CommitLog, LogConfig};
use rivulet_replica::{
    Controller, LocalController, Node, PublishAck, PublishOptions, ReplicaError, StreamClient,
};
use rivulet_transport::{InMemoryBus, MessageBus};
use tempfile::TempDir;

struct TestCluster {
    bus: Arc<InMemoryBus>,
    controller: Arc<LocalController>,
    config: ReplicationConfig,
    data_root: TempDir,
    nodes: HashMap<String, Arc<Node>>,
}

impl TestCluster {
    async fn start(node_ids: &[&str], config: ReplicationConfig) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let mut cluster = Self {
            bus: Arc::new(InMemoryBus::new()),
            controller: Arc::new(LocalController::new()),
            config,
            data_root: TempDir::new().unwrap(),
            nodes: HashMap::new(),
        };
        for id in node_ids {
            cluster.start_node(id);
        }
        cluster
    }

    fn start_node(&mut self, id: &str) {
        let node_id = id.to_string();
        let events = self.controller.register_node(&node_id);
        let bus: Arc<dyn MessageBus> = Arc::clone(&self.bus) as Arc<dyn MessageBus>;
        let controller: Arc<dyn Controller> = Arc::clone(&self.controller) as Arc<dyn Controller>;
        let node = Node::start(
            node_id.clone(),
            self.data_root.path().join(id),
            self.config.clone(),
            bus,
            controller,
            events,
        );
        self.nodes.insert(node_id, node);
    }

    async fn stop_node(&mut self, id: &str) {
        let node = self.nodes.remove(id).expect("node not running");
        self.controller.set_node_online(&id.to_string(), false);
        node.shutdown().await;
    }

    fn node(&self, id: &str) -> Arc<Node> {
        Arc::clone(&self.nodes[id])
    }

    fn client(&self) -> StreamClient {
        StreamClient::new(Arc::clone(&self.bus) as Arc<dyn MessageBus>)
    }

    fn create_stream(&self, subject: &str, name: &str, replicas: &[&str]) -> StreamId {
        let stream = StreamId::new(subject, name);
        self.controller.create_stream(
            stream.clone(),
            replicas.iter().map(|id| id.to_string()).collect(),
        );
        stream
    }

    fn stream_dir(&self, node_id: &str, stream: &StreamId) -> std::path::PathBuf {
        self.data_root
            .path()
            .join(node_id)
            .join(&stream.subject)
            .join(&stream.name)
    }

    async fn wait_for_leader(&self, stream: &StreamId, timeout: Duration) -> String {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some((leader, _)) = self.controller.stream_leader(stream) {
                if let Some(node) = self.nodes.get(&leader) {
                    if let Some(replica) = node.stream(stream) {
                        if replica.is_leader().await {
                            return leader;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        panic!("no leader for {stream} within {timeout:?}");
    }

    async fn wait_for_hw(&self, stream: &StreamId, hw: i64, node_ids: &[&str], timeout: Duration) {
        let deadline = Instant::now() + timeout;
        'poll: while Instant::now() < deadline {
            for id in node_ids {
                let caught_up = self
                    .nodes
                    .get(*id)
                    .and_then(|node| node.stream(stream))
                    .is_some_and(|replica| replica.high_watermark() >= hw);
                if !caught_up {
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    continue 'poll;
                }
            }
            return;
        }
        panic!("cluster did not reach HW {hw} for {stream} within {timeout:?}");
    }

    async fn wait_for_isr(&self, stream: &StreamId, size: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self
                .controller
                .stream_isr(stream)
                .is_some_and(|isr| isr.len() == size)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        panic!("ISR did not reach size {size} for {stream} within {timeout:?}");
    }

    async fn read_messages(
        &self,
        node_id: &str,
        stream: &StreamId,
        count: usize,
        timeout: Duration,
    ) -> Vec<Message> {
        let deadline = Instant::now() + timeout;
        let mut sub = self
            .node(node_id)
            .subscribe(stream, StartPosition::Earliest)
            .unwrap();
        let mut messages = Vec::with_capacity(count);
        while messages.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, sub.next()).await {
                Ok(Some(Ok(message))) => messages.push(message),
                Ok(Some(Err(e))) => panic!("subscription error after {} messages: {e}", messages.len()),
                Ok(None) => panic!("subscription ended after {} messages", messages.len()),
                Err(_) => panic!(
                    "timed out with {}/{count} messages from {node_id}",
                    messages.len()
                ),
            }
        }
        messages
    }
}

fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        replica_max_lag_time_ms: 1_000,
        replica_fetch_timeout_ms: 250,
        replica_max_leader_timeout_ms: 1_000,
        hw_checkpoint_interval_ms: 100,
        ..ReplicationConfig::default()
    }
}

async fn publish_value(
    client: &StreamClient,
    subject: &str,
    value: &str,
    ack_policy: AckPolicy,
) -> Option<PublishAck> {
    client
        .publish(
            subject,
            PublishOptions {
                value: value.as_bytes().to_vec(),
                ack_policy,
                timeout: Duration::from_secs(5),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap()
}

/// Messages are replicated and the stream fails over when the leader dies.
#[tokio::test(flavor = "multi_thread")]
async fn test_leader_failover() {
    let mut cluster = TestCluster::start(&["a", "b", "c"], test_config()).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b", "c"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;

    let client = cluster.client();
    for i in 0..100i64 {
        let ack = client
            .publish(
                "foo",
                PublishOptions {
                    key: Some(b"bar".to_vec()),
                    value: i.to_string().into_bytes(),
                    ack_policy: AckPolicy::All,
                    timeout: Duration::from_secs(5),
                    ..PublishOptions::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.offset, i);
    }

    cluster
        .wait_for_hw(&stream, 99, &["a", "b", "c"], Duration::from_secs(5))
        .await;

    // Kill the leader and wait for a survivor to take over.
    cluster.stop_node(&leader).await;
    let new_leader = cluster.wait_for_leader(&stream, Duration::from_secs(10)).await;
    assert_ne!(new_leader, leader);

    let messages = cluster
        .read_messages(&new_leader, &stream, 100, Duration::from_secs(10))
        .await;
    for (i, message) in messages.iter().enumerate() {
        assert_eq!(message.offset, i as i64);
        assert_eq!(message.key.as_deref(), Some(b"bar".as_ref()));
        assert_eq!(message.value, i.to_string().into_bytes());
    }
}

/// The leader commits once the ISR shrinks past a dead follower.
#[tokio::test(flavor = "multi_thread")]
async fn test_commit_on_isr_shrink() {
    let mut cluster = TestCluster::start(&["a", "b", "c"], test_config()).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b", "c"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;

    let follower = ["a", "b", "c"]
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();
    cluster.stop_node(follower).await;

    // This publish cannot commit until the dead follower leaves the ISR.
    let client = cluster.client();
    let pending = tokio::spawn(async move {
        client
            .publish(
                "foo",
                PublishOptions {
                    value: b"hello".to_vec(),
                    ack_policy: AckPolicy::All,
                    timeout: Duration::from_secs(10),
                    ..PublishOptions::default()
                },
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!pending.is_finished(), "received unexpected early ack");

    let ack = tokio::time::timeout(Duration::from_secs(10), pending)
        .await
        .expect("did not receive ack after ISR shrink")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(ack.offset, 0);
    cluster.wait_for_isr(&stream, 2, Duration::from_secs(5)).await;
}

/// A LEADER-policy publish acks promptly even with a dead ISR member, and
/// echoes the caller's correlation id.
#[tokio::test(flavor = "multi_thread")]
async fn test_ack_policy_leader_with_dead_follower() {
    let mut cluster = TestCluster::start(&["a", "b", "c"], test_config()).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b", "c"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;

    let follower = ["a", "b", "c"]
        .into_iter()
        .find(|id| *id != leader)
        .unwrap();
    cluster.stop_node(follower).await;

    let client = cluster.client();
    let started = Instant::now();
    let ack = client
        .publish(
            "foo",
            PublishOptions {
                value: b"hello".to_vec(),
                ack_policy: AckPolicy::Leader,
                correlation_id: Some("cid".to_string()),
                timeout: Duration::from_secs(5),
                ..PublishOptions::default()
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack.correlation_id, "cid");
    assert_eq!(ack.offset, 0);
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// Messages appended but uncommitted before a full restart still commit once
/// the cluster reassembles.
#[tokio::test(flavor = "multi_thread")]
async fn test_commit_on_restart() {
    let mut config = test_config();
    config.min_isr = 2;
    config.replica_max_lag_time_ms = 2_000;
    let mut cluster = TestCluster::start(&["a", "b"], config).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;
    let follower = if leader == "a" { "b" } else { "a" };

    let client = cluster.client();
    for _ in 0..5 {
        publish_value(&client, "foo", "hello", AckPolicy::All)
            .await
            .unwrap();
    }

    cluster.stop_node(follower).await;

    // These are appended on the leader but cannot commit yet.
    for _ in 0..5 {
        publish_value(&client, "foo", "hello", AckPolicy::None).await;
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let newest = cluster.node(&leader).stream(&stream).unwrap().newest_offset();
        if newest == 9 {
            break;
        }
        assert!(Instant::now() < deadline, "leader never appended, newest={newest}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Full restart: leader first, then the follower.
    cluster.stop_node(&leader).await;
    cluster.start_node(&leader);
    cluster.start_node(follower);

    cluster.wait_for_leader(&stream, Duration::from_secs(10)).await;
    cluster
        .wait_for_hw(&stream, 9, &["a", "b"], Duration::from_secs(10))
        .await;

    for id in ["a", "b"] {
        let messages = cluster
            .read_messages(id, &stream, 10, Duration::from_secs(10))
            .await;
        let offsets: Vec<_> = messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, (0..10).collect::<Vec<_>>());
    }
}

/// A follower that restarts with a stale high watermark keeps its log through
/// the epoch handshake and can immediately take over as leader without losing
/// committed messages.
#[tokio::test(flavor = "multi_thread")]
async fn test_truncate_fast_leader_election() {
    let mut cluster = TestCluster::start(&["a", "b", "c"], test_config()).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b", "c"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;

    let client = cluster.client();
    publish_value(&client, "foo", "hello", AckPolicy::All)
        .await
        .unwrap();
    publish_value(&client, "foo", "world", AckPolicy::All)
        .await
        .unwrap();
    cluster
        .wait_for_hw(&stream, 1, &["a", "b", "c"], Duration::from_secs(5))
        .await;

    let followers: Vec<&str> = ["a", "b", "c"]
        .into_iter()
        .filter(|id| *id != leader)
        .collect();

    // Restart both followers with their high watermark forced back to 0, as
    // if they crashed before learning the leader committed offset 1.
    for id in &followers {
        cluster.stop_node(id).await;
        let state_file = StateFile::new(&cluster.stream_dir(id, &stream));
        let mut state = state_file.load().unwrap().unwrap();
        state.high_watermark = 0;
        state_file.store(&state).unwrap();
        cluster.start_node(id);
    }

    // Force an election among the followers.
    cluster.stop_node(&leader).await;
    let new_leader = cluster.wait_for_leader(&stream, Duration::from_secs(10)).await;
    assert!(followers.contains(&new_leader.as_str()));

    // The handshake must have preserved both committed messages.
    let replica = cluster.node(&new_leader).stream(&stream).unwrap();
    assert_eq!(replica.log().oldest_offset(), 0);
    assert_eq!(replica.newest_offset(), 1);

    let messages = cluster
        .read_messages(&new_leader, &stream, 2, Duration::from_secs(10))
        .await;
    assert_eq!(messages[0].value, b"hello");
    assert_eq!(messages[1].value, b"world");
}

/// Log lineages do not diverge across multiple hard failures: an uncommitted
/// suffix on a dead leader is truncated when it rejoins, and every replica
/// converges on the new leader's history.
#[tokio::test(flavor = "multi_thread")]
async fn test_truncate_prevents_replica_divergence() {
    let mut config = test_config();
    config.replica_max_lag_time_ms = 2_000;
    let mut cluster = TestCluster::start(&["a", "b", "c"], config).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b", "c"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;

    let client = cluster.client();
    publish_value(&client, "foo", "hello", AckPolicy::All)
        .await
        .unwrap();
    publish_value(&client, "foo", "world", AckPolicy::All)
        .await
        .unwrap();
    cluster
        .wait_for_hw(&stream, 1, &["a", "b", "c"], Duration::from_secs(5))
        .await;

    let followers: Vec<&str> = ["a", "b", "c"]
        .into_iter()
        .filter(|id| *id != leader)
        .collect();

    // Simulate both followers crashing before replicating offset 1: reset
    // their high watermark to 0 and cut their logs back to it.
    for id in &followers {
        cluster.stop_node(id).await;
        let log = CommitLog::open(cluster.stream_dir(id, &stream), LogConfig::default()).unwrap();
        log.truncate(0).unwrap();
        log.close().unwrap();
    }

    // Kill the old leader while it still holds offset 1, then bring the
    // followers back so one of them takes over.
    cluster.stop_node(&leader).await;
    for id in &followers {
        cluster.start_node(id);
    }
    let new_leader = cluster.wait_for_leader(&stream, Duration::from_secs(10)).await;
    assert!(followers.contains(&new_leader.as_str()));
    cluster.wait_for_isr(&stream, 2, Duration::from_secs(10)).await;

    // New writes take the offsets the truncated suffix vacated.
    publish_value(&client, "foo", "goodnight", AckPolicy::All)
        .await
        .unwrap();
    publish_value(&client, "foo", "moon", AckPolicy::All)
        .await
        .unwrap();

    // The old leader rejoins and must truncate its orphaned "world".
    cluster.start_node(&leader);
    cluster
        .wait_for_hw(&stream, 2, &["a", "b", "c"], Duration::from_secs(10))
        .await;

    for id in ["a", "b", "c"] {
        let replica = cluster.node(id).stream(&stream).unwrap();
        assert_eq!(replica.log().oldest_offset(), 0, "oldest on {id}");
        assert_eq!(replica.newest_offset(), 2, "newest on {id}");

        let messages = cluster
            .read_messages(id, &stream, 3, Duration::from_secs(10))
            .await;
        let values: Vec<&[u8]> = messages.iter().map(|m| m.value.as_slice()).collect();
        assert_eq!(
            values,
            vec![b"hello".as_ref(), b"goodnight".as_ref(), b"moon".as_ref()],
            "log lineage on {id}"
        );
        assert_eq!(
            messages.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }
}

/// Publishes are rejected with a retriable error while the ISR is below the
/// configured minimum.
#[tokio::test(flavor = "multi_thread")]
async fn test_min_isr_gates_publishes() {
    let mut config = test_config();
    config.min_isr = 2;
    let mut cluster = TestCluster::start(&["a", "b"], config).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;
    let follower = if leader == "a" { "b" } else { "a" };

    cluster.stop_node(follower).await;
    cluster.wait_for_isr(&stream, 1, Duration::from_secs(5)).await;

    let client = cluster.client();
    let result = client
        .publish(
            "foo",
            PublishOptions {
                value: b"rejected".to_vec(),
                ack_policy: AckPolicy::Leader,
                timeout: Duration::from_secs(2),
                ..PublishOptions::default()
            },
        )
        .await;
    assert!(matches!(result, Err(ReplicaError::TransientUnavailable(_))));
}

/// Subscriptions honor every start position.
#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_start_positions() {
    let mut cluster = TestCluster::start(&["a"], test_config()).await;
    let stream = cluster.create_stream("foo", "foo", &["a"]);
    let leader = cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;

    let client = cluster.client();
    for i in 0..5 {
        publish_value(&client, "foo", &format!("v{i}"), AckPolicy::All)
            .await
            .unwrap();
    }
    cluster
        .wait_for_hw(&stream, 4, &["a"], Duration::from_secs(5))
        .await;
    let node = cluster.node(&leader);

    let mut from_offset = node.subscribe(&stream, StartPosition::Offset(2)).unwrap();
    assert_eq!(from_offset.next().await.unwrap().unwrap().offset, 2);

    let mut from_latest = node.subscribe(&stream, StartPosition::Latest).unwrap();
    assert_eq!(from_latest.next().await.unwrap().unwrap().offset, 4);

    let mut from_new = node.subscribe(&stream, StartPosition::NewOnly).unwrap();
    // Give the next message a strictly later timestamp for the lookup below.
    tokio::time::sleep(Duration::from_millis(10)).await;
    publish_value(&client, "foo", "v5", AckPolicy::All)
        .await
        .unwrap();
    assert_eq!(from_new.next().await.unwrap().unwrap().offset, 5);

    let timestamp = from_latest.next().await.unwrap().unwrap().timestamp;
    let mut from_ts = node
        .subscribe(&stream, StartPosition::Timestamp(timestamp))
        .unwrap();
    assert_eq!(from_ts.next().await.unwrap().unwrap().offset, 5);
}

/// Deleting a stream tears down its replicas and storage.
#[tokio::test(flavor = "multi_thread")]
async fn test_delete_stream() {
    let mut cluster = TestCluster::start(&["a", "b"], test_config()).await;
    let stream = cluster.create_stream("foo", "foo", &["a", "b"]);
    cluster.wait_for_leader(&stream, Duration::from_secs(5)).await;

    let client = cluster.client();
    publish_value(&client, "foo", "hello", AckPolicy::All)
        .await
        .unwrap();

    cluster.controller.delete_stream(&stream);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let gone = ["a", "b"]
            .iter()
            .all(|id| cluster.node(id).stream(&stream).is_none());
        if gone {
            break;
        }
        assert!(Instant::now() < deadline, "stream was not deleted");
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
    assert!(!cluster.stream_dir("a", &stream).exists());
}

use actors::ActorSystem;
use cluster::{ClusterTransport, InMemoryCluster, NodeAddress, SimulatedNode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver};
use topic_relay::{
    event_frame, relay_channel, spawn_topic_relay, Delivery, ReconciledView, RelayError,
    RelaySettings, TopicEvent, TopicRelayHandle,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum RosterEvent {
    Joined(String),
    Left(String),
}

/// Users known cluster-wide, with the node they joined on
#[derive(Default)]
struct Roster {
    users: BTreeMap<String, NodeAddress>,
}

impl ReconciledView<RosterEvent> for Roster {
    type Snapshot = BTreeSet<String>;

    fn admit(&self, payload: &RosterEvent, _origin: &NodeAddress) -> Result<(), String> {
        match payload {
            RosterEvent::Joined(name) if self.users.contains_key(name) => {
                Err(format!("username '{}' already in use", name))
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, event: &TopicEvent<RosterEvent>) -> bool {
        match &event.payload {
            RosterEvent::Joined(name) => {
                if self.users.contains_key(name) {
                    return false;
                }
                self.users.insert(name.clone(), event.origin.clone());
                true
            }
            RosterEvent::Left(name) => self.users.remove(name).is_some(),
        }
    }

    fn snapshot(&self) -> BTreeSet<String> {
        self.users.keys().cloned().collect()
    }

    fn on_member_removed(&mut self, node: &NodeAddress) -> bool {
        let before = self.users.len();
        self.users.retain(|_, owner| owner != node);
        before != self.users.len()
    }
}

type RosterRelay = TopicRelayHandle<RosterEvent, BTreeSet<String>>;

struct TestNode {
    address: NodeAddress,
    relay: RosterRelay,
    _node: Arc<SimulatedNode>,
    _system: ActorSystem,
}

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("127.0.0.1", port)
}

fn quiet_settings() -> RelaySettings {
    RelaySettings {
        heartbeat_interval: None,
        ..RelaySettings::default()
    }
}

fn start_nodes(cluster: &InMemoryCluster, ports: &[u16], settings: RelaySettings) -> Vec<TestNode> {
    let nodes: Vec<Arc<SimulatedNode>> = ports
        .iter()
        .map(|port| cluster.join_up(addr(*port), Vec::<String>::new()).unwrap())
        .collect();
    nodes
        .into_iter()
        .map(|node| {
            let system = ActorSystem::new(&format!("node-{}", node.address().port));
            let relay =
                spawn_topic_relay(&system, &node.cluster_node(), "chat", settings.clone(), Roster::default)
                    .unwrap();
            TestNode {
                address: node.address().clone(),
                relay,
                _node: node,
                _system: system,
            }
        })
        .collect()
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

async fn next_delivery(inbox: &mut UnboundedReceiver<Delivery<RosterEvent>>) -> Delivery<RosterEvent> {
    tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("delivery within 2s")
        .expect("sink still open")
}

async fn connected(relay: &RosterRelay, topic: &str, id: &str) -> UnboundedReceiver<Delivery<RosterEvent>> {
    let mut inbox = relay.subscribe(topic, id).unwrap();
    assert_eq!(next_delivery(&mut inbox).await.event_type(), "connected");
    inbox
}

#[tokio::test]
async fn test_subscribe_yields_one_connected_event() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551], quiet_settings());
    let relay = &nodes[0].relay;

    let mut inbox = relay.subscribe("events", "sub-1").unwrap();
    match next_delivery(&mut inbox).await {
        Delivery::Connected {
            subscriber_id,
            node,
            data,
            ..
        } => {
            assert_eq!(subscriber_id, "sub-1");
            assert_eq!(node, nodes[0].address);
            assert!(data.contains("sub-1"));
        }
        other => panic!("expected Connected, got {:?}", other),
    }

    // round trip through the mailbox, then nothing else is pending
    let subscribers = relay.subscribers().await.unwrap();
    assert_eq!(subscribers.len(), 1);
    assert_eq!(subscribers[0].id, "sub-1");
    assert_eq!(inbox.try_recv().unwrap_err(), TryRecvError::Empty);
}

#[tokio::test]
async fn test_unsubscribed_subscriber_gets_no_deliveries() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551], quiet_settings());
    let relay = &nodes[0].relay;

    let mut inbox = connected(relay, "events", "sub-1").await;
    relay.unsubscribe("events", "sub-1").unwrap();
    relay
        .publish_checked("events", RosterEvent::Joined("alice".into()))
        .await
        .unwrap();

    // the relay dropped the only sink, so the channel ends without an event
    assert!(inbox.recv().await.is_none());
    let stats = relay.stats().await.unwrap();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.local_subscribers, 0);
}

#[tokio::test]
async fn test_publish_reaches_subscribers_on_every_node() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551, 2552, 2553], quiet_settings());
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut b_inbox = connected(&b.relay, "chat.room-1", "bob").await;
    let mut c_inbox = connected(&c.relay, "chat.*", "carol").await;

    let event_id = a
        .relay
        .publish_checked("chat.room-1", RosterEvent::Joined("alice".into()))
        .await
        .unwrap();
    assert_eq!(event_id, format!("{}-1", a.address));

    for inbox in [&mut b_inbox, &mut c_inbox] {
        let delivery = next_delivery(inbox).await;
        let event = delivery.as_event().expect("topic event");
        assert_eq!(event.origin, a.address);
        assert_eq!(event.sequence, 1);
        assert_eq!(event.payload, RosterEvent::Joined("alice".into()));
    }

    // only the wildcard subscriber matches another room
    a.relay
        .publish_checked("chat.room-2", RosterEvent::Joined("dave".into()))
        .await
        .unwrap();
    let delivery = next_delivery(&mut c_inbox).await;
    assert_eq!(delivery.as_event().map(|e| e.sequence), Some(2));
    wait_until("b applied both events", || async {
        b.relay.view().await.map(|v| v.len() == 2).unwrap_or(false)
    })
    .await;
    assert_eq!(b_inbox.try_recv().unwrap_err(), TryRecvError::Empty);
}

#[tokio::test]
async fn test_remote_events_are_not_rebroadcast() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551, 2552, 2553], quiet_settings());
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let _b_inbox = connected(&b.relay, "chat", "bob").await;
    let _c_inbox = connected(&c.relay, "chat", "carol").await;

    a.relay
        .publish_checked("chat", RosterEvent::Joined("alice".into()))
        .await
        .unwrap();
    for node in [b, c] {
        wait_until("event received", || async {
            node.relay.stats().await.map(|s| s.received == 1).unwrap_or(false)
        })
        .await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let a_stats = a.relay.stats().await.unwrap();
    assert_eq!(a_stats.published, 1);
    assert_eq!(a_stats.received, 0);
    for node in [b, c] {
        let stats = node.relay.stats().await.unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.duplicates, 0);
        assert_eq!(stats.published, 0);
    }
    for node in &nodes {
        let users = node.relay.view().await.unwrap();
        assert_eq!(users, BTreeSet::from(["alice".to_string()]));
    }
}

#[tokio::test]
async fn test_redelivered_event_leaves_view_unchanged() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551], quiet_settings());
    let a = &nodes[0];
    let mut inbox = connected(&a.relay, "chat", "watcher").await;
    // a peer without a relay of its own, used to inject frames
    let peer = cluster.join_up(addr(2552), Vec::<String>::new()).unwrap();

    let event = TopicEvent {
        topic: "chat".to_string(),
        origin: peer.address().clone(),
        incarnation: Uuid::new_v4(),
        sequence: 1,
        payload: RosterEvent::Joined("bob".to_string()),
        timestamp_ms: 0,
    };
    let frame = event_frame(&event).unwrap();
    peer.send(&a.address, &relay_channel("chat"), frame.clone()).unwrap();
    let after_first = a.relay.view().await.unwrap();
    peer.send(&a.address, &relay_channel("chat"), frame).unwrap();
    let after_second = a.relay.view().await.unwrap();

    assert_eq!(after_first, BTreeSet::from(["bob".to_string()]));
    assert_eq!(after_second, after_first);
    let stats = a.relay.stats().await.unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.duplicates, 1);

    assert!(next_delivery(&mut inbox).await.as_event().is_some());
    assert_eq!(inbox.try_recv().unwrap_err(), TryRecvError::Empty);
}

#[tokio::test]
async fn test_view_rejects_duplicate_local_publish() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551], quiet_settings());
    let relay = &nodes[0].relay;

    relay
        .publish_checked("chat", RosterEvent::Joined("alice".into()))
        .await
        .unwrap();
    let err = relay
        .publish_checked("chat", RosterEvent::Joined("alice".into()))
        .await
        .unwrap_err();
    assert!(matches!(&err, RelayError::Rejected { reason } if reason.contains("already in use")));
    assert_eq!(relay.stats().await.unwrap().published, 1);
}

#[tokio::test]
async fn test_cluster_stats_follow_membership() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551, 2552], quiet_settings());
    let (a, b) = (&nodes[0], &nodes[1]);
    let _a1 = connected(&a.relay, "chat", "a-1").await;
    let _b1 = connected(&b.relay, "chat", "b-1").await;
    let _b2 = connected(&b.relay, "events", "b-2").await;

    wait_until("a sees all subscribers", || async {
        a.relay
            .cluster_stats()
            .await
            .map(|s| s.total_subscribers == 3 && s.nodes == 2)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(a.relay.local_subscriber_count(), 1);

    b.relay
        .publish_checked("chat", RosterEvent::Joined("bob".into()))
        .await
        .unwrap();
    wait_until("a learns bob", || async {
        a.relay.view().await.map(|v| v.contains("bob")).unwrap_or(false)
    })
    .await;

    cluster.down(&b.address).unwrap();
    wait_until("a forgets b", || async {
        a.relay
            .cluster_stats()
            .await
            .map(|s| s.total_subscribers == 1 && s.nodes == 1)
            .unwrap_or(false)
    })
    .await;
    assert!(a.relay.view().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_heartbeat_reaches_subscribers() {
    let cluster = InMemoryCluster::new();
    let settings = RelaySettings {
        heartbeat_interval: Some(Duration::from_millis(50)),
        ..RelaySettings::default()
    };
    let nodes = start_nodes(&cluster, &[2551], settings);
    let mut inbox = connected(&nodes[0].relay, "events", "sub-1").await;

    let delivery = next_delivery(&mut inbox).await;
    assert!(matches!(delivery, Delivery::Heartbeat { ref node, .. } if *node == nodes[0].address));
}

#[tokio::test]
async fn test_event_published_before_peer_relay_starts_is_replayed() {
    let cluster = InMemoryCluster::new();
    let a_node = cluster.join_up(addr(2551), Vec::<String>::new()).unwrap();
    let b_node = cluster.join_up(addr(2552), Vec::<String>::new()).unwrap();
    let a_system = ActorSystem::new("node-2551");
    let b_system = ActorSystem::new("node-2552");
    let a = spawn_topic_relay(&a_system, &a_node.cluster_node(), "chat", quiet_settings(), Roster::default)
        .unwrap();

    // b is Up but has no relay yet, so the frame finds no handler
    a.publish_checked("chat", RosterEvent::Joined("alice".into()))
        .await
        .unwrap();

    let b = spawn_topic_relay(&b_system, &b_node.cluster_node(), "chat", quiet_settings(), Roster::default)
        .unwrap();
    wait_until("b learns alice", || async {
        b.view().await.map(|v| v.contains("alice")).unwrap_or(false)
    })
    .await;

    let err = b
        .publish_checked("chat", RosterEvent::Joined("alice".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Rejected { .. }));
    assert_eq!(a.stats().await.unwrap().replayed, 1);
    let b_stats = b.stats().await.unwrap();
    assert_eq!(b_stats.received, 1);
    assert_eq!(b_stats.gaps, 0);
}

#[tokio::test]
async fn test_gap_after_partition_is_filled_by_replay() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551, 2552], quiet_settings());
    let (a, b) = (&nodes[0], &nodes[1]);
    wait_until("a and b exchanged stats", || async {
        a.relay.cluster_stats().await.map(|s| s.nodes == 2).unwrap_or(false)
            && b.relay.cluster_stats().await.map(|s| s.nodes == 2).unwrap_or(false)
    })
    .await;

    cluster.partition(&[a.address.clone()], &[b.address.clone()]);
    a.relay
        .publish_checked("chat", RosterEvent::Joined("alice".into()))
        .await
        .unwrap();
    cluster.heal();
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.relay
        .publish_checked("chat", RosterEvent::Joined("carol".into()))
        .await
        .unwrap();

    wait_until("b holds both users", || async {
        b.relay
            .view()
            .await
            .map(|v| v == BTreeSet::from(["alice".to_string(), "carol".to_string()]))
            .unwrap_or(false)
    })
    .await;
    let b_stats = b.relay.stats().await.unwrap();
    assert_eq!(b_stats.gaps, 1);
    assert_eq!(b_stats.received, 2);
    assert!(a.relay.stats().await.unwrap().replayed >= 1);
}

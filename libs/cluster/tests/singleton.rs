use actors::{from_fn, respond, ActorSystem, Next, Props, Request};
use cluster::{
    spawn_split_brain_resolver, ClusterError, ClusterSingleton, InMemoryCluster, NodeAddress,
    SimulatedNode, SingletonEvent, SingletonRef, SingletonSettings,
};
use node_config::{NodeConfig, SplitBrainStrategyKind};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Serialize, Deserialize)]
enum CounterCmd {
    Increment,
    Get,
}

fn counter_props() -> Props<Request<CounterCmd, i64>> {
    Props::new(|| {
        let mut value = 0i64;
        from_fn(move |_ctx, request: Request<CounterCmd, i64>| {
            if let CounterCmd::Increment = request.command {
                value += 1;
            }
            respond(request.reply_to, value);
            Ok(Next::Same)
        })
    })
}

struct TestNode {
    address: NodeAddress,
    system: ActorSystem,
    counter: SingletonRef<CounterCmd, i64>,
    _node: Arc<SimulatedNode>,
}

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("127.0.0.1", port)
}

fn start_nodes(cluster: &InMemoryCluster, ports: &[u16], settings: SingletonSettings) -> Vec<TestNode> {
    let nodes: Vec<Arc<SimulatedNode>> = ports
        .iter()
        .map(|port| cluster.join_up(addr(*port), Vec::<String>::new()).unwrap())
        .collect();
    nodes
        .into_iter()
        .map(|node| {
            let system = ActorSystem::new(&format!("node-{}", node.address().port));
            let singleton = ClusterSingleton::new(&system, &node.cluster_node(), settings.clone());
            let counter = singleton.init("counter", counter_props()).unwrap();
            TestNode {
                address: node.address().clone(),
                system,
                counter,
                _node: node,
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

async fn hosts_instance(node: &TestNode) -> bool {
    node.counter
        .state()
        .await
        .map(|state| state.local_instance && !state.handing_over)
        .unwrap_or(false)
}

async fn knows_holder(node: &TestNode, holder: &NodeAddress, generation: u64) -> bool {
    node.counter
        .state()
        .await
        .ok()
        .and_then(|state| state.lease)
        .map(|lease| &lease.holder == holder && lease.generation == generation)
        .unwrap_or(false)
}

async fn instance_count(nodes: &[TestNode]) -> usize {
    let mut count = 0;
    for node in nodes {
        if hosts_instance(node).await {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn test_oldest_member_hosts_the_only_instance() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551, 2552, 2553], SingletonSettings::default());
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    wait_until("a hosts the singleton", || hosts_instance(a)).await;
    wait_until("b knows the lease", || knows_holder(b, &a.address, 1)).await;
    wait_until("c knows the lease", || knows_holder(c, &a.address, 1)).await;
    assert_eq!(instance_count(&nodes).await, 1);

    b.counter.tell(CounterCmd::Increment).unwrap();
    c.counter.tell(CounterCmd::Increment).unwrap();
    wait_until("both increments applied", || async {
        c.counter.ask(CounterCmd::Get).await == Ok(2)
    })
    .await;
    assert_eq!(a.counter.ask(CounterCmd::Increment).await, Ok(3));
}

#[tokio::test]
async fn test_graceful_leave_hands_over_before_takeover() {
    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551, 2552, 2553], SingletonSettings::default());
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    wait_until("a hosts the singleton", || hosts_instance(a)).await;
    wait_until("b knows the lease", || knows_holder(b, &a.address, 1)).await;
    wait_until("c knows the lease", || knows_holder(c, &a.address, 1)).await;
    let mut b_events = b.counter.subscribe_events();

    cluster.leave(&a.address).unwrap();

    let activated = tokio::time::timeout(Duration::from_secs(5), b_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        activated,
        SingletonEvent::Activated {
            singleton: "counter".into(),
            node: b.address.clone(),
            generation: 2,
        }
    );
    let a_state = a.counter.state().await.unwrap();
    assert!(!a_state.local_instance);

    wait_until("c follows the new holder", || knows_holder(c, &b.address, 2)).await;
    assert_eq!(instance_count(&nodes).await, 1);
    // a new generation starts from fresh state
    assert_eq!(c.counter.ask(CounterCmd::Get).await, Ok(0));
}

#[tokio::test]
async fn test_unreachable_holder_is_not_replaced_until_downed() {
    let cluster = InMemoryCluster::new();
    let margin = Duration::from_millis(300);
    let settings = SingletonSettings::default().with_down_removal_margin(margin);
    let nodes = start_nodes(&cluster, &[2551, 2552, 2553], settings);
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    wait_until("a hosts the singleton", || hosts_instance(a)).await;
    wait_until("b knows the lease", || knows_holder(b, &a.address, 1)).await;

    cluster.crash(&a.address).unwrap();
    a.system.shutdown().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!hosts_instance(b).await);
    assert!(!hosts_instance(c).await);
    let unanswered = b
        .counter
        .ask_with_timeout(CounterCmd::Get, Duration::from_millis(100))
        .await;
    assert!(unanswered.is_err());

    let downed = Instant::now();
    cluster.down(&a.address).unwrap();
    wait_until("b takes over", || hosts_instance(b)).await;
    assert!(downed.elapsed() >= margin);
    wait_until("c follows the new holder", || knows_holder(c, &b.address, 2)).await;
    assert!(!hosts_instance(c).await);
    assert_eq!(c.counter.ask(CounterCmd::Increment).await, Ok(1));
}

/// Merge the lifecycle events of every node into one ordered stream
fn record_events(nodes: &[TestNode]) -> mpsc::UnboundedReceiver<SingletonEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    for node in nodes {
        let mut events = node.counter.subscribe_events();
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
    }
    rx
}

#[tokio::test]
async fn test_minority_holder_steps_down_before_majority_takes_over() {
    let mut config = NodeConfig::default();
    config.cluster.split_brain.strategy = SplitBrainStrategyKind::KeepMajority;
    config.cluster.split_brain.stable_after_ms = 50;
    config.cluster.singleton.down_removal_margin_ms = 0;
    let settings = SingletonSettings::from_config(&config);
    assert!(settings.down_removal_margin > Duration::from_millis(50));

    let cluster = InMemoryCluster::new();
    let nodes = start_nodes(&cluster, &[2551, 2552, 2553], settings);
    let mut resolvers = Vec::new();
    for node in &nodes {
        let cluster_node = node._node.cluster_node();
        resolvers.push(
            spawn_split_brain_resolver(&node.system, &cluster_node, &config.cluster.split_brain)
                .unwrap(),
        );
    }
    assert!(resolvers.iter().all(Option::is_some));

    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    wait_until("a hosts the singleton", || hosts_instance(a)).await;
    wait_until("b knows the lease", || knows_holder(b, &a.address, 1)).await;
    let mut events = record_events(&nodes);

    cluster.partition(&[a.address.clone()], &[b.address.clone(), c.address.clone()]);

    let mut seen = Vec::new();
    while !seen.iter().any(|event| matches!(event, SingletonEvent::Activated { .. })) {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no takeover after partition")
            .unwrap();
        seen.push(event);
    }
    assert_eq!(
        seen,
        vec![
            SingletonEvent::Deactivated {
                singleton: "counter".into(),
                node: a.address.clone(),
                generation: 1,
            },
            SingletonEvent::Activated {
                singleton: "counter".into(),
                node: b.address.clone(),
                generation: 2,
            },
        ]
    );
    assert_eq!(instance_count(&nodes).await, 1);
}

#[tokio::test]
async fn test_ask_without_holder_fails_fast_and_tells_are_buffered() {
    let cluster = InMemoryCluster::new();
    let settings = SingletonSettings {
        buffer_size: 2,
        ..SingletonSettings::default()
    }
    .with_role("compute");
    let nodes = start_nodes(&cluster, &[2551], settings);
    let a = &nodes[0];

    let err = a.counter.ask(CounterCmd::Get).await.unwrap_err();
    assert_eq!(err, ClusterError::handover_in_progress("counter"));
    assert!(err.is_retryable());

    for _ in 0..3 {
        a.counter.tell(CounterCmd::Increment).unwrap();
    }
    let state = a.counter.state().await.unwrap();
    assert!(state.lease.is_none());
    assert_eq!(state.buffered, 2);
    assert_eq!(state.dropped, 1);
}

#[tokio::test]
async fn test_singleton_name_initialised_once_per_node() {
    let cluster = InMemoryCluster::new();
    let node = cluster.join_up(addr(2551), Vec::<String>::new()).unwrap();
    let system = ActorSystem::new("node");
    let singleton = ClusterSingleton::new(&system, &node.cluster_node(), SingletonSettings::default());

    let _first = singleton.init("counter", counter_props()).unwrap();
    let second = singleton.init("counter", counter_props());
    assert!(matches!(second, Err(ClusterError::NameConflict { .. })));

    system.shutdown().await;
}

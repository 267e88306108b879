use actors::{
    async_trait, from_fn, ActorBehavior, ActorContext, ActorError, ActorStatus, ActorSystem,
    Next, Props, ReplyTo, SupervisorDirective, SupervisorStrategy,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ASK: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum Cmd {
    Inc,
    Fail,
    Panic,
    Slow(Duration),
    Get(ReplyTo<i64>),
}

struct Counter {
    value: i64,
}

#[async_trait]
impl ActorBehavior for Counter {
    type Message = Cmd;

    async fn handle(&mut self, _ctx: &mut ActorContext<Cmd>, msg: Cmd) -> actors::Result<Next<Cmd>> {
        match msg {
            Cmd::Inc => self.value += 1,
            Cmd::Fail => return Err(ActorError::handler("requested failure")),
            Cmd::Panic => panic!("requested panic"),
            Cmd::Slow(d) => tokio::time::sleep(d).await,
            Cmd::Get(reply) => {
                reply.send(self.value);
            }
        }
        Ok(Next::Same)
    }
}

fn counter_props() -> Props<Cmd> {
    Props::new(|| Counter { value: 0 })
}

/// Functional-style counter: every increment returns a new behavior
fn functional_counter(value: i64) -> Box<dyn ActorBehavior<Message = Cmd>> {
    Box::new(from_fn(move |_ctx, msg: Cmd| match msg {
        Cmd::Inc => Ok(Next::Become(functional_counter(value + 1))),
        Cmd::Get(reply) => {
            reply.send(value);
            Ok(Next::Same)
        }
        _ => Ok(Next::Same),
    }))
}

#[tokio::test]
async fn test_become_replaces_behavior() {
    let system = ActorSystem::new("test");
    let counter = system
        .spawn("functional", Props::boxed(|| functional_counter(0)))
        .unwrap();

    for _ in 0..3 {
        counter.tell(Cmd::Inc).unwrap();
    }
    assert_eq!(counter.ask(Cmd::Get, ASK).await.unwrap(), 3);
    system.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_name_conflicts_until_stopped() {
    let system = ActorSystem::new("test");
    let first = system.spawn("counter", counter_props()).unwrap();

    let err = system.spawn("counter", counter_props()).unwrap_err();
    assert!(matches!(err, ActorError::NameConflict { .. }));

    system.stop(&first).await;
    assert!(first.is_stopped());
    assert!(system.spawn("counter", counter_props()).is_ok());
    system.shutdown().await;
}

#[tokio::test]
async fn test_tell_to_stopped_actor_fails_fast() {
    let system = ActorSystem::new("test");
    let counter = system.spawn("counter", counter_props()).unwrap();
    system.stop(&counter).await;

    let err = counter.tell(Cmd::Inc).unwrap_err();
    assert!(matches!(err, ActorError::ActorStopped { .. }));
    let err = counter.ask(Cmd::Get, ASK).await.unwrap_err();
    assert!(matches!(err, ActorError::ActorStopped { .. }));
    assert!(system.metrics().snapshot().dead_letters >= 2);
}

#[tokio::test]
async fn test_ask_timeout() {
    let system = ActorSystem::new("test");
    let counter = system.spawn("counter", counter_props()).unwrap();

    counter.tell(Cmd::Slow(Duration::from_millis(300))).unwrap();
    let err = counter
        .ask(Cmd::Get, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, ActorError::Timeout { timeout_ms: 50, .. }));
    assert!(err.is_retryable());
    system.shutdown().await;
}

#[tokio::test]
async fn test_stop_drops_queued_messages_and_fails_pending_asks() {
    let system = ActorSystem::new("test");
    let counter = system.spawn("counter", counter_props()).unwrap();

    counter.tell(Cmd::Slow(Duration::from_millis(100))).unwrap();
    let asker = counter.clone();
    let pending = tokio::spawn(async move { asker.ask(Cmd::Get, ASK).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    // the in-flight message completes, the queued ask is dropped
    counter.stop();
    counter.stopped().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(ActorError::ActorStopped { .. })));
    assert_eq!(counter.status(), ActorStatus::Stopped);
}

#[tokio::test]
async fn test_restart_gives_fresh_state_and_keeps_mailbox() {
    let system = ActorSystem::new("test");
    let counter = system.spawn("counter", counter_props()).unwrap();

    counter.tell(Cmd::Inc).unwrap();
    counter.tell(Cmd::Inc).unwrap();
    counter.tell(Cmd::Fail).unwrap();
    counter.tell(Cmd::Inc).unwrap();

    // state before the failure is gone, the message after it was processed
    assert_eq!(counter.ask(Cmd::Get, ASK).await.unwrap(), 1);
    assert_eq!(system.metrics().snapshot().actor_restarts, 1);
    system.shutdown().await;
}

#[tokio::test]
async fn test_panic_is_supervised_like_an_error() {
    let system = ActorSystem::new("test");
    let counter = system.spawn("counter", counter_props()).unwrap();

    counter.tell(Cmd::Inc).unwrap();
    counter.tell(Cmd::Panic).unwrap();
    counter.tell(Cmd::Inc).unwrap();
    counter.tell(Cmd::Inc).unwrap();

    assert_eq!(counter.ask(Cmd::Get, ASK).await.unwrap(), 2);
    system.shutdown().await;
}

#[tokio::test]
async fn test_resume_keeps_state() {
    let system = ActorSystem::new("test");
    let counter = system
        .spawn("counter", counter_props().with_strategy(SupervisorStrategy::resume()))
        .unwrap();

    counter.tell(Cmd::Inc).unwrap();
    counter.tell(Cmd::Fail).unwrap();
    counter.tell(Cmd::Inc).unwrap();
    assert_eq!(counter.ask(Cmd::Get, ASK).await.unwrap(), 2);
    system.shutdown().await;
}

#[tokio::test]
async fn test_restart_limit_escalates_and_stops_top_level_actor() {
    let system = ActorSystem::new("test");
    let strategy = SupervisorStrategy::restart().with_restart_limit(2, Duration::from_secs(60));
    let counter = system
        .spawn("counter", counter_props().with_strategy(strategy))
        .unwrap();

    for _ in 0..3 {
        counter.tell(Cmd::Fail).unwrap();
    }
    tokio::time::timeout(ASK, counter.stopped()).await.unwrap();

    let stats = system.metrics().snapshot();
    assert_eq!(stats.actor_restarts, 3);
    assert_eq!(stats.restart_failures, 1);
    assert_eq!(stats.escalations, 1);
    assert!(system.list_actors().is_empty());
}

#[tokio::test]
async fn test_stop_directive() {
    let system = ActorSystem::new("test");
    let counter = system
        .spawn("counter", counter_props().with_strategy(SupervisorStrategy::stop()))
        .unwrap();
    counter.tell(Cmd::Fail).unwrap();
    tokio::time::timeout(ASK, counter.stopped()).await.unwrap();
    assert_eq!(system.metrics().snapshot().actor_restarts, 0);
}

/// Parent that spawns one child on start and records lifecycle events
struct Parent {
    log: Arc<Mutex<Vec<String>>>,
    starts: Arc<AtomicUsize>,
}

enum ParentCmd {
    Inspect,
}

struct Child {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ActorBehavior for Child {
    type Message = ();

    async fn handle(&mut self, _ctx: &mut ActorContext<()>, _msg: ()) -> actors::Result<Next<()>> {
        Err(ActorError::handler("child failure"))
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<()>) {
        self.log.lock().unwrap().push("child stopped".to_string());
    }

    async fn on_error(&mut self, _error: &ActorError) -> Option<SupervisorDirective> {
        Some(SupervisorDirective::Escalate)
    }
}

#[async_trait]
impl ActorBehavior for Parent {
    type Message = ParentCmd;

    async fn on_start(&mut self, ctx: &mut ActorContext<ParentCmd>) -> actors::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let log = self.log.clone();
        ctx.spawn("child", Props::new(move || Child { log: log.clone() }))?;
        Ok(())
    }

    async fn handle(
        &mut self,
        ctx: &mut ActorContext<ParentCmd>,
        msg: ParentCmd,
    ) -> actors::Result<Next<ParentCmd>> {
        match msg {
            ParentCmd::Inspect => {
                assert_eq!(ctx.children(), vec!["child".to_string()]);
                let path = ctx.path().child("child")?;
                self.log.lock().unwrap().push(format!("poking {}", path));
            }
        }
        Ok(Next::Same)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext<ParentCmd>) {
        self.log.lock().unwrap().push("parent stopped".to_string());
    }
}

fn parent_props(log: Arc<Mutex<Vec<String>>>, starts: Arc<AtomicUsize>) -> Props<ParentCmd> {
    Props::new(move || Parent {
        log: log.clone(),
        starts: starts.clone(),
    })
}

#[tokio::test]
async fn test_stopping_parent_stops_children_first() {
    let system = ActorSystem::new("test");
    let log = Arc::new(Mutex::new(Vec::new()));
    let parent = system
        .spawn("parent", parent_props(log.clone(), Arc::new(AtomicUsize::new(0))))
        .unwrap();

    parent.tell(ParentCmd::Inspect).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(parent.children(), vec!["child".to_string()]);

    system.stop(&parent).await;
    let log = log.lock().unwrap().clone();
    assert_eq!(
        log,
        vec![
            "poking /user/parent/child".to_string(),
            "child stopped".to_string(),
            "parent stopped".to_string(),
        ]
    );
}

/// Behavior that spawns a failing child and exposes it for the test
struct Supervisor {
    starts: Arc<AtomicUsize>,
    child_slot: Arc<Mutex<Option<actors::ActorRef<()>>>>,
}

#[async_trait]
impl ActorBehavior for Supervisor {
    type Message = ();

    async fn on_start(&mut self, ctx: &mut ActorContext<()>) -> actors::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let log = Arc::new(Mutex::new(Vec::new()));
        let child = ctx.spawn("worker", Props::new(move || Child { log: log.clone() }))?;
        *self.child_slot.lock().unwrap() = Some(child);
        Ok(())
    }

    async fn handle(&mut self, _ctx: &mut ActorContext<()>, _msg: ()) -> actors::Result<Next<()>> {
        Ok(Next::Same)
    }
}

#[tokio::test]
async fn test_escalated_failure_restarts_parent() {
    let system = ActorSystem::new("test");
    let starts = Arc::new(AtomicUsize::new(0));
    let child_slot = Arc::new(Mutex::new(None));
    let factory_starts = starts.clone();
    let factory_slot = child_slot.clone();
    let supervisor = system
        .spawn(
            "supervisor",
            Props::new(move || Supervisor {
                starts: factory_starts.clone(),
                child_slot: factory_slot.clone(),
            }),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let first_child = child_slot.lock().unwrap().clone().unwrap();
    first_child.tell(()).unwrap();

    tokio::time::timeout(ASK, first_child.stopped()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // the parent was restarted and spawned a fresh child under the same name
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    let second_child = child_slot.lock().unwrap().clone().unwrap();
    assert_ne!(first_child, second_child);
    assert_eq!(supervisor.children(), vec!["worker".to_string()]);
    assert_eq!(supervisor.status(), ActorStatus::Running);
    system.shutdown().await;
}

#[derive(Clone, Debug)]
enum TickCmd {
    Tick,
    Get(Arc<Mutex<Option<ReplyTo<u32>>>>),
}

struct Ticker {
    ticks: u32,
}

#[async_trait]
impl ActorBehavior for Ticker {
    type Message = TickCmd;

    async fn on_start(&mut self, ctx: &mut ActorContext<TickCmd>) -> actors::Result<()> {
        ctx.start_timer("tick", Duration::from_millis(5), Duration::from_millis(10), TickCmd::Tick);
        assert!(ctx.is_timer_active("tick"));
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut ActorContext<TickCmd>, msg: TickCmd) -> actors::Result<Next<TickCmd>> {
        match msg {
            TickCmd::Tick => {
                self.ticks += 1;
                if self.ticks == 3 {
                    ctx.cancel_timer("tick");
                }
            }
            TickCmd::Get(slot) => {
                if let Some(reply) = slot.lock().unwrap().take() {
                    reply.send(self.ticks);
                }
            }
        }
        Ok(Next::Same)
    }
}

#[tokio::test]
async fn test_timer_delivers_until_cancelled() {
    let system = ActorSystem::new("test");
    let ticker = system.spawn("ticker", Props::new(|| Ticker { ticks: 0 })).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let ticks = ticker
        .ask(|reply| TickCmd::Get(Arc::new(Mutex::new(Some(reply)))), ASK)
        .await
        .unwrap();
    assert_eq!(ticks, 3);
    system.shutdown().await;
}

enum PipeCmd {
    Compute(u64),
    Computed(u64),
    Get(ReplyTo<Vec<u64>>),
}

#[tokio::test]
async fn test_pipe_to_self_and_blocking_work() {
    let system = ActorSystem::new("test");
    let props = Props::new(|| {
        let mut results = Vec::new();
        from_fn(move |ctx: &mut ActorContext<PipeCmd>, msg| {
            match msg {
                PipeCmd::Compute(n) => {
                    ctx.pipe_to_self(async move { n * 2 }, PipeCmd::Computed);
                    ctx.spawn_blocking(move || n * 3, PipeCmd::Computed);
                }
                PipeCmd::Computed(v) => results.push(v),
                PipeCmd::Get(reply) => {
                    let mut sorted = results.clone();
                    sorted.sort_unstable();
                    reply.send(sorted);
                }
            }
            Ok(Next::Same)
        })
    });
    let worker = system.spawn("worker", props).unwrap();
    worker.tell(PipeCmd::Compute(5)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(worker.ask(PipeCmd::Get, ASK).await.unwrap(), vec![10, 15]);
    system.shutdown().await;
}

enum Record {
    Item(u32),
    Done(ReplyTo<Vec<u32>>),
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_single_sender_order_is_preserved(items in proptest::collection::vec(any::<u32>(), 0..64)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let received = runtime.block_on(async {
            let system = ActorSystem::new("prop");
            let props = Props::new(|| {
                let mut seen = Vec::new();
                from_fn(move |_ctx, msg: Record| {
                    match msg {
                        Record::Item(v) => seen.push(v),
                        Record::Done(reply) => {
                            reply.send(std::mem::take(&mut seen));
                        }
                    }
                    Ok(Next::Same)
                })
            });
            let recorder = system.spawn("recorder", props).unwrap();
            for item in &items {
                recorder.tell(Record::Item(*item)).unwrap();
            }
            let received = recorder.ask(Record::Done, ASK).await.unwrap();
            system.shutdown().await;
            received
        });
        prop_assert_eq!(received, items);
    }
}

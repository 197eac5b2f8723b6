//! Worker loop: claiming, bounded parallelism, and graceful shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt as _;
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use flowrun_core::{
    CapabilityRef, FlowVersion, RunStatus, Step, StepError, StepId, StepKind, ValueRef,
};
use flowrun_interpreter::FlowInterpreter;
use flowrun_mock::{EchoHandler, MockBehavior, MockHandler};
use flowrun_queue::{Dispatcher, QueueConfig};
use flowrun_registry::{StaticConnections, StepHandler, StepInvocation, StepRegistry};
use flowrun_state::{InMemoryRunStore, RunStateStore};
use flowrun_worker::{LocalBroker, Worker, WorkerConfig, WorkerEvent, WorkerId};

/// Records how many invocations overlap and the highest overlap seen.
struct OverlapGauge {
    current: Arc<AtomicU32>,
    peak: Arc<AtomicU32>,
    hold: Duration,
}

impl OverlapGauge {
    fn new(hold: Duration) -> Self {
        Self {
            current: Arc::new(AtomicU32::new(0)),
            peak: Arc::new(AtomicU32::new(0)),
            hold,
        }
    }
}

impl StepHandler for OverlapGauge {
    fn execute(
        &self,
        invocation: StepInvocation,
    ) -> futures::future::BoxFuture<'static, Result<ValueRef, StepError>> {
        let current = self.current.clone();
        let peak = self.peak.clone();
        let hold = self.hold;
        async move {
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(hold).await;
            current.fetch_sub(1, Ordering::SeqCst);
            Ok(invocation.input)
        }
        .boxed()
    }
}

fn echo_flow() -> FlowVersion {
    let steps = vec![
        Step {
            id: StepId::from("start"),
            capability: CapabilityRef::new("core", "webhook", 1),
            input: ValueRef::null(),
            kind: StepKind::Trigger {
                next: Some(StepId::from("act")),
            },
            connection: None,
            on_error: Default::default(),
            retry: Default::default(),
            timeout_ms: None,
        },
        Step {
            id: StepId::from("act"),
            capability: CapabilityRef::new("core", "echo", 1),
            input: json!({"seen": {"$from": "$trigger"}}).into(),
            kind: StepKind::Action { next: None },
            connection: None,
            on_error: Default::default(),
            retry: Default::default(),
            timeout_ms: None,
        },
    ];
    FlowVersion::from_steps(Uuid::now_v7(), 1, steps).unwrap()
}

struct Harness {
    store: Arc<InMemoryRunStore>,
    dispatcher: Arc<Dispatcher>,
    worker: Arc<Worker>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

fn harness(registry: StepRegistry, queue: QueueConfig, config: WorkerConfig) -> Harness {
    let store = Arc::new(InMemoryRunStore::new());
    let dispatcher = Dispatcher::new(store.clone(), queue);
    let interpreter = Arc::new(FlowInterpreter::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(StaticConnections::new()),
    ));
    let worker = Arc::new(Worker::new(
        LocalBroker::new(dispatcher.clone()),
        interpreter,
        config,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    Harness {
        store,
        dispatcher,
        worker,
        shutdown_tx,
        shutdown_rx,
    }
}

async fn wait_for_finished(
    events: &mut tokio::sync::broadcast::Receiver<WorkerEvent>,
    count: usize,
) -> Vec<(Uuid, RunStatus)> {
    let mut finished = Vec::new();
    while finished.len() < count {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("worker made no progress")
            .expect("event channel closed");
        if let WorkerEvent::Finished { run_id, status, .. } = event {
            finished.push((run_id, status));
        }
    }
    finished
}

#[tokio::test]
async fn test_worker_drives_runs_to_completion() {
    let mut registry = StepRegistry::new();
    registry
        .register(CapabilityRef::new("core", "echo", 1), Arc::new(EchoHandler))
        .unwrap();
    let config = WorkerConfig {
        id: WorkerId::new("w-test"),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(registry, QueueConfig::default(), config);

    let version = echo_flow();
    h.store.put_flow_version(version.clone()).await.unwrap();
    let mut run_ids = Vec::new();
    for i in 0..3 {
        let run = h
            .dispatcher
            .enqueue_run(&version, json!({"n": i}).into())
            .await
            .unwrap();
        run_ids.push(run.run_id);
    }

    let mut events = h.worker.events();
    let handle = tokio::spawn(h.worker.clone().run(h.shutdown_rx.clone()));

    let finished = wait_for_finished(&mut events, 3).await;
    for (_, status) in &finished {
        assert_eq!(*status, RunStatus::Succeeded);
    }
    for run_id in run_ids {
        let run = h.store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
    }
    assert_eq!(h.dispatcher.queue().pending_len(), 0);
    assert_eq!(h.dispatcher.queue().in_flight_len(), 0);

    h.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not shut down")
        .unwrap();
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_worker_respects_per_key_ceiling() {
    let gauge = Arc::new(OverlapGauge::new(Duration::from_millis(30)));
    let peak = gauge.peak.clone();
    let mut registry = StepRegistry::new();
    registry
        .register(CapabilityRef::new("core", "echo", 1), gauge)
        .unwrap();

    // Worker has plenty of slots; the queue's per-flow ceiling is the
    // binding limit.
    let queue = QueueConfig {
        default_ceiling: 2,
        ..Default::default()
    };
    let config = WorkerConfig {
        id: WorkerId::new("w-ceiling"),
        max_parallel_runs: 8,
        poll_interval: Duration::from_millis(10),
    };
    let h = harness(registry, queue, config);

    let version = echo_flow();
    h.store.put_flow_version(version.clone()).await.unwrap();
    for i in 0..5 {
        h.dispatcher
            .enqueue_run(&version, json!({"n": i}).into())
            .await
            .unwrap();
    }

    let mut events = h.worker.events();
    let handle = tokio::spawn(h.worker.clone().run(h.shutdown_rx.clone()));

    let finished = wait_for_finished(&mut events, 5).await;
    assert_eq!(finished.len(), 5);
    for (_, status) in &finished {
        assert_eq!(*status, RunStatus::Succeeded);
    }
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "peak concurrency {} exceeded the ceiling",
        peak.load(Ordering::SeqCst)
    );

    h.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not shut down")
        .unwrap();
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_keeps_lease_on_long_run() {
    let slow = Arc::new(MockHandler::new().default_behavior(MockBehavior::Sleep(
        Duration::from_millis(900),
        json!("done").into(),
    )));
    let mut registry = StepRegistry::new();
    registry
        .register(CapabilityRef::new("core", "echo", 1), slow.clone())
        .unwrap();

    // The run outlives several lease TTLs; without heartbeats the sweeper
    // would redeliver it to a second execution mid-run.
    let queue = QueueConfig {
        lease_ttl: Duration::from_millis(300),
        sweep_interval: Duration::from_millis(50),
        max_deliveries: 2,
        ..Default::default()
    };
    let config = WorkerConfig {
        id: WorkerId::new("w-heartbeat"),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(registry, queue, config);

    let version = echo_flow();
    h.store.put_flow_version(version.clone()).await.unwrap();
    let run = h
        .dispatcher
        .enqueue_run(&version, json!({"n": 0}).into())
        .await
        .unwrap();

    let mut events = h.worker.events();
    let handle = tokio::spawn(h.worker.clone().run(h.shutdown_rx.clone()));

    let finished = wait_for_finished(&mut events, 1).await;
    assert_eq!(finished[0], (run.run_id, RunStatus::Succeeded));
    // One delivery, one execution: the lease never lapsed mid-run.
    assert_eq!(slow.invocations(), 1);
    assert!(h.dispatcher.queue().dead_jobs().is_empty());
    assert_eq!(h.dispatcher.queue().in_flight_len(), 0);

    h.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not shut down")
        .unwrap();
    h.dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_runs() {
    let gauge = Arc::new(OverlapGauge::new(Duration::from_millis(50)));
    let mut registry = StepRegistry::new();
    registry
        .register(CapabilityRef::new("core", "echo", 1), gauge)
        .unwrap();
    let config = WorkerConfig {
        id: WorkerId::new("w-drain"),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let h = harness(registry, QueueConfig::default(), config);

    let version = echo_flow();
    h.store.put_flow_version(version.clone()).await.unwrap();
    let run = h
        .dispatcher
        .enqueue_run(&version, ValueRef::null())
        .await
        .unwrap();

    let mut events = h.worker.events();
    let handle = tokio::spawn(h.worker.clone().run(h.shutdown_rx.clone()));

    // Wait until the run is claimed, then request shutdown while it is
    // still executing. The worker must finish it before exiting.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("worker never claimed the job")
            .expect("event channel closed");
        if matches!(event, WorkerEvent::Claimed { .. }) {
            break;
        }
    }
    h.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("worker did not drain")
        .unwrap();

    let finished = h.store.get_run(run.run_id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Succeeded);
    assert_eq!(h.dispatcher.queue().in_flight_len(), 0);
    h.dispatcher.shutdown().await;
}

//! End-to-end lifecycle: dispatcher, queue, and interpreter together.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use flowrun_core::{
    CapabilityRef, FlowVersion, RunStatus, Step, StepId, StepKind, ValueRef,
};
use flowrun_interpreter::FlowInterpreter;
use flowrun_mock::EchoHandler;
use flowrun_queue::{Dispatcher, JobKind, QueueConfig};
use flowrun_registry::{StaticConnections, StepRegistry};
use flowrun_state::{InMemoryRunStore, RunStateStore};

fn approval_flow() -> FlowVersion {
    let steps = vec![
        Step {
            id: StepId::from("start"),
            capability: CapabilityRef::new("core", "webhook", 1),
            input: ValueRef::null(),
            kind: StepKind::Trigger {
                next: Some(StepId::from("gate")),
            },
            connection: None,
            on_error: Default::default(),
            retry: Default::default(),
            timeout_ms: None,
        },
        Step {
            id: StepId::from("gate"),
            capability: CapabilityRef::new("core", "wait", 1),
            input: ValueRef::null(),
            kind: StepKind::Wait {
                next: Some(StepId::from("notify")),
            },
            connection: None,
            on_error: Default::default(),
            retry: Default::default(),
            timeout_ms: None,
        },
        Step {
            id: StepId::from("notify"),
            capability: CapabilityRef::new("core", "echo", 1),
            input: json!({"decision": {"$from": "gate"}}).into(),
            kind: StepKind::Action { next: None },
            connection: None,
            on_error: Default::default(),
            retry: Default::default(),
            timeout_ms: None,
        },
    ];
    FlowVersion::from_steps(Uuid::now_v7(), 1, steps).unwrap()
}

#[tokio::test]
async fn test_pause_resume_through_dispatcher() {
    let store: Arc<InMemoryRunStore> = Arc::new(InMemoryRunStore::new());
    let mut registry = StepRegistry::new();
    registry
        .register(CapabilityRef::new("core", "echo", 1), Arc::new(EchoHandler))
        .unwrap();
    let interpreter = FlowInterpreter::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(StaticConnections::new()),
    );
    let dispatcher = Dispatcher::new(store.clone(), QueueConfig::default());

    let version = approval_flow();
    store.put_flow_version(version.clone()).await.unwrap();
    let run = dispatcher
        .enqueue_run(&version, json!({"request": 42}).into())
        .await
        .unwrap();

    // Worker side: claim the start job and execute until the wait step.
    let claimed = dispatcher.claim().unwrap();
    assert!(matches!(claimed.job.kind, JobKind::Start));
    let stop = dispatcher.stop_signal(run.run_id);
    let paused = interpreter.run(run.run_id, stop).await.unwrap();
    assert_eq!(paused.status, RunStatus::Paused);
    dispatcher
        .complete(claimed.job.job_id, claimed.token)
        .unwrap();

    // External resume event arrives with the stored token.
    let token = paused.resume.unwrap().token;
    dispatcher
        .resume_run(run.run_id, token, json!({"approved": true}).into())
        .await
        .unwrap();

    // Worker side again: the resume job carries the token and payload.
    let claimed = dispatcher.claim().unwrap();
    let JobKind::Resume { token, payload } = claimed.job.kind.clone() else {
        panic!("expected a resume job");
    };
    let stop = dispatcher.stop_signal(run.run_id);
    let finished = interpreter
        .resume(run.run_id, token, payload, stop)
        .await
        .unwrap();
    assert_eq!(finished.status, RunStatus::Succeeded);
    dispatcher
        .complete(claimed.job.job_id, claimed.token)
        .unwrap();

    let log = store.list_step_log(run.run_id).await.unwrap();
    let notify = log.iter().find(|e| e.step_id.as_str() == "notify").unwrap();
    assert_eq!(
        notify.outcome.success().unwrap().as_ref(),
        &json!({"decision": {"approved": true}})
    );
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_stop_mid_run_via_dispatcher() {
    let store: Arc<InMemoryRunStore> = Arc::new(InMemoryRunStore::new());
    let mut registry = StepRegistry::new();
    registry
        .register(CapabilityRef::new("core", "echo", 1), Arc::new(EchoHandler))
        .unwrap();
    let interpreter = FlowInterpreter::new(
        store.clone(),
        Arc::new(registry),
        Arc::new(StaticConnections::new()),
    );
    let dispatcher = Dispatcher::new(store.clone(), QueueConfig::default());

    let version = approval_flow();
    store.put_flow_version(version.clone()).await.unwrap();
    let run = dispatcher
        .enqueue_run(&version, ValueRef::null())
        .await
        .unwrap();

    let claimed = dispatcher.claim().unwrap();
    let stop = dispatcher.stop_signal(run.run_id);
    store
        .transition_status(run.run_id, RunStatus::Running, None)
        .await
        .unwrap();
    dispatcher.stop_run(run.run_id).await.unwrap();

    // The stop signal was raised before the walk began, so the run stops
    // at the first boundary.
    let stopped = interpreter.run(run.run_id, stop).await.unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    dispatcher
        .complete(claimed.job.job_id, claimed.token)
        .unwrap();
    dispatcher.shutdown().await;
}

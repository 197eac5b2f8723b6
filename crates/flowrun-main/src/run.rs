use error_stack::ResultExt as _;
use serde::Serialize;
use uuid::Uuid;

use flowrun_core::{FlowVersion, RunError, RunStatus, ValueRef};
use flowrun_state::RunStateStore as _;
use flowrun_worker::WorkerEvent;

use crate::engine::Engine;
use crate::{MainError, Result};

/// What a one-shot `flowrun run` prints when the run settles.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Output of the last executed step, when the run succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ValueRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Present when the run paused at a wait step; resuming requires it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Uuid>,
}

/// Execute one run of `version` against an in-process engine and wait for
/// it to settle (terminal or paused).
pub async fn run_flow(
    engine: &Engine,
    version: FlowVersion,
    trigger_payload: ValueRef,
) -> Result<RunReport> {
    engine
        .store
        .put_flow_version(version.clone())
        .await
        .change_context(MainError::FlowExecution)?;
    let run = engine
        .dispatcher
        .enqueue_run(&version, trigger_payload)
        .await
        .change_context(MainError::FlowExecution)?;
    tracing::info!(run_id = %run.run_id, flow_id = %version.flow_id, "run started");

    let mut events = engine.worker.events();
    let (shutdown_tx, handle) = engine.start_worker();

    let status = loop {
        let event = events.recv().await.change_context(MainError::FlowExecution)?;
        match event {
            WorkerEvent::Finished { run_id, status, .. } if run_id == run.run_id => break status,
            _ => {}
        }
    };
    engine.shutdown(shutdown_tx, handle).await;

    let settled = engine
        .store
        .get_run(run.run_id)
        .await
        .change_context(MainError::FlowExecution)?;
    let output = match status {
        RunStatus::Succeeded => last_output(engine, run.run_id).await?,
        _ => None,
    };

    Ok(RunReport {
        run_id: run.run_id,
        status,
        output,
        error: settled.error,
        resume_token: settled.resume.map(|r| r.token),
    })
}

async fn last_output(engine: &Engine, run_id: Uuid) -> Result<Option<ValueRef>> {
    let log = engine
        .store
        .list_step_log(run_id)
        .await
        .change_context(MainError::FlowExecution)?;
    Ok(log
        .iter()
        .rev()
        .find(|entry| entry.path.is_root())
        .and_then(|entry| entry.outcome.success().cloned()))
}

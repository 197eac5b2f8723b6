use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use error_stack::{report, ResultExt as _};
use futures::future::BoxFuture;
use futures::FutureExt as _;
use rand::Rng as _;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

use flowrun_core::{
    Cursor, ExecPath, FlowRun, FlowVersion, LoopMode, OnError, ResumeToken, RunError, RunStatus,
    Step, StepError, StepErrorKind, StepId, StepKind, StepLogEntry, StepOutcome, ValueRef,
};
use flowrun_registry::{ConnectionProvider, StepRegistry};
use flowrun_sandbox::{Limits, SandboxedExecutor};
use flowrun_state::RunStateStore;

use crate::scope::Scope;
use crate::{InterpreterError, Result};

/// Serializes step-log appends for one run and allocates contiguous
/// sequence numbers, so parallel loop iterations cannot race the journal.
///
/// Also holds the entries journalled by previous deliveries, which is how
/// a redelivered run recovers completed loop iterations.
struct Journal {
    store: Arc<dyn RunStateStore>,
    run_id: Uuid,
    prior: Vec<StepLogEntry>,
    next_seq: Mutex<u64>,
}

impl Journal {
    fn new(store: Arc<dyn RunStateStore>, run_id: Uuid, prior: Vec<StepLogEntry>) -> Self {
        let next_seq = prior.len() as u64;
        Self {
            store,
            run_id,
            prior,
            next_seq: Mutex::new(next_seq),
        }
    }

    /// The journalled output of a completed loop iteration from an earlier
    /// delivery, keyed by the owning loop step and the iteration path.
    fn iteration_output(&self, loop_id: &StepId, path: &ExecPath) -> Option<ValueRef> {
        self.prior.iter().find_map(|entry| {
            match &entry.outcome {
                StepOutcome::Success { output }
                    if &entry.step_id == loop_id && &entry.path == path =>
                {
                    Some(output.clone())
                }
                _ => None,
            }
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn append(
        &self,
        step_id: StepId,
        path: ExecPath,
        input: ValueRef,
        outcome: StepOutcome,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        attempt: u32,
        cursor_next: Option<StepId>,
    ) -> Result<()> {
        let mut next_seq = self.next_seq.lock().await;
        let seq = *next_seq;
        let entry = StepLogEntry {
            seq,
            step_id,
            path,
            input,
            outcome,
            started_at,
            finished_at,
            attempt,
        };
        self.store
            .append_step_entry(
                self.run_id,
                entry,
                Cursor {
                    next: cursor_next,
                    last_seq: seq,
                },
            )
            .await
            .change_context(InterpreterError::State)?;
        *next_seq += 1;
        Ok(())
    }
}

/// Everything observed while executing one step, retries included.
struct ExecReport {
    outcome: StepOutcome,
    /// The resolved input snapshot; null when resolution itself failed.
    input: ValueRef,
    attempt: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl ExecReport {
    fn failed(error: StepError, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome: StepOutcome::Failed { error },
            input: ValueRef::null(),
            attempt: 1,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

/// A step failure that escalated past its error policy.
struct StepFailure {
    step_id: StepId,
    error: StepError,
}

/// Why a run ended other than by completing its walk.
enum WalkEnd {
    Completed,
    Stopped,
    TimedOut,
    Failed(StepFailure),
    Paused,
}

/// Executes runs against a flow version: resolves inputs, invokes the
/// sandboxed executor, applies error policies, and journals every step.
///
/// The interpreter holds no per-run state; a run's durable record and its
/// step log are the only memory between deliveries.
pub struct FlowInterpreter {
    store: Arc<dyn RunStateStore>,
    registry: Arc<StepRegistry>,
    connections: Arc<dyn ConnectionProvider>,
    executor: SandboxedExecutor,
    limits: Limits,
    run_deadline: Option<Duration>,
}

impl FlowInterpreter {
    pub fn new(
        store: Arc<dyn RunStateStore>,
        registry: Arc<StepRegistry>,
        connections: Arc<dyn ConnectionProvider>,
    ) -> Self {
        Self {
            store,
            registry,
            connections,
            executor: SandboxedExecutor::new(),
            limits: Limits::default(),
            run_deadline: None,
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Wall-clock budget for a whole delivery; exceeding it ends the run
    /// with status `TimedOut` at the next step boundary.
    pub fn with_run_deadline(mut self, deadline: Duration) -> Self {
        self.run_deadline = Some(deadline);
        self
    }

    /// Execute a start job: walk the run's flow from its entry trigger, or
    /// from the stored cursor when this is a redelivery.
    pub async fn run(&self, run_id: Uuid, stop: watch::Receiver<bool>) -> Result<FlowRun> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .change_context(InterpreterError::State)?;
        if !matches!(run.status, RunStatus::Queued | RunStatus::Running) {
            return Err(report!(InterpreterError::NotExecutable(run_id)));
        }
        let version = self
            .store
            .get_flow_version(run.flow_id, run.flow_version)
            .await
            .change_context(InterpreterError::State)?;
        self.store
            .transition_status(run_id, RunStatus::Running, None)
            .await
            .change_context(InterpreterError::State)?;

        let mut scope = Scope::new(run.trigger_payload.clone());
        let (journal, next) = match &run.cursor {
            Some(cursor) => {
                // Redelivered partially-executed run: rebuild the scope
                // from the journal and continue at the cursor.
                tracing::info!(run_id = %run_id, last_seq = cursor.last_seq, "resuming redelivered run from cursor");
                let log = self
                    .store
                    .list_step_log(run_id)
                    .await
                    .change_context(InterpreterError::State)?;
                rebuild_scope(&mut scope, &log);
                let journal = Journal::new(self.store.clone(), run_id, log);
                (journal, cursor.next.clone())
            }
            None => {
                let journal = Journal::new(self.store.clone(), run_id, Vec::new());
                let entry_step = version
                    .entry_step()
                    .ok_or_else(|| report!(InterpreterError::UnknownStep(version.entry.clone())))?;
                let successor = entry_step.kind.next().cloned();
                let now = Utc::now();
                journal
                    .append(
                        entry_step.id.clone(),
                        ExecPath::root(),
                        ValueRef::null(),
                        StepOutcome::Success {
                            output: run.trigger_payload.clone(),
                        },
                        now,
                        now,
                        1,
                        successor.clone(),
                    )
                    .await?;
                scope.insert(entry_step.id.as_str(), run.trigger_payload.clone());
                (journal, successor)
            }
        };

        self.walk(run_id, &version, scope, journal, next, stop).await
    }

    /// Execute a resume job: journal the wait step with the resume payload
    /// as its output and continue at the stored resume position.
    pub async fn resume(
        &self,
        run_id: Uuid,
        token: ResumeToken,
        payload: ValueRef,
        stop: watch::Receiver<bool>,
    ) -> Result<FlowRun> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .change_context(InterpreterError::State)?;
        if !matches!(run.status, RunStatus::Queued | RunStatus::Running) {
            return Err(report!(InterpreterError::NotExecutable(run_id)));
        }
        let version = self
            .store
            .get_flow_version(run.flow_id, run.flow_version)
            .await
            .change_context(InterpreterError::State)?;
        self.store
            .transition_status(run_id, RunStatus::Running, None)
            .await
            .change_context(InterpreterError::State)?;

        let log = self
            .store
            .list_step_log(run_id)
            .await
            .change_context(InterpreterError::State)?;
        let mut scope = Scope::new(run.trigger_payload.clone());
        rebuild_scope(&mut scope, &log);

        let journal = Journal::new(self.store.clone(), run_id, log);
        let now = Utc::now();
        journal
            .append(
                token.wait_step.clone(),
                ExecPath::root(),
                ValueRef::null(),
                StepOutcome::Success {
                    output: payload.clone(),
                },
                now,
                now,
                1,
                token.resume_at.clone(),
            )
            .await?;
        scope.insert(token.wait_step.as_str(), payload);

        self.walk(run_id, &version, scope, journal, token.resume_at, stop)
            .await
    }

    /// The top-level cursor walk. Stop and deadline take effect at step
    /// boundaries.
    async fn walk(
        &self,
        run_id: Uuid,
        version: &FlowVersion,
        mut scope: Scope,
        journal: Journal,
        mut next: Option<StepId>,
        stop: watch::Receiver<bool>,
    ) -> Result<FlowRun> {
        let deadline = self.run_deadline.map(|d| Instant::now() + d);

        let end = loop {
            let Some(step_id) = next else {
                break WalkEnd::Completed;
            };
            if *stop.borrow() {
                break WalkEnd::Stopped;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break WalkEnd::TimedOut;
            }

            let step = version
                .step(&step_id)
                .ok_or_else(|| report!(InterpreterError::UnknownStep(step_id.clone())))?;
            match &step.kind {
                StepKind::Trigger { .. } => {
                    return Err(report!(InterpreterError::UnexpectedStep(step_id)));
                }
                StepKind::Action { next: successor } => {
                    let exec = self.exec_with_retry(step, &scope).await;
                    match exec.outcome {
                        StepOutcome::Success { ref output } => {
                            scope.insert(step.id.as_str(), output.clone());
                            journal
                                .append(
                                    step.id.clone(),
                                    ExecPath::root(),
                                    exec.input,
                                    exec.outcome,
                                    exec.started_at,
                                    exec.finished_at,
                                    exec.attempt,
                                    successor.clone(),
                                )
                                .await?;
                            next = successor.clone();
                        }
                        StepOutcome::Failed { error } => {
                            match self
                                .apply_failure_policy(
                                    &journal, &mut scope, step, error.clone(), exec.input,
                                    exec.started_at, exec.finished_at, exec.attempt,
                                    successor.clone(),
                                )
                                .await?
                            {
                                Some(continue_at) => next = continue_at,
                                None => {
                                    break WalkEnd::Failed(StepFailure {
                                        step_id: step.id.clone(),
                                        error,
                                    });
                                }
                            }
                        }
                    }
                }
                StepKind::Branch {
                    condition,
                    on_true,
                    on_false,
                } => {
                    let started_at = Utc::now();
                    match scope.resolve_condition(condition) {
                        Ok(result) => {
                            let taken = if result { on_true } else { on_false };
                            // The journalled output is also what downstream
                            // references see; scope and journal must agree
                            // so resolution survives a redelivery.
                            let output: ValueRef = serde_json::json!({
                                "result": result,
                                "taken": taken.as_ref().map(|s| s.to_string()),
                            })
                            .into();
                            scope.insert(step.id.as_str(), output.clone());
                            journal
                                .append(
                                    step.id.clone(),
                                    ExecPath::root(),
                                    ValueRef::null(),
                                    StepOutcome::Success { output },
                                    started_at,
                                    Utc::now(),
                                    1,
                                    taken.clone(),
                                )
                                .await?;
                            next = taken.clone();
                        }
                        Err(error) => {
                            journal
                                .append(
                                    step.id.clone(),
                                    ExecPath::root(),
                                    ValueRef::null(),
                                    StepOutcome::Failed {
                                        error: error.clone(),
                                    },
                                    started_at,
                                    Utc::now(),
                                    1,
                                    Some(step.id.clone()),
                                )
                                .await?;
                            break WalkEnd::Failed(StepFailure {
                                step_id: step.id.clone(),
                                error,
                            });
                        }
                    }
                }
                StepKind::Loop { next: successor, .. } => {
                    let started_at = Utc::now();
                    match self
                        .exec_loop(version, &mut scope, &journal, step, ExecPath::root())
                        .await?
                    {
                        Ok((items, output)) => {
                            scope.insert(step.id.as_str(), output.clone());
                            journal
                                .append(
                                    step.id.clone(),
                                    ExecPath::root(),
                                    items,
                                    StepOutcome::Success { output },
                                    started_at,
                                    Utc::now(),
                                    1,
                                    successor.clone(),
                                )
                                .await?;
                            next = successor.clone();
                        }
                        Err(failure) => {
                            if failure.step_id == step.id {
                                // Loop-level error; the loop's own policy
                                // applies.
                                match self
                                    .apply_failure_policy(
                                        &journal, &mut scope, step, failure.error.clone(),
                                        ValueRef::null(), started_at, Utc::now(), 1,
                                        successor.clone(),
                                    )
                                    .await?
                                {
                                    Some(continue_at) => next = continue_at,
                                    None => break WalkEnd::Failed(failure),
                                }
                            } else {
                                // A body step escalated; the run fails on
                                // that step regardless of the loop's policy.
                                journal
                                    .append(
                                        step.id.clone(),
                                        ExecPath::root(),
                                        ValueRef::null(),
                                        StepOutcome::Failed {
                                            error: failure.error.clone(),
                                        },
                                        started_at,
                                        Utc::now(),
                                        1,
                                        Some(step.id.clone()),
                                    )
                                    .await?;
                                break WalkEnd::Failed(failure);
                            }
                        }
                    }
                }
                StepKind::Wait { next: successor } => {
                    let token = ResumeToken {
                        token: Uuid::now_v7(),
                        wait_step: step.id.clone(),
                        resume_at: successor.clone(),
                    };
                    let last_seq = *journal.next_seq.lock().await;
                    self.store
                        .set_paused(
                            run_id,
                            token.clone(),
                            Cursor {
                                next: successor.clone(),
                                last_seq: last_seq.saturating_sub(1),
                            },
                        )
                        .await
                        .change_context(InterpreterError::State)?;
                    tracing::info!(run_id = %run_id, step = %step.id, "run paused awaiting resume");
                    break WalkEnd::Paused;
                }
            }
        };

        self.settle(run_id, end).await
    }

    /// Record the terminal (or paused) status implied by how the walk
    /// ended, and return the final run record.
    async fn settle(&self, run_id: Uuid, end: WalkEnd) -> Result<FlowRun> {
        let run = match end {
            WalkEnd::Completed => {
                let run = self
                    .store
                    .transition_status(run_id, RunStatus::Succeeded, None)
                    .await
                    .change_context(InterpreterError::State)?;
                tracing::info!(run_id = %run_id, "run succeeded");
                run
            }
            WalkEnd::Stopped => {
                let run = self
                    .store
                    .transition_status(run_id, RunStatus::Stopped, None)
                    .await
                    .change_context(InterpreterError::State)?;
                tracing::info!(run_id = %run_id, "run stopped");
                run
            }
            WalkEnd::TimedOut => {
                let run = self
                    .store
                    .transition_status(run_id, RunStatus::TimedOut, None)
                    .await
                    .change_context(InterpreterError::State)?;
                tracing::warn!(run_id = %run_id, "run exceeded its deadline");
                run
            }
            WalkEnd::Failed(failure) => {
                let error = RunError::step_failed(failure.step_id.clone(), &failure.error);
                let run = self
                    .store
                    .transition_status(run_id, RunStatus::Failed, Some(error))
                    .await
                    .change_context(InterpreterError::State)?;
                tracing::warn!(run_id = %run_id, step = %failure.step_id, "run failed");
                run
            }
            WalkEnd::Paused => self
                .store
                .get_run(run_id)
                .await
                .change_context(InterpreterError::State)?,
        };
        Ok(run)
    }

    /// Journal a failed step and decide what happens next: `Some(next)` to
    /// continue under `OnError::Continue`, `None` to fail the run.
    #[allow(clippy::too_many_arguments)]
    async fn apply_failure_policy(
        &self,
        journal: &Journal,
        scope: &mut Scope,
        step: &Step,
        error: StepError,
        input: ValueRef,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        attempt: u32,
        successor: Option<StepId>,
    ) -> Result<Option<Option<StepId>>> {
        match &step.on_error {
            OnError::Fail => {
                journal
                    .append(
                        step.id.clone(),
                        ExecPath::root(),
                        input,
                        StepOutcome::Failed { error },
                        started_at,
                        finished_at,
                        attempt,
                        Some(step.id.clone()),
                    )
                    .await?;
                Ok(None)
            }
            OnError::Continue { failure_next } => {
                let error_value: ValueRef = serde_json::to_value(&error)
                    .unwrap_or(serde_json::Value::Null)
                    .into();
                scope.insert(step.id.as_str(), error_value);
                let continue_at = failure_next.clone().or(successor);
                journal
                    .append(
                        step.id.clone(),
                        ExecPath::root(),
                        input,
                        StepOutcome::Failed { error },
                        started_at,
                        finished_at,
                        attempt,
                        continue_at.clone(),
                    )
                    .await?;
                Ok(Some(continue_at))
            }
        }
    }

    /// Resolve a loop's items and execute its body once per element.
    ///
    /// Returns `Ok((items, outputs))` with per-iteration outputs in source
    /// order, or the failure to escalate: the loop's own id for loop-level
    /// errors, the body step's id for escalated body failures.
    fn exec_loop<'a>(
        &'a self,
        version: &'a FlowVersion,
        scope: &'a mut Scope,
        journal: &'a Journal,
        step: &'a Step,
        path: ExecPath,
    ) -> BoxFuture<'a, Result<std::result::Result<(ValueRef, ValueRef), StepFailure>>> {
        async move {
            let StepKind::Loop {
                items,
                body,
                mode,
                max_iterations,
                ..
            } = &step.kind
            else {
                return Err(report!(InterpreterError::UnexpectedStep(step.id.clone())));
            };

            let loop_failure = |error: StepError| StepFailure {
                step_id: step.id.clone(),
                error,
            };

            let items_value = match scope.resolve_expr(items) {
                Ok(value) => value,
                Err(error) => return Ok(Err(loop_failure(error))),
            };
            let Some(elements) = items_value.as_array().map(|s| s.to_vec()) else {
                return Ok(Err(loop_failure(StepError::input_invalid(
                    "loop items did not resolve to an array",
                ))));
            };
            if elements.len() as u32 > *max_iterations {
                return Ok(Err(loop_failure(StepError::new(
                    StepErrorKind::ResourceExceeded,
                    format!(
                        "loop would run {} iterations, budget is {max_iterations}",
                        elements.len()
                    ),
                ))));
            }

            let outputs = match mode {
                LoopMode::Sequential => {
                    let mut outputs = Vec::with_capacity(elements.len());
                    for (index, element) in elements.into_iter().enumerate() {
                        let iter_path = path.iteration(index as u32);
                        // An iteration journalled by a previous delivery is
                        // not re-executed.
                        if let Some(output) = journal.iteration_output(&step.id, &iter_path) {
                            outputs.push(output.as_ref().clone());
                            continue;
                        }
                        let iter_started = Utc::now();
                        scope.push_iteration(ValueRef::new(element), index as u32);
                        let end = self
                            .walk_segment(
                                version,
                                scope,
                                journal,
                                body.clone(),
                                iter_path.clone(),
                                &step.id,
                            )
                            .await;
                        scope.pop_iteration();
                        match end? {
                            Ok(output) => {
                                journal
                                    .append(
                                        step.id.clone(),
                                        iter_path,
                                        ValueRef::null(),
                                        StepOutcome::Success {
                                            output: output.clone(),
                                        },
                                        iter_started,
                                        Utc::now(),
                                        1,
                                        Some(step.id.clone()),
                                    )
                                    .await?;
                                outputs.push(output.as_ref().clone());
                            }
                            Err(failure) => return Ok(Err(failure)),
                        }
                    }
                    outputs
                }
                LoopMode::Parallel { max_concurrency } => {
                    let semaphore = Arc::new(Semaphore::new((*max_concurrency).max(1)));
                    let iterations = elements.into_iter().enumerate().map(|(index, element)| {
                        let mut iter_scope = scope.clone();
                        let semaphore = semaphore.clone();
                        let iter_path = path.iteration(index as u32);
                        let body = body.clone();
                        async move {
                            if let Some(output) =
                                journal.iteration_output(&step.id, &iter_path)
                            {
                                return Result::<_>::Ok(Ok(output));
                            }
                            let _permit =
                                semaphore.acquire().await.expect("semaphore never closed");
                            let iter_started = Utc::now();
                            iter_scope.push_iteration(ValueRef::new(element), index as u32);
                            let end = self
                                .walk_segment(
                                    version,
                                    &mut iter_scope,
                                    journal,
                                    body,
                                    iter_path.clone(),
                                    &step.id,
                                )
                                .await?;
                            match end {
                                Ok(output) => {
                                    journal
                                        .append(
                                            step.id.clone(),
                                            iter_path,
                                            ValueRef::null(),
                                            StepOutcome::Success {
                                                output: output.clone(),
                                            },
                                            iter_started,
                                            Utc::now(),
                                            1,
                                            Some(step.id.clone()),
                                        )
                                        .await?;
                                    Ok(Ok(output))
                                }
                                Err(failure) => Ok(Err(failure)),
                            }
                        }
                    });
                    let results = futures::future::join_all(iterations).await;
                    let mut outputs = Vec::with_capacity(results.len());
                    for end in results {
                        match end? {
                            Ok(output) => outputs.push(output.as_ref().clone()),
                            Err(failure) => return Ok(Err(failure)),
                        }
                    }
                    outputs
                }
            };

            Ok(Ok((items_value, ValueRef::from(outputs))))
        }
        .boxed()
    }

    /// Walk one loop-body sub-graph for a single iteration. Entries carry
    /// the iteration path; the cursor stays parked on the owning loop step,
    /// so a redelivery re-enters the loop and recovers completed iterations
    /// from their journalled summary entries. Only an iteration caught
    /// mid-flight by the crash is walked again.
    fn walk_segment<'a>(
        &'a self,
        version: &'a FlowVersion,
        scope: &'a mut Scope,
        journal: &'a Journal,
        start: StepId,
        path: ExecPath,
        cursor_home: &'a StepId,
    ) -> BoxFuture<'a, Result<std::result::Result<ValueRef, StepFailure>>> {
        async move {
            let mut next = Some(start);
            let mut last_output = ValueRef::null();
            while let Some(step_id) = next {
                let step = version
                    .step(&step_id)
                    .ok_or_else(|| report!(InterpreterError::UnknownStep(step_id.clone())))?;
                match &step.kind {
                    StepKind::Trigger { .. } | StepKind::Wait { .. } => {
                        return Err(report!(InterpreterError::UnexpectedStep(step_id)));
                    }
                    StepKind::Action { next: successor } => {
                        let exec = self.exec_with_retry(step, scope).await;
                        match exec.outcome {
                            StepOutcome::Success { ref output } => {
                                scope.insert(step.id.as_str(), output.clone());
                                last_output = output.clone();
                                journal
                                    .append(
                                        step.id.clone(),
                                        path.clone(),
                                        exec.input,
                                        exec.outcome,
                                        exec.started_at,
                                        exec.finished_at,
                                        exec.attempt,
                                        Some(cursor_home.clone()),
                                    )
                                    .await?;
                                next = successor.clone();
                            }
                            StepOutcome::Failed { error } => {
                                journal
                                    .append(
                                        step.id.clone(),
                                        path.clone(),
                                        exec.input,
                                        StepOutcome::Failed {
                                            error: error.clone(),
                                        },
                                        exec.started_at,
                                        exec.finished_at,
                                        exec.attempt,
                                        Some(cursor_home.clone()),
                                    )
                                    .await?;
                                match &step.on_error {
                                    OnError::Fail => {
                                        return Ok(Err(StepFailure {
                                            step_id: step.id.clone(),
                                            error,
                                        }));
                                    }
                                    OnError::Continue { failure_next } => {
                                        let error_value: ValueRef = serde_json::to_value(&error)
                                            .unwrap_or(serde_json::Value::Null)
                                            .into();
                                        scope.insert(step.id.as_str(), error_value.clone());
                                        last_output = error_value;
                                        next = failure_next.clone().or(successor.clone());
                                    }
                                }
                            }
                        }
                    }
                    StepKind::Branch {
                        condition,
                        on_true,
                        on_false,
                    } => {
                        let started_at = Utc::now();
                        match scope.resolve_condition(condition) {
                            Ok(result) => {
                                let taken = if result { on_true } else { on_false };
                                let output: ValueRef = serde_json::json!({
                                    "result": result,
                                    "taken": taken.as_ref().map(|s| s.to_string()),
                                })
                                .into();
                                scope.insert(step.id.as_str(), output.clone());
                                journal
                                    .append(
                                        step.id.clone(),
                                        path.clone(),
                                        ValueRef::null(),
                                        StepOutcome::Success { output },
                                        started_at,
                                        Utc::now(),
                                        1,
                                        Some(cursor_home.clone()),
                                    )
                                    .await?;
                                next = taken.clone();
                            }
                            Err(error) => {
                                journal
                                    .append(
                                        step.id.clone(),
                                        path.clone(),
                                        ValueRef::null(),
                                        StepOutcome::Failed {
                                            error: error.clone(),
                                        },
                                        started_at,
                                        Utc::now(),
                                        1,
                                        Some(cursor_home.clone()),
                                    )
                                    .await?;
                                return Ok(Err(StepFailure {
                                    step_id: step.id.clone(),
                                    error,
                                }));
                            }
                        }
                    }
                    StepKind::Loop { next: successor, .. } => {
                        let started_at = Utc::now();
                        match self
                            .exec_loop(version, scope, journal, step, path.clone())
                            .await?
                        {
                            Ok((items, output)) => {
                                scope.insert(step.id.as_str(), output.clone());
                                last_output = output.clone();
                                journal
                                    .append(
                                        step.id.clone(),
                                        path.clone(),
                                        items,
                                        StepOutcome::Success { output },
                                        started_at,
                                        Utc::now(),
                                        1,
                                        Some(cursor_home.clone()),
                                    )
                                    .await?;
                                next = successor.clone();
                            }
                            Err(failure) => {
                                journal
                                    .append(
                                        step.id.clone(),
                                        path.clone(),
                                        ValueRef::null(),
                                        StepOutcome::Failed {
                                            error: failure.error.clone(),
                                        },
                                        started_at,
                                        Utc::now(),
                                        1,
                                        Some(cursor_home.clone()),
                                    )
                                    .await?;
                                return Ok(Err(failure));
                            }
                        }
                    }
                }
            }
            Ok(Ok(last_output))
        }
        .boxed()
    }

    /// Prepare and execute one action step, applying its retry policy.
    /// Every failure mode folds into the returned outcome.
    async fn exec_with_retry(&self, step: &Step, scope: &Scope) -> ExecReport {
        let started_at = Utc::now();

        let input = match scope.resolve_template(&step.input) {
            Ok(input) => input,
            Err(error) => return ExecReport::failed(error, started_at),
        };
        let connection = match &step.connection {
            None => None,
            Some(reference) => match self.connections.connection(reference).await {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(step = %step.id, ?err, "connection resolution failed");
                    let mut report = ExecReport::failed(
                        StepError::thrown(format!("connection {reference:?} is unavailable"))
                            .with_code("CONNECTION"),
                        started_at,
                    );
                    report.input = input;
                    return report;
                }
            },
        };
        let handler = match self.registry.resolve(&step.capability) {
            Ok(handler) => handler,
            Err(_) => {
                let mut report = ExecReport::failed(
                    StepError::thrown(format!("unknown capability {}", step.capability))
                        .with_code("UNKNOWN_CAPABILITY"),
                    started_at,
                );
                report.input = input;
                return report;
            }
        };
        if let Err(error) = handler.validate_input(&input) {
            let mut report = ExecReport::failed(error, started_at);
            report.input = input;
            return report;
        }

        let limits = match step.timeout_ms {
            Some(ms) => self.limits.clone().with_timeout(Duration::from_millis(ms)),
            None => self.limits.clone(),
        };
        let max_attempts = step.retry.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let execution = self
                .executor
                .execute(handler.clone(), input.clone(), connection.clone(), &limits)
                .await;
            for line in &execution.logs {
                tracing::debug!(step = %step.id, "{line}");
            }
            match &execution.outcome {
                StepOutcome::Failed { error }
                    if attempt < max_attempts && error.is_retryable() =>
                {
                    let window = step.retry.backoff.window_ms(attempt - 1);
                    let delay = rand::thread_rng().gen_range(0..=window);
                    tracing::debug!(
                        step = %step.id,
                        attempt,
                        delay_ms = delay,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                _ => {
                    return ExecReport {
                        outcome: execution.outcome,
                        input,
                        attempt,
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
            }
        }
    }
}

/// Reconstruct the top-level scope from the step log. Failed entries are
/// only present at the top level when the step continued under its error
/// policy, so their serialized error doubles as the recorded output.
fn rebuild_scope(scope: &mut Scope, log: &[StepLogEntry]) {
    for entry in log {
        if !entry.path.is_root() {
            continue;
        }
        match &entry.outcome {
            StepOutcome::Success { output } => {
                scope.insert(entry.step_id.as_str(), output.clone());
            }
            StepOutcome::Failed { error } => {
                let error_value: ValueRef = serde_json::to_value(error)
                    .unwrap_or(serde_json::Value::Null)
                    .into();
                scope.insert(entry.step_id.as_str(), error_value);
            }
        }
    }
}

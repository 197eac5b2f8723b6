use std::collections::HashMap;
use std::sync::Arc;

use error_stack::report;
use futures::future::{BoxFuture, FutureExt as _};
use tokio::sync::RwLock;
use uuid::Uuid;

use flowrun_core::{
    Cursor, FlowRun, FlowVersion, ResumeToken, RunError, RunStatus, StepLogEntry,
};

use crate::state_store::{transition_allowed, RunFilters, RunStateStore};
use crate::{Result, StateError};

/// One run's record and its append-only step log. Held together so an
/// append and its cursor advance happen under the same lock.
#[derive(Debug)]
struct RunRecord {
    run: FlowRun,
    log: Vec<StepLogEntry>,
}

#[derive(Default)]
struct Inner {
    flow_versions: HashMap<(Uuid, u32), Arc<FlowVersion>>,
    runs: HashMap<Uuid, RunRecord>,
}

/// In-memory implementation of [`RunStateStore`].
///
/// Suitable for a single-process engine and for tests. All state for a
/// store lives behind one lock, which makes the append+cursor atomicity
/// trivial; a persistent backend would use a transaction instead.
pub struct InMemoryRunStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn record_mut(&mut self, run_id: Uuid) -> Result<&mut RunRecord> {
        self.runs
            .get_mut(&run_id)
            .ok_or_else(|| report!(StateError::RunNotFound(run_id)))
    }
}

impl RunStateStore for InMemoryRunStore {
    fn put_flow_version(&self, version: FlowVersion) -> BoxFuture<'_, Result<()>> {
        let inner = self.inner.clone();
        async move {
            let mut inner = inner.write().await;
            inner
                .flow_versions
                .insert((version.flow_id, version.version), Arc::new(version));
            Ok(())
        }
        .boxed()
    }

    fn get_flow_version(
        &self,
        flow_id: Uuid,
        version: u32,
    ) -> BoxFuture<'_, Result<Arc<FlowVersion>>> {
        let inner = self.inner.clone();
        async move {
            let inner = inner.read().await;
            inner
                .flow_versions
                .get(&(flow_id, version))
                .cloned()
                .ok_or_else(|| report!(StateError::FlowVersionNotFound { flow_id, version }))
        }
        .boxed()
    }

    fn create_run(&self, run: FlowRun) -> BoxFuture<'_, Result<()>> {
        let inner = self.inner.clone();
        async move {
            let mut inner = inner.write().await;
            inner
                .runs
                .insert(run.run_id, RunRecord { run, log: Vec::new() });
            Ok(())
        }
        .boxed()
    }

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<FlowRun>> {
        let inner = self.inner.clone();
        async move {
            let inner = inner.read().await;
            inner
                .runs
                .get(&run_id)
                .map(|record| record.run.clone())
                .ok_or_else(|| report!(StateError::RunNotFound(run_id)))
        }
        .boxed()
    }

    fn transition_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<RunError>,
    ) -> BoxFuture<'_, Result<FlowRun>> {
        let inner = self.inner.clone();
        async move {
            let mut inner = inner.write().await;
            let record = inner.record_mut(run_id)?;
            let from = record.run.status;
            if from.is_terminal() {
                return Err(report!(StateError::TerminalRun(run_id)));
            }
            if !transition_allowed(from, status) {
                return Err(report!(StateError::InvalidTransition { from, to: status }));
            }
            record.run.status = status;
            if status.is_terminal() {
                record.run.finished_at = Some(chrono::Utc::now());
            }
            if let Some(error) = error {
                record.run.error = Some(error);
            }
            Ok(record.run.clone())
        }
        .boxed()
    }

    fn append_step_entry(
        &self,
        run_id: Uuid,
        entry: StepLogEntry,
        cursor: Cursor,
    ) -> BoxFuture<'_, Result<()>> {
        let inner = self.inner.clone();
        async move {
            let mut inner = inner.write().await;
            let record = inner.record_mut(run_id)?;
            if record.run.status.is_terminal() {
                return Err(report!(StateError::TerminalRun(run_id)));
            }
            let expected = record.log.len() as u64;
            if entry.seq != expected {
                return Err(report!(StateError::SequenceGap {
                    expected,
                    got: entry.seq,
                }));
            }
            record.log.push(entry);
            record.run.cursor = Some(cursor);
            Ok(())
        }
        .boxed()
    }

    fn set_paused(
        &self,
        run_id: Uuid,
        token: ResumeToken,
        cursor: Cursor,
    ) -> BoxFuture<'_, Result<()>> {
        let inner = self.inner.clone();
        async move {
            let mut inner = inner.write().await;
            let record = inner.record_mut(run_id)?;
            let from = record.run.status;
            if !transition_allowed(from, RunStatus::Paused) {
                return Err(report!(StateError::InvalidTransition {
                    from,
                    to: RunStatus::Paused,
                }));
            }
            record.run.status = RunStatus::Paused;
            record.run.resume = Some(token);
            record.run.cursor = Some(cursor);
            Ok(())
        }
        .boxed()
    }

    fn take_resume(
        &self,
        run_id: Uuid,
        token: Uuid,
    ) -> BoxFuture<'_, Result<(FlowRun, ResumeToken)>> {
        let inner = self.inner.clone();
        async move {
            let mut inner = inner.write().await;
            let record = inner.record_mut(run_id)?;
            if record.run.status != RunStatus::Paused {
                return Err(report!(StateError::InvalidTransition {
                    from: record.run.status,
                    to: RunStatus::Queued,
                }));
            }
            match &record.run.resume {
                Some(resume) if resume.token == token => {}
                _ => return Err(report!(StateError::ResumeTokenMismatch(run_id))),
            }
            let resume = record
                .run
                .resume
                .take()
                .ok_or_else(|| report!(StateError::ResumeTokenMismatch(run_id)))?;
            record.run.status = RunStatus::Queued;
            Ok((record.run.clone(), resume))
        }
        .boxed()
    }

    fn list_step_log(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepLogEntry>>> {
        let inner = self.inner.clone();
        async move {
            let inner = inner.read().await;
            inner
                .runs
                .get(&run_id)
                .map(|record| record.log.clone())
                .ok_or_else(|| report!(StateError::RunNotFound(run_id)))
        }
        .boxed()
    }

    fn list_runs(&self, filters: &RunFilters) -> BoxFuture<'_, Result<Vec<FlowRun>>> {
        let inner = self.inner.clone();
        let filters = filters.clone();
        async move {
            let inner = inner.read().await;
            let mut runs: Vec<FlowRun> = inner
                .runs
                .values()
                .filter(|record| {
                    if let Some(status) = filters.status {
                        if record.run.status != status {
                            return false;
                        }
                    }
                    if let Some(flow_id) = filters.flow_id {
                        if record.run.flow_id != flow_id {
                            return false;
                        }
                    }
                    true
                })
                .map(|record| record.run.clone())
                .collect();
            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            if let Some(offset) = filters.offset {
                runs = runs.split_off(offset.min(runs.len()));
            }
            if let Some(limit) = filters.limit {
                runs.truncate(limit);
            }
            Ok(runs)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowrun_core::{ExecPath, StepError, StepId, StepOutcome, ValueRef};
    use serde_json::json;

    fn entry(seq: u64, step: &str) -> StepLogEntry {
        StepLogEntry {
            seq,
            step_id: StepId::from(step),
            path: ExecPath::root(),
            input: ValueRef::null(),
            outcome: StepOutcome::Success {
                output: json!({"seq": seq}).into(),
            },
            started_at: Utc::now(),
            finished_at: Utc::now(),
            attempt: 1,
        }
    }

    fn cursor(next: Option<&str>, last_seq: u64) -> Cursor {
        Cursor {
            next: next.map(StepId::from),
            last_seq,
        }
    }

    async fn queued_run(store: &InMemoryRunStore) -> FlowRun {
        let run = FlowRun::new(Uuid::now_v7(), 1, json!({"event": "x"}).into());
        store.create_run(run.clone()).await.unwrap();
        run
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let store = InMemoryRunStore::new();
        let run = queued_run(&store).await;

        let fetched = store.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched, run);
        assert_eq!(fetched.status, RunStatus::Queued);

        let missing = store.get_run(Uuid::now_v7()).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_status_transitions_enforced() {
        let store = InMemoryRunStore::new();
        let run = queued_run(&store).await;

        // Queued cannot jump straight to Succeeded.
        let err = store
            .transition_status(run.run_id, RunStatus::Succeeded, None)
            .await;
        assert!(err.is_err());

        store
            .transition_status(run.run_id, RunStatus::Running, None)
            .await
            .unwrap();
        let updated = store
            .transition_status(run.run_id, RunStatus::Succeeded, None)
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Succeeded);
        assert!(updated.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_runs_are_immutable() {
        let store = InMemoryRunStore::new();
        let run = queued_run(&store).await;
        store
            .transition_status(run.run_id, RunStatus::Stopped, None)
            .await
            .unwrap();

        let err = store
            .transition_status(run.run_id, RunStatus::Running, None)
            .await;
        assert!(err.is_err());

        let err = store
            .append_step_entry(run.run_id, entry(0, "a"), cursor(None, 0))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_failed_records_error() {
        let store = InMemoryRunStore::new();
        let run = queued_run(&store).await;
        store
            .transition_status(run.run_id, RunStatus::Running, None)
            .await
            .unwrap();

        let step_error = StepError::thrown("boom");
        let updated = store
            .transition_status(
                run.run_id,
                RunStatus::Failed,
                Some(RunError::step_failed(StepId::from("a"), &step_error)),
            )
            .await
            .unwrap();
        let error = updated.error.unwrap();
        assert_eq!(error.step_id, Some(StepId::from("a")));
        assert!(error.message.contains("boom"));
    }

    #[tokio::test]
    async fn test_append_advances_cursor_atomically() {
        let store = InMemoryRunStore::new();
        let run = queued_run(&store).await;
        store
            .transition_status(run.run_id, RunStatus::Running, None)
            .await
            .unwrap();

        store
            .append_step_entry(run.run_id, entry(0, "a"), cursor(Some("b"), 0))
            .await
            .unwrap();
        store
            .append_step_entry(run.run_id, entry(1, "b"), cursor(None, 1))
            .await
            .unwrap();

        let fetched = store.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.cursor, Some(cursor(None, 1)));

        let log = store.list_step_log(run.run_id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].seq, 0);
        assert_eq!(log[1].seq, 1);
    }

    #[tokio::test]
    async fn test_sequence_gap_rejected() {
        let store = InMemoryRunStore::new();
        let run = queued_run(&store).await;
        store
            .transition_status(run.run_id, RunStatus::Running, None)
            .await
            .unwrap();

        store
            .append_step_entry(run.run_id, entry(0, "a"), cursor(Some("b"), 0))
            .await
            .unwrap();

        // Skipping seq 1 is a gap; replaying seq 0 is too.
        let gap = store
            .append_step_entry(run.run_id, entry(2, "c"), cursor(None, 2))
            .await;
        assert!(gap.is_err());
        let replay = store
            .append_step_entry(run.run_id, entry(0, "a"), cursor(None, 0))
            .await;
        assert!(replay.is_err());

        // The cursor still reflects the last good append.
        let fetched = store.get_run(run.run_id).await.unwrap();
        assert_eq!(fetched.cursor, Some(cursor(Some("b"), 0)));
    }

    #[tokio::test]
    async fn test_pause_and_resume_token_single_use() {
        let store = InMemoryRunStore::new();
        let run = queued_run(&store).await;
        store
            .transition_status(run.run_id, RunStatus::Running, None)
            .await
            .unwrap();

        let token = ResumeToken {
            token: Uuid::now_v7(),
            wait_step: StepId::from("wait"),
            resume_at: Some(StepId::from("after")),
        };
        store
            .set_paused(run.run_id, token.clone(), cursor(Some("after"), 3))
            .await
            .unwrap();

        let paused = store.get_run(run.run_id).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(paused.resume, Some(token.clone()));

        // Wrong token is rejected without consuming the real one.
        let wrong = store.take_resume(run.run_id, Uuid::now_v7()).await;
        assert!(wrong.is_err());

        let (resumed, taken) = store.take_resume(run.run_id, token.token).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Queued);
        assert_eq!(taken, token);
        assert!(resumed.resume.is_none());

        // A token is single-use.
        let replay = store.take_resume(run.run_id, token.token).await;
        assert!(replay.is_err());
    }

    #[tokio::test]
    async fn test_flow_version_storage() {
        let store = InMemoryRunStore::new();
        let flow_id = Uuid::now_v7();
        let version = FlowVersion {
            flow_id,
            version: 3,
            name: Some("demo".to_string()),
            entry: StepId::from("start"),
            steps: Default::default(),
        };
        store.put_flow_version(version.clone()).await.unwrap();

        let fetched = store.get_flow_version(flow_id, 3).await.unwrap();
        assert_eq!(fetched.name.as_deref(), Some("demo"));

        let missing = store.get_flow_version(flow_id, 4).await;
        assert!(missing.is_err());
    }

    #[tokio::test]
    async fn test_list_runs_filters() {
        let store = InMemoryRunStore::new();
        let flow_a = Uuid::now_v7();
        let flow_b = Uuid::now_v7();

        let run_a = FlowRun::new(flow_a, 1, ValueRef::null());
        let run_b = FlowRun::new(flow_b, 1, ValueRef::null());
        store.create_run(run_a.clone()).await.unwrap();
        store.create_run(run_b.clone()).await.unwrap();
        store
            .transition_status(run_b.run_id, RunStatus::Running, None)
            .await
            .unwrap();

        let all = store.list_runs(&RunFilters::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let queued = store
            .list_runs(&RunFilters {
                status: Some(RunStatus::Queued),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].run_id, run_a.run_id);

        let by_flow = store
            .list_runs(&RunFilters {
                flow_id: Some(flow_b),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_flow.len(), 1);

        let limited = store
            .list_runs(&RunFilters {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}

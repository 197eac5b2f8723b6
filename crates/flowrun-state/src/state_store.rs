use std::sync::Arc;

use futures::future::BoxFuture;
use uuid::Uuid;

use flowrun_core::{
    Cursor, FlowRun, FlowVersion, ResumeToken, RunError, RunStatus, StepLogEntry,
};

use crate::Result;

/// Durable storage for flow versions, run records, and step logs.
///
/// Every mutation is atomic with respect to the run record it touches; in
/// particular `append_step_entry` persists the log entry and the advanced
/// cursor as one unit, so a crash between them is impossible to observe.
pub trait RunStateStore: Send + Sync {
    /// Store an immutable flow version. Overwriting an existing
    /// `(flow_id, version)` pair is allowed only with identical content;
    /// callers publish new versions instead of editing old ones.
    fn put_flow_version(&self, version: FlowVersion) -> BoxFuture<'_, Result<()>>;

    /// Fetch the exact flow version a run is pinned to.
    fn get_flow_version(
        &self,
        flow_id: Uuid,
        version: u32,
    ) -> BoxFuture<'_, Result<Arc<FlowVersion>>>;

    /// Create a new run record in status `Queued`.
    fn create_run(&self, run: FlowRun) -> BoxFuture<'_, Result<()>>;

    fn get_run(&self, run_id: Uuid) -> BoxFuture<'_, Result<FlowRun>>;

    /// Move a run to a new status, enforcing the legal transition graph.
    /// Terminal runs reject every further transition. Entering a terminal
    /// status records `finished_at`; entering `Failed` records `error`.
    ///
    /// Returns the updated run record.
    fn transition_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<RunError>,
    ) -> BoxFuture<'_, Result<FlowRun>>;

    /// Append one step-log entry and advance the cursor, atomically.
    ///
    /// Sequence numbers must be contiguous from 0 within the run; a gap or
    /// replay is rejected with `SequenceGap`.
    fn append_step_entry(
        &self,
        run_id: Uuid,
        entry: StepLogEntry,
        cursor: Cursor,
    ) -> BoxFuture<'_, Result<()>>;

    /// Park a running run: status becomes `Paused` and the resume token and
    /// cursor are stored durably.
    fn set_paused(
        &self,
        run_id: Uuid,
        token: ResumeToken,
        cursor: Cursor,
    ) -> BoxFuture<'_, Result<()>>;

    /// Consume a resume token: validates that the run is `Paused` and holds
    /// exactly this token, clears it, and moves the run back to `Queued`.
    ///
    /// The token is single-use; a second call with the same token fails
    /// with `ResumeTokenMismatch`.
    fn take_resume(
        &self,
        run_id: Uuid,
        token: Uuid,
    ) -> BoxFuture<'_, Result<(FlowRun, ResumeToken)>>;

    /// The full step log of a run, ordered by `seq`.
    fn list_step_log(&self, run_id: Uuid) -> BoxFuture<'_, Result<Vec<StepLogEntry>>>;

    /// List run records, newest first, with optional filtering.
    fn list_runs(&self, filters: &RunFilters) -> BoxFuture<'_, Result<Vec<FlowRun>>>;
}

/// Filters for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilters {
    pub status: Option<RunStatus>,
    pub flow_id: Option<Uuid>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Whether the status graph permits moving a run from `from` to `to`.
///
/// Same-status transitions are permitted for non-terminal runs so a
/// redelivered job can re-assert `Running` without a special case.
pub fn transition_allowed(from: RunStatus, to: RunStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    if from == to {
        return true;
    }
    use RunStatus::*;
    match from {
        Queued => matches!(to, Running | Stopped | Failed),
        Running => matches!(to, Paused | Succeeded | Failed | Stopped | TimedOut),
        Paused => matches!(to, Queued | Stopped | Failed),
        Succeeded | Failed | Stopped | TimedOut => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_graph() {
        use RunStatus::*;
        assert!(transition_allowed(Queued, Running));
        assert!(transition_allowed(Running, Paused));
        assert!(transition_allowed(Running, Succeeded));
        assert!(transition_allowed(Running, TimedOut));
        assert!(transition_allowed(Paused, Queued));
        assert!(transition_allowed(Queued, Failed));

        assert!(!transition_allowed(Queued, Succeeded));
        assert!(!transition_allowed(Paused, Running));
        assert!(!transition_allowed(Succeeded, Running));
        assert!(!transition_allowed(Failed, Queued));

        // Redelivery re-asserts the current status.
        assert!(transition_allowed(Running, Running));
        assert!(!transition_allowed(Stopped, Stopped));
    }
}

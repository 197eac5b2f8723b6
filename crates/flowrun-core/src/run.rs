use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepId;
use crate::step_error::{StepError, StepOutcome};
use crate::value::ValueRef;

/// Lifecycle status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Running,
    Paused,
    Succeeded,
    Failed,
    Stopped,
    TimedOut,
}

impl RunStatus {
    /// Terminal runs are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Stopped | Self::TimedOut
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::TimedOut => "TIMED_OUT",
        };
        write!(f, "{s}")
    }
}

/// One segment of a step's execution-path identity. Only loop iterations
/// fork paths: entries from different iterations of a parallel loop carry
/// distinct paths, and total order within one path is preserved by `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PathSegment {
    Loop { iteration: u32 },
}

/// Path identity of a step-log entry within the run's execution tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[repr(transparent)]
pub struct ExecPath(Vec<PathSegment>);

impl ExecPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn iteration(&self, iteration: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Loop { iteration });
        Self(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }
}

/// One entry of a run's append-only step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepLogEntry {
    /// Execution sequence number, contiguous from 0 within a run.
    pub seq: u64,
    pub step_id: StepId,
    #[serde(default, skip_serializing_if = "ExecPath::is_root")]
    pub path: ExecPath,
    /// Snapshot of the resolved input the step was invoked with.
    pub input: ValueRef,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Executor invocations used for this entry (1 when no retries).
    pub attempt: u32,
}

impl StepLogEntry {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Durable marker of where a paused run must continue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResumeToken {
    /// Opaque token the external resume event must present.
    pub token: Uuid,
    /// The wait step that paused the run; the resume payload becomes its
    /// output.
    pub wait_step: StepId,
    /// The exact successor to resume at. `None` means the wait step was
    /// the last step of the flow.
    pub resume_at: Option<StepId>,
}

/// Durable position of the interpreter cursor within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Cursor {
    /// The next top-level step to execute, or `None` when the walk is done.
    pub next: Option<StepId>,
    /// Sequence number of the last durably recorded step-log entry.
    pub last_seq: u64,
}

/// Why a run reached status Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunErrorKind {
    /// A step failed and its error policy escalated.
    StepFailed,
    /// The run's job exceeded its maximum delivery count. System-level:
    /// distinguished from step-originated failures.
    JobDeadLettered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunError {
    pub kind: RunErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub message: String,
}

impl RunError {
    pub fn step_failed(step_id: StepId, error: &StepError) -> Self {
        Self {
            kind: RunErrorKind::StepFailed,
            message: error.to_string(),
            step_id: Some(step_id),
        }
    }

    pub fn dead_lettered(deliveries: u32) -> Self {
        Self {
            kind: RunErrorKind::JobDeadLettered,
            step_id: None,
            message: format!("job exceeded maximum delivery count ({deliveries} deliveries)"),
        }
    }
}

/// One execution instance of a flow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowRun {
    pub run_id: Uuid,
    pub flow_id: Uuid,
    /// The exact version this run executes under, regardless of later
    /// publishes.
    pub flow_version: u32,
    pub status: RunStatus,
    pub trigger_payload: ValueRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumeToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl FlowRun {
    pub fn new(flow_id: Uuid, flow_version: u32, trigger_payload: ValueRef) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            flow_id,
            flow_version,
            status: RunStatus::Queued,
            trigger_payload,
            cursor: None,
            resume: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }
}

use flowrun_core::RunStatus;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Flow version not found: {flow_id} v{version}")]
    FlowVersionNotFound { flow_id: Uuid, version: u32 },

    #[error("Illegal status transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Run {0} is in a terminal status")]
    TerminalRun(Uuid),

    #[error("Step log sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("Run {0} holds no matching resume token")]
    ResumeTokenMismatch(Uuid),
}

pub type Result<T, E = error_stack::Report<StateError>> = std::result::Result<T, E>;

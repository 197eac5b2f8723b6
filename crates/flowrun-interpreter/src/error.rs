use flowrun_core::StepId;
use uuid::Uuid;

/// Infrastructure failures of the interpreter itself. Step-level failures
/// never surface here; they are recorded as outcomes and run errors.
#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("Unknown step: {0}")]
    UnknownStep(StepId),

    #[error("Step {0} cannot appear at this position")]
    UnexpectedStep(StepId),

    #[error("Run {0} is not in an executable status")]
    NotExecutable(Uuid),

    #[error("Run state operation failed")]
    State,
}

pub type Result<T, E = error_stack::Report<InterpreterError>> = std::result::Result<T, E>;

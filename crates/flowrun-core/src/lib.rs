//! Core data model for the flowrun engine: flow graphs, values,
//! expressions, run records, and structural validation.

pub mod expr;
pub mod flow;
pub mod run;
pub mod step;
pub mod step_error;
pub mod validate;
pub mod value;

pub use expr::{Condition, Expr, StepRef, REF_KEY};
pub use flow::{Flow, FlowVersion};
pub use run::{
    Cursor, ExecPath, FlowRun, PathSegment, ResumeToken, RunError, RunErrorKind, RunStatus,
    StepLogEntry,
};
pub use step::{Backoff, CapabilityRef, LoopMode, OnError, RetryPolicy, Step, StepId, StepKind};
pub use step_error::{StepError, StepErrorKind, StepOutcome};
pub use validate::{validate_version, ValidationError};
pub use value::ValueRef;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::value::ValueRef;

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// Template resolution or input schema validation failed before the
    /// executor was invoked.
    InputInvalid,
    /// The step exceeded its wall-clock budget.
    Timeout,
    /// The step exceeded its memory/output budget.
    ResourceExceeded,
    /// The step implementation raised a structured error.
    Thrown,
    /// The isolated execution context terminated abnormally. Treated
    /// identically to `Thrown` by the interpreter.
    Crash,
}

/// A structured error reported for one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
    /// Optional machine-readable code supplied by the step implementation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ValueRef>,
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{:?}({}): {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            data: None,
        }
    }

    pub fn thrown(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Thrown, message)
    }

    pub fn input_invalid(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::InputInvalid, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<ValueRef>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Whether re-invoking the executor can plausibly change the outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, StepErrorKind::InputInvalid)
    }
}

/// The result of one step execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum StepOutcome {
    /// The step completed and produced an output value.
    Success { output: ValueRef },
    /// The step failed with the given error.
    Failed { error: StepError },
}

impl StepOutcome {
    pub fn success(&self) -> Option<&ValueRef> {
        match self {
            Self::Success { output } => Some(output),
            _ => None,
        }
    }

    pub fn failed(&self) -> Option<&StepError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

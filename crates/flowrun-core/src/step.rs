use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::expr::{Condition, Expr};
use crate::value::ValueRef;

/// Identifier of a step within a flow version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[repr(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Reference to a registered step capability: a piece, an operation it
/// exposes, and a major version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct CapabilityRef {
    pub piece: String,
    pub operation: String,
    #[serde(default = "default_capability_version")]
    pub version: u32,
}

fn default_capability_version() -> u32 {
    1
}

impl CapabilityRef {
    pub fn new(piece: impl Into<String>, operation: impl Into<String>, version: u32) -> Self {
        Self {
            piece: piece.into(),
            operation: operation.into(),
            version,
        }
    }
}

impl std::fmt::Display for CapabilityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.piece, self.operation, self.version)
    }
}

/// How loop-body iterations are scheduled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// One iteration at a time, in source order.
    Sequential,
    /// Up to `max_concurrency` iterations in flight at once. Outputs are
    /// still collected in source order.
    Parallel { max_concurrency: usize },
}

impl Default for LoopMode {
    fn default() -> Self {
        Self::Sequential
    }
}

fn default_max_iterations() -> u32 {
    10_000
}

/// Structural role of a step and its successor rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepKind {
    /// The flow's entry point. Its "output" is the triggering payload.
    Trigger {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<StepId>,
    },
    Action {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<StepId>,
    },
    /// Evaluates `condition` and follows exactly one successor. The
    /// non-taken arm is never evaluated.
    Branch {
        condition: Condition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_true: Option<StepId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_false: Option<StepId>,
    },
    /// Evaluates `items` once, then executes the body sub-graph once per
    /// element. Per-iteration outputs are collected in source order and
    /// exposed as this step's output.
    Loop {
        items: Expr,
        body: StepId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<StepId>,
        #[serde(default)]
        mode: LoopMode,
        #[serde(default = "default_max_iterations")]
        max_iterations: u32,
    },
    /// Suspends the run until an external resume event arrives. The resume
    /// payload becomes this step's output.
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        next: Option<StepId>,
    },
}

impl StepKind {
    /// The default successor, where the kind has a single one.
    pub fn next(&self) -> Option<&StepId> {
        match self {
            Self::Trigger { next }
            | Self::Action { next }
            | Self::Loop { next, .. }
            | Self::Wait { next } => next.as_ref(),
            Self::Branch { .. } => None,
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger { .. })
    }
}

/// What the interpreter does when a step fails after its retries are
/// exhausted.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum OnError {
    /// Abort the run with status Failed.
    #[default]
    Fail,
    /// Record the error as the step's output and continue at
    /// `failure_next`, or at the default successor when unset.
    Continue {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_next: Option<StepId>,
    },
}

/// Exponential backoff with full jitter: the attempt delay is sampled
/// uniformly from `[0, min(cap, base * 2^attempt))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Backoff {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 100,
            cap_ms: 30_000,
        }
    }
}

impl Backoff {
    /// Upper bound of the delay window for a given zero-based attempt.
    pub fn window_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.min(32);
        self.base_ms
            .saturating_mul(1u64 << exp)
            .min(self.cap_ms)
    }
}

/// Per-step retry configuration, applied by re-invoking the executor
/// before the failure escalates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    /// Total invocation attempts, including the first one.
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::default(),
        }
    }
}

/// One node in the flow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    pub id: StepId,
    pub capability: CapabilityRef,
    /// Input template: literal JSON whose `$from` objects are resolved
    /// against ancestor step outputs before invocation.
    #[serde(default = "null_input")]
    pub input: ValueRef,
    #[serde(flatten)]
    pub kind: StepKind,
    /// Connection reference resolved by the external secret provider and
    /// injected into the sandbox for this one invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Wall-clock budget override for this step, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

fn null_input() -> ValueRef {
    ValueRef::null()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_from_yaml_defaults() {
        let step: Step = serde_yml::from_str(
            r#"
id: fetch
capability: { piece: http, operation: get }
type: action
next: parse
"#,
        )
        .unwrap();
        assert_eq!(step.id, "fetch".into());
        assert_eq!(step.capability.version, 1);
        assert_eq!(step.kind.next(), Some(&"parse".into()));
        assert_eq!(step.on_error, OnError::Fail);
        assert_eq!(step.retry.max_attempts, 1);
        assert!(step.timeout_ms.is_none());
    }

    #[test]
    fn test_branch_step_from_yaml() {
        let step: Step = serde_yml::from_str(
            r#"
id: decide
capability: { piece: core, operation: branch }
type: branch
condition:
  equals: [{ $from: a, path: out }, "x"]
on_true: c
on_false: d
"#,
        )
        .unwrap();
        match step.kind {
            StepKind::Branch {
                on_true, on_false, ..
            } => {
                assert_eq!(on_true, Some("c".into()));
                assert_eq!(on_false, Some("d".into()));
            }
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_window() {
        let backoff = Backoff {
            base_ms: 100,
            cap_ms: 1_000,
        };
        assert_eq!(backoff.window_ms(0), 100);
        assert_eq!(backoff.window_ms(1), 200);
        assert_eq!(backoff.window_ms(2), 400);
        assert_eq!(backoff.window_ms(10), 1_000);
    }
}

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::value::ValueRef;

/// The source a reference expression reads from.
#[derive(Debug, Clone, PartialEq, Hash, Eq, Serialize, Deserialize, JsonSchema)]
pub enum StepRef {
    /// The run's triggering payload.
    #[serde(rename = "$trigger")]
    Trigger,
    /// The current loop element (only valid inside a loop body).
    #[serde(rename = "$item")]
    Item,
    /// The current loop iteration index (only valid inside a loop body).
    #[serde(rename = "$index")]
    Index,
    #[serde(untagged)]
    /// The output of an earlier step on the current execution path.
    Step(String),
}

/// An expression that is either a literal value or a reference to a prior
/// step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Expr {
    Ref {
        /// The source of the reference.
        #[serde(rename = "$from")]
        from: StepRef,
        /// Path applied to the referenced value (property access and
        /// indexing, `/`-separated). Omitted to use the entire value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    Literal(ValueRef),
}

impl Expr {
    pub fn literal(literal: impl Into<ValueRef>) -> Self {
        Self::Literal(literal.into())
    }

    fn new_ref(from: StepRef, path: String) -> Self {
        let path = Some(path).filter(|s| !s.is_empty());
        Self::Ref { from, path }
    }

    pub fn step_path(step: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new_ref(StepRef::Step(step.into()), path.into())
    }

    pub fn trigger_path(path: impl Into<String>) -> Self {
        Self::new_ref(StepRef::Trigger, path.into())
    }

    pub fn item() -> Self {
        Self::Ref {
            from: StepRef::Item,
            path: None,
        }
    }

    pub fn base_ref(&self) -> Option<&StepRef> {
        match self {
            Self::Literal { .. } => None,
            Self::Ref { from, .. } => Some(from),
        }
    }
}

/// A branch condition, evaluated deterministically against the resolved
/// scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Condition {
    /// True when the two resolved operands are equal.
    Equals { equals: [Expr; 2] },
    /// True when the resolved value is truthy.
    Truthy(Expr),
}

/// Key marking a reference object inside an input template.
pub const REF_KEY: &str = "$from";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expr_to_yaml() {
        let to_yaml = |e: &Expr| serde_yml::to_string(e).unwrap();
        assert_eq!(to_yaml(&Expr::literal("foo")), "foo\n");
        assert_eq!(to_yaml(&Expr::literal(5)), "5\n");

        assert_eq!(
            to_yaml(&Expr::trigger_path("body")),
            "$from: $trigger\npath: body\n"
        );
        assert_eq!(to_yaml(&Expr::trigger_path("")), "$from: $trigger\n");

        assert_eq!(to_yaml(&Expr::step_path("step1", "")), "$from: step1\n");
        assert_eq!(
            to_yaml(&Expr::step_path("step1", "out")),
            "$from: step1\npath: out\n"
        );
    }

    #[test]
    fn test_expr_from_yaml() {
        let from_yaml = |s| serde_yml::from_str::<Expr>(s).unwrap();
        assert_eq!(from_yaml("foo"), Expr::literal("foo"));
        assert_eq!(from_yaml("5"), Expr::literal(5));

        assert_eq!(
            from_yaml("{ $from: \"step1\" }"),
            Expr::step_path("step1", "")
        );
        assert_eq!(
            from_yaml("{ $from: \"step1\", path: \"out\" }"),
            Expr::step_path("step1", "out")
        );
        assert_eq!(from_yaml("{ $from: \"$item\" }"), Expr::item());
    }

    #[test]
    fn test_condition_from_yaml() {
        let from_yaml = |s| serde_yml::from_str::<Condition>(s).unwrap();
        assert_eq!(
            from_yaml("{ $from: \"check\" }"),
            Condition::Truthy(Expr::step_path("check", ""))
        );
        assert_eq!(
            from_yaml("equals: [{ $from: \"a\", path: \"out\" }, \"x\"]"),
            Condition::Equals {
                equals: [Expr::step_path("a", "out"), Expr::literal("x")]
            }
        );
    }
}

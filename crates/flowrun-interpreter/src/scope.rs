use std::collections::HashMap;

use flowrun_core::{Condition, Expr, StepError, StepRef, ValueRef, REF_KEY};

/// One lexical frame of step outputs. Loop iterations push a frame
/// carrying `$item`/`$index`, so body outputs never leak to siblings.
#[derive(Debug, Clone, Default)]
struct Frame {
    outputs: HashMap<String, ValueRef>,
    item: Option<ValueRef>,
    index: Option<u32>,
}

/// Resolution scope for input templates and branch conditions.
///
/// Step references search frames innermost-first; `$item` and `$index`
/// resolve only against the innermost loop frame, matching the nearest
/// enclosing loop.
#[derive(Debug, Clone)]
pub struct Scope {
    trigger: ValueRef,
    frames: Vec<Frame>,
}

impl Scope {
    pub fn new(trigger: ValueRef) -> Self {
        Self {
            trigger,
            frames: vec![Frame::default()],
        }
    }

    /// Record a step's output in the innermost frame.
    pub fn insert(&mut self, step_id: impl Into<String>, output: ValueRef) {
        self.frames
            .last_mut()
            .expect("scope has a root frame")
            .outputs
            .insert(step_id.into(), output);
    }

    /// Enter a loop iteration.
    pub fn push_iteration(&mut self, item: ValueRef, index: u32) {
        self.frames.push(Frame {
            outputs: HashMap::new(),
            item: Some(item),
            index: Some(index),
        });
    }

    /// Leave a loop iteration, discarding its outputs.
    pub fn pop_iteration(&mut self) {
        if self.frames.len() > 1 {
            self.frames.pop();
        }
    }

    fn lookup(&self, from: &StepRef) -> Option<ValueRef> {
        match from {
            StepRef::Trigger => Some(self.trigger.clone()),
            StepRef::Item => self.frames.last().and_then(|f| f.item.clone()),
            StepRef::Index => self
                .frames
                .last()
                .and_then(|f| f.index)
                .map(|i| ValueRef::from(i)),
            StepRef::Step(name) => self
                .frames
                .iter()
                .rev()
                .find_map(|f| f.outputs.get(name).cloned()),
        }
    }

    /// Resolve a single expression. Unresolvable references are input
    /// errors, charged to the step being prepared.
    pub fn resolve_expr(&self, expr: &Expr) -> Result<ValueRef, StepError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ref { from, path } => {
                let base = self.lookup(from).ok_or_else(|| {
                    StepError::input_invalid(format!("unresolved reference: {from:?}"))
                })?;
                match path {
                    None => Ok(base),
                    Some(path) => base.path(path).ok_or_else(|| {
                        StepError::input_invalid(format!(
                            "path {path:?} does not resolve in referenced value"
                        ))
                    }),
                }
            }
        }
    }

    /// Resolve an input template: every object carrying a `$from` key is
    /// replaced by the referenced value; everything else passes through
    /// structurally.
    pub fn resolve_template(&self, template: &ValueRef) -> Result<ValueRef, StepError> {
        self.resolve_json(template.as_ref()).map(ValueRef::new)
    }

    fn resolve_json(&self, value: &serde_json::Value) -> Result<serde_json::Value, StepError> {
        match value {
            serde_json::Value::Object(map) if map.contains_key(REF_KEY) => {
                let expr: Expr = serde_json::from_value(serde_json::Value::Object(map.clone()))
                    .map_err(|err| {
                        StepError::input_invalid(format!("malformed reference object: {err}"))
                    })?;
                Ok(self.resolve_expr(&expr)?.as_ref().clone())
            }
            serde_json::Value::Object(map) => {
                let resolved = map
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.resolve_json(v)?)))
                    .collect::<Result<serde_json::Map<_, _>, StepError>>()?;
                Ok(serde_json::Value::Object(resolved))
            }
            serde_json::Value::Array(items) => {
                let resolved = items
                    .iter()
                    .map(|v| self.resolve_json(v))
                    .collect::<Result<Vec<_>, StepError>>()?;
                Ok(serde_json::Value::Array(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate a branch condition deterministically.
    pub fn resolve_condition(&self, condition: &Condition) -> Result<bool, StepError> {
        match condition {
            Condition::Truthy(expr) => Ok(self.resolve_expr(expr)?.is_truthy()),
            Condition::Equals { equals: [a, b] } => {
                let a = self.resolve_expr(a)?;
                let b = self.resolve_expr(b)?;
                Ok(a.as_ref() == b.as_ref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Scope {
        let mut scope = Scope::new(json!({"user": {"name": "ada"}}).into());
        scope.insert("fetch", json!({"status": 200, "items": [1, 2, 3]}).into());
        scope
    }

    #[test]
    fn test_template_passthrough_and_refs() {
        let resolved = scope()
            .resolve_template(
                &json!({
                    "greeting": "hello",
                    "who": {"$from": "$trigger", "path": "user/name"},
                    "status": {"$from": "fetch", "path": "status"},
                    "nested": [{"$from": "fetch", "path": "items/1"}, 9],
                })
                .into(),
            )
            .unwrap();
        assert_eq!(
            resolved.as_ref(),
            &json!({
                "greeting": "hello",
                "who": "ada",
                "status": 200,
                "nested": [2, 9],
            })
        );
    }

    #[test]
    fn test_unresolved_reference_is_input_invalid() {
        let err = scope()
            .resolve_template(&json!({"x": {"$from": "nope"}}).into())
            .unwrap_err();
        assert_eq!(err.kind, flowrun_core::StepErrorKind::InputInvalid);

        let err = scope()
            .resolve_template(&json!({"x": {"$from": "fetch", "path": "missing"}}).into())
            .unwrap_err();
        assert_eq!(err.kind, flowrun_core::StepErrorKind::InputInvalid);
    }

    #[test]
    fn test_iteration_frame_scoping() {
        let mut scope = scope();
        scope.push_iteration(json!("first").into(), 0);
        scope.insert("body_step", json!("inner").into());

        // $item and $index resolve in the frame; outer outputs stay visible.
        assert_eq!(
            scope.resolve_expr(&Expr::item()).unwrap().as_ref(),
            &json!("first")
        );
        let index = scope
            .resolve_template(&json!({"$from": "$index"}).into())
            .unwrap();
        assert_eq!(index.as_ref(), &json!(0));
        assert!(scope
            .resolve_expr(&Expr::step_path("fetch", "status"))
            .is_ok());

        scope.pop_iteration();
        // Body outputs and $item do not survive the iteration.
        assert!(scope.resolve_expr(&Expr::step_path("body_step", "")).is_err());
        assert!(scope.resolve_expr(&Expr::item()).is_err());
    }

    #[test]
    fn test_inner_frame_shadows_outer() {
        let mut scope = scope();
        scope.push_iteration(json!(1).into(), 0);
        scope.insert("fetch", json!("shadowed").into());
        assert_eq!(
            scope
                .resolve_expr(&Expr::step_path("fetch", ""))
                .unwrap()
                .as_ref(),
            &json!("shadowed")
        );
        scope.pop_iteration();
        assert_eq!(
            scope
                .resolve_expr(&Expr::step_path("fetch", "status"))
                .unwrap()
                .as_ref(),
            &json!(200)
        );
    }

    #[test]
    fn test_conditions() {
        let scope = scope();
        assert!(scope
            .resolve_condition(&Condition::Truthy(Expr::step_path("fetch", "status")))
            .unwrap());
        assert!(scope
            .resolve_condition(&Condition::Equals {
                equals: [Expr::step_path("fetch", "status"), Expr::literal(200)]
            })
            .unwrap());
        assert!(!scope
            .resolve_condition(&Condition::Equals {
                equals: [Expr::step_path("fetch", "status"), Expr::literal(404)]
            })
            .unwrap());
        assert!(scope
            .resolve_condition(&Condition::Truthy(Expr::step_path("gone", "")))
            .is_err());
    }
}

//! Structural validation of a flow version.
//!
//! Every failure here is surfaced at publish/enqueue time, before any run
//! is created. A run never observes a structural error mid-flight.

use std::collections::HashMap;

use crate::flow::FlowVersion;
use crate::step::{OnError, StepId, StepKind};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("flow has no trigger step")]
    NoTrigger,
    #[error("entry step {0} is not a trigger")]
    EntryNotTrigger(StepId),
    #[error("step {0} is a second trigger; a flow has exactly one entry trigger")]
    ExtraTrigger(StepId),
    #[error("step {from} references unknown successor {to}")]
    UnknownSuccessor { from: StepId, to: StepId },
    #[error("step {0} is not reachable from the entry trigger")]
    Unreachable(StepId),
    #[error("step {0} is reachable from more than one sub-graph")]
    SharedStep(StepId),
    #[error("cycle detected at step {0}; cycles are only allowed via explicit loop constructs")]
    Cycle(StepId),
    #[error("wait step {0} inside a loop body; pause points must be on the outer chain")]
    WaitInLoop(StepId),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Owner {
    Top,
    /// Index of the owning loop step in the version's step table.
    Loop(usize),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Validate the structure of a flow version.
///
/// Checks: exactly one trigger which is the entry; all successor references
/// resolve; every step reachable; no step shared between a loop body and
/// another sub-graph; no cycles outside explicit loops; no wait steps
/// inside loop bodies (resume tokens identify successors on the outer
/// chain).
pub fn validate_version(version: &FlowVersion) -> Result<(), ValidationError> {
    let entry = version
        .entry_step()
        .ok_or(ValidationError::NoTrigger)?;
    if !entry.kind.is_trigger() {
        return Err(ValidationError::EntryNotTrigger(entry.id.clone()));
    }
    for step in version.steps.values() {
        if step.kind.is_trigger() && step.id != version.entry {
            return Err(ValidationError::ExtraTrigger(step.id.clone()));
        }
    }

    let mut walker = Walker {
        version,
        owners: HashMap::new(),
        marks: HashMap::new(),
    };
    walker.walk(&version.entry, Owner::Top, false)?;

    for step_id in version.steps.keys() {
        if !walker.owners.contains_key(step_id) {
            return Err(ValidationError::Unreachable(step_id.clone()));
        }
    }
    Ok(())
}

struct Walker<'a> {
    version: &'a FlowVersion,
    owners: HashMap<StepId, Owner>,
    marks: HashMap<StepId, Mark>,
}

impl Walker<'_> {
    fn walk(&mut self, id: &StepId, owner: Owner, in_loop: bool) -> Result<(), ValidationError> {
        let step = match self.version.step(id) {
            Some(step) => step,
            // Reported with the proper `from` by the caller via check_edge.
            None => return Err(ValidationError::Unreachable(id.clone())),
        };

        match self.marks.get(id) {
            Some(Mark::InProgress) => return Err(ValidationError::Cycle(id.clone())),
            Some(Mark::Done) => {
                // Diamond merges within one owner are fine; crossing into
                // another sub-graph is not.
                if self.owners.get(id) != Some(&owner) {
                    return Err(ValidationError::SharedStep(id.clone()));
                }
                return Ok(());
            }
            None => {}
        }
        self.marks.insert(id.clone(), Mark::InProgress);
        self.owners.insert(id.clone(), owner);

        match &step.kind {
            StepKind::Trigger { next } | StepKind::Action { next } => {
                self.walk_edge(id, next.as_ref(), owner, in_loop)?;
            }
            StepKind::Wait { next } => {
                if in_loop {
                    return Err(ValidationError::WaitInLoop(id.clone()));
                }
                self.walk_edge(id, next.as_ref(), owner, in_loop)?;
            }
            StepKind::Branch {
                on_true, on_false, ..
            } => {
                self.walk_edge(id, on_true.as_ref(), owner, in_loop)?;
                self.walk_edge(id, on_false.as_ref(), owner, in_loop)?;
            }
            StepKind::Loop { body, next, .. } => {
                let loop_idx = self
                    .version
                    .steps
                    .get_index_of(id)
                    .expect("loop step present");
                self.walk_edge(id, Some(body), Owner::Loop(loop_idx), true)?;
                self.walk_edge(id, next.as_ref(), owner, in_loop)?;
            }
        }

        // Failure routing is an edge like any other: its target must exist
        // and is reachable through it.
        if let OnError::Continue { failure_next } = &step.on_error {
            self.walk_edge(id, failure_next.as_ref(), owner, in_loop)?;
        }

        self.marks.insert(id.clone(), Mark::Done);
        Ok(())
    }

    fn walk_edge(
        &mut self,
        from: &StepId,
        to: Option<&StepId>,
        owner: Owner,
        in_loop: bool,
    ) -> Result<(), ValidationError> {
        let Some(to) = to else { return Ok(()) };
        if self.version.step(to).is_none() {
            return Err(ValidationError::UnknownSuccessor {
                from: from.clone(),
                to: to.clone(),
            });
        }
        self.walk(to, owner, in_loop)
    }
}

//! Sandboxed execution of a single step.
//!
//! A step implementation runs on its own spawned task with a wall-clock
//! timeout and bounded output/log budgets. It can only touch what its
//! invocation hands it explicitly; the host process's state is never
//! shared, and a panicking handler surfaces as a `Crash` outcome instead
//! of taking the worker down.

mod executor;
mod limits;

pub use executor::{SandboxedExecutor, StepExecution};
pub use limits::Limits;

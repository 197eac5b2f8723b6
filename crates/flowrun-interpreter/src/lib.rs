//! The flow interpreter: walks a run's flow graph step by step, resolving
//! input templates against prior outputs, delegating execution to the
//! sandbox, and journalling every step durably before advancing.

mod error;
mod interpreter;
mod scope;

pub use error::{InterpreterError, Result};
pub use interpreter::FlowInterpreter;
pub use scope::Scope;

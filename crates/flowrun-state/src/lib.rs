//! Run state storage: flow versions, run records, resume tokens, and the
//! append-only step log.

mod error;
mod in_memory;
mod state_store;

pub use error::{Result, StateError};
pub use in_memory::InMemoryRunStore;
pub use state_store::{transition_allowed, RunFilters, RunStateStore};

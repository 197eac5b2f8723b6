mod connection;
mod error;
mod handler;
mod registry;

pub use connection::{ConnectionProvider, StaticConnections};
pub use error::{RegistryError, Result};
pub use handler::{LogSink, StepHandler, StepInvocation};
pub use registry::StepRegistry;

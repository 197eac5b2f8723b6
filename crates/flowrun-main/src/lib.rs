mod builtins;
mod cli;
mod engine;
mod error;
mod flowrun_config;
mod logging;
mod run;
mod serve;

pub use builtins::register_builtins;
pub use cli::{Cli, FlowDoc};
pub use engine::Engine;
pub use error::*;
pub use flowrun_config::{FlowrunConfig, load_config};
pub use logging::{LogLevel, init_tracing};
pub use run::{RunReport, run_flow};

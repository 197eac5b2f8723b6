use std::path::PathBuf;

#[derive(Debug, thiserror::Error, Clone)]
pub enum MainError {
    #[error("Missing file: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("Invalid file: {}", .0.display())]
    InvalidFile(PathBuf),
    #[error("Unrecognized file extension: {}", .0.display())]
    UnrecognizedFileExtension(PathBuf),
    #[error("Failed to create output file: {}", .0.display())]
    CreateOutput(PathBuf),
    #[error("Failed to write output")]
    WriteOutput,
    #[error("Flow failed validation")]
    InvalidFlow,
    #[error("Failed to register builtin steps")]
    RegisterBuiltins,
    #[error("Failed to execute flow")]
    FlowExecution,
    #[error("Failed to initialize tracing")]
    TracingInit,
}

pub type Result<T, E = error_stack::Report<MainError>> = std::result::Result<T, E>;

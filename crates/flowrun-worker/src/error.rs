#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Protocol version mismatch: ours {ours}, theirs {theirs}")]
    ProtocolMismatch { ours: u32, theirs: u32 },

    #[error("Queue operation failed")]
    Queue,

    #[error("Interpreter failed")]
    Interpreter,
}

pub type Result<T, E = error_stack::Report<WorkerError>> = std::result::Result<T, E>;

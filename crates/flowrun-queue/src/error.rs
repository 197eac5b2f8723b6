use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    UnknownJob(Uuid),

    #[error("Claim token is stale for job {0}")]
    StaleClaim(Uuid),

    #[error("Flow failed structural validation")]
    InvalidFlow,

    #[error("Run state operation failed")]
    State,

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),
}

pub type Result<T, E = error_stack::Report<QueueError>> = std::result::Result<T, E>;

//! The worker half of the engine: claims jobs over a versioned protocol
//! seam and drives the interpreter with bounded parallelism.

mod error;
mod protocol;
mod worker;

pub use error::{Result, WorkerError};
pub use protocol::{
    check_protocol, CompletionReport, JobClaimRequest, JobClaimResponse, JobDelivery, LocalBroker,
    ProgressReport, WorkerId, PROTOCOL_VERSION,
};
pub use worker::{Worker, WorkerConfig, WorkerEvent};

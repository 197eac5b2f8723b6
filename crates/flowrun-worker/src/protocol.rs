use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use error_stack::report;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowrun_core::RunStatus;
use flowrun_queue::{ClaimToken, Dispatcher, Job};

use crate::{Result, WorkerError};

/// Wire protocol version. Both sides of the worker/dispatcher seam send
/// it in every message; a mismatch is rejected before anything else.
pub const PROTOCOL_VERSION: u32 = 1;

pub fn check_protocol(theirs: u32) -> Result<()> {
    if theirs != PROTOCOL_VERSION {
        return Err(report!(WorkerError::ProtocolMismatch {
            ours: PROTOCOL_VERSION,
            theirs,
        }));
    }
    Ok(())
}

/// Stable identifier of a worker process, persisted across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random id, for tests and throwaway workers.
    pub fn random() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker asks for up to one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobClaimRequest {
    pub protocol: u32,
    pub worker_id: WorkerId,
    /// Remaining parallel capacity of the requesting worker.
    pub capacity: u32,
}

impl JobClaimRequest {
    pub fn new(worker_id: WorkerId, capacity: u32) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            worker_id,
            capacity,
        }
    }
}

/// A delivered job with its claim token and lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDelivery {
    pub job: Job,
    pub token: ClaimToken,
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobClaimResponse {
    pub protocol: u32,
    /// `None` when nothing was eligible.
    pub delivery: Option<JobDelivery>,
}

/// Worker announces it is still working on a claimed job. The liveness
/// heartbeat for the delivery: the dispatcher renews the lease and answers
/// with the new deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub protocol: u32,
    pub worker_id: WorkerId,
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub token: ClaimToken,
    pub at: DateTime<Utc>,
}

/// Worker reports a job as finished. The run's status was already
/// recorded durably by the interpreter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub protocol: u32,
    pub worker_id: WorkerId,
    pub job_id: Uuid,
    pub token: ClaimToken,
    pub run_status: RunStatus,
}

/// In-process transport: the dispatcher answers protocol messages
/// directly. A networked deployment would put a wire codec behind the
/// same message types.
pub struct LocalBroker {
    dispatcher: Arc<Dispatcher>,
}

impl LocalBroker {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn claim(&self, request: JobClaimRequest) -> Result<JobClaimResponse> {
        check_protocol(request.protocol)?;
        let delivery = if request.capacity == 0 {
            None
        } else {
            self.dispatcher.claim().map(|claimed| JobDelivery {
                job: claimed.job,
                token: claimed.token,
                lease_expires_at: claimed.lease_expires_at,
            })
        };
        Ok(JobClaimResponse {
            protocol: PROTOCOL_VERSION,
            delivery,
        })
    }

    pub fn progress(&self, report: ProgressReport) -> Result<DateTime<Utc>> {
        check_protocol(report.protocol)?;
        self.dispatcher
            .extend_lease(report.job_id, report.token)
            .map_err(|err| err.change_context(WorkerError::Queue))
    }

    pub fn complete(&self, report: CompletionReport) -> Result<()> {
        check_protocol(report.protocol)?;
        self.dispatcher
            .complete(report.job_id, report.token)
            .map_err(|err| err.change_context(WorkerError::Queue))?;
        Ok(())
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowrun_core::{ResumeToken, ValueRef};

/// Key under which a job counts against a concurrency ceiling.
///
/// By default every run of the same flow shares one key, so a ceiling of N
/// bounds how many runs of that flow execute at once across all workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyKey(String);

impl ConcurrencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The default key for runs of a flow.
    pub fn flow(flow_id: Uuid) -> Self {
        Self(format!("flow/{flow_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConcurrencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConcurrencyKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ConcurrencyKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// What a delivered job asks the worker to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum JobKind {
    /// Execute a queued run from its entry step.
    Start,
    /// Continue a paused run from its stored resume position.
    Resume {
        token: ResumeToken,
        payload: ValueRef,
    },
}

/// One unit of work on the queue: execute (part of) a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub run_id: Uuid,
    pub key: ConcurrencyKey,
    #[serde(flatten)]
    pub kind: JobKind,
    pub enqueued_at: DateTime<Utc>,
    /// Times this job has been delivered to a worker, including the
    /// in-flight delivery.
    pub deliveries: u32,
}

impl Job {
    pub fn start(run_id: Uuid, key: ConcurrencyKey) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            run_id,
            key,
            kind: JobKind::Start,
            enqueued_at: Utc::now(),
            deliveries: 0,
        }
    }

    pub fn resume(run_id: Uuid, key: ConcurrencyKey, token: ResumeToken, payload: ValueRef) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            run_id,
            key,
            kind: JobKind::Resume { token, payload },
            enqueued_at: Utc::now(),
            deliveries: 0,
        }
    }
}

/// Proof of an in-flight claim. A completion that presents a token from a
/// superseded delivery is rejected as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    pub(crate) fn mint() -> Self {
        Self(Uuid::now_v7())
    }
}

/// A job delivered to a worker, with its lease.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: ClaimToken,
    /// When the lease expires; an unfinished job becomes redeliverable
    /// after this instant.
    pub lease_expires_at: DateTime<Utc>,
}

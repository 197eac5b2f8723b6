use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use error_stack::report;
use uuid::Uuid;

use crate::job::{ClaimToken, ClaimedJob, ConcurrencyKey, Job};
use crate::{QueueError, Result};

/// Tuning for the job queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deliveries (first attempt included) before a job is dead-lettered.
    pub max_deliveries: u32,
    /// How long a claim remains valid without completion.
    pub lease_ttl: Duration,
    /// Ceiling applied to keys without an explicit entry.
    pub default_ceiling: usize,
    /// Per-key ceilings overriding the default.
    pub ceilings: HashMap<ConcurrencyKey, usize>,
    /// How often the dispatcher sweeps for expired leases.
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_deliveries: 5,
            lease_ttl: Duration::from_secs(30),
            default_ceiling: 4,
            ceilings: HashMap::new(),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl QueueConfig {
    pub fn ceiling(&self, key: &ConcurrencyKey) -> usize {
        self.ceilings.get(key).copied().unwrap_or(self.default_ceiling)
    }
}

struct ClaimedEntry {
    job: Job,
    token: ClaimToken,
    lease_expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueInner {
    /// Global FIFO; per-key order is preserved because claims always take
    /// the frontmost eligible job.
    pending: VecDeque<Job>,
    claimed: HashMap<Uuid, ClaimedEntry>,
    /// In-flight claims per key, counted against the ceiling.
    in_flight: HashMap<ConcurrencyKey, usize>,
    dead: Vec<Job>,
}

impl QueueInner {
    fn decrement(&mut self, key: &ConcurrencyKey) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }
}

/// Jobs swept out of expired leases: requeued ones go back to the front of
/// the queue, dead ones exceeded their delivery budget.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub requeued: Vec<Job>,
    pub dead: Vec<Job>,
}

/// In-memory job queue with at-least-once delivery.
///
/// Claims carry a lease; a worker that never completes lets the lease
/// expire, after which the job is redelivered until `max_deliveries` is
/// exhausted and it is dead-lettered instead.
pub struct JobQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn enqueue(&self, job: Job) {
        let mut inner = self.inner.lock().expect("queue lock");
        tracing::debug!(job_id = %job.job_id, run_id = %job.run_id, key = %job.key, "enqueued job");
        inner.pending.push_back(job);
    }

    /// Claim the frontmost job whose key is below its concurrency ceiling.
    ///
    /// Returns `None` when nothing is eligible, either because the queue is
    /// empty or every pending key is at its ceiling.
    pub fn claim(&self) -> Option<ClaimedJob> {
        let mut inner = self.inner.lock().expect("queue lock");
        let position = inner.pending.iter().position(|job| {
            let in_flight = inner.in_flight.get(&job.key).copied().unwrap_or(0);
            in_flight < self.config.ceiling(&job.key)
        })?;
        let mut job = inner.pending.remove(position)?;
        job.deliveries += 1;
        *inner.in_flight.entry(job.key.clone()).or_insert(0) += 1;

        let token = ClaimToken::mint();
        let lease_expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.lease_ttl)
                .unwrap_or(chrono::TimeDelta::MAX);
        inner.claimed.insert(
            job.job_id,
            ClaimedEntry {
                job: job.clone(),
                token,
                lease_expires_at,
            },
        );
        tracing::debug!(
            job_id = %job.job_id,
            deliveries = job.deliveries,
            "claimed job"
        );
        Some(ClaimedJob {
            job,
            token,
            lease_expires_at,
        })
    }

    /// Acknowledge a claimed job as finished, whatever the run's outcome.
    pub fn complete(&self, job_id: Uuid, token: ClaimToken) -> Result<Job> {
        let mut inner = self.inner.lock().expect("queue lock");
        let entry = inner
            .claimed
            .get(&job_id)
            .ok_or_else(|| report!(QueueError::UnknownJob(job_id)))?;
        if entry.token != token {
            return Err(report!(QueueError::StaleClaim(job_id)));
        }
        let entry = inner.claimed.remove(&job_id).expect("claimed entry");
        inner.decrement(&entry.job.key);
        Ok(entry.job)
    }

    /// Renew a claim's lease for another full TTL. The heartbeat path for
    /// runs that legitimately outlive a single lease.
    pub fn extend_lease(&self, job_id: Uuid, token: ClaimToken) -> Result<DateTime<Utc>> {
        let mut inner = self.inner.lock().expect("queue lock");
        let entry = inner
            .claimed
            .get_mut(&job_id)
            .ok_or_else(|| report!(QueueError::UnknownJob(job_id)))?;
        if entry.token != token {
            return Err(report!(QueueError::StaleClaim(job_id)));
        }
        entry.lease_expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.lease_ttl)
                .unwrap_or(chrono::TimeDelta::MAX);
        Ok(entry.lease_expires_at)
    }

    /// Hand a claimed job back without completing it, e.g. on worker
    /// shutdown. The delivery still counts against the budget.
    pub fn release(&self, job_id: Uuid, token: ClaimToken) -> Result<()> {
        let mut inner = self.inner.lock().expect("queue lock");
        let entry = inner
            .claimed
            .get(&job_id)
            .ok_or_else(|| report!(QueueError::UnknownJob(job_id)))?;
        if entry.token != token {
            return Err(report!(QueueError::StaleClaim(job_id)));
        }
        let entry = inner.claimed.remove(&job_id).expect("claimed entry");
        inner.decrement(&entry.job.key);
        inner.pending.push_front(entry.job);
        Ok(())
    }

    /// Drop all pending jobs for a run. Returns how many were removed.
    pub fn remove_pending(&self, run_id: Uuid) -> usize {
        let mut inner = self.inner.lock().expect("queue lock");
        let before = inner.pending.len();
        inner.pending.retain(|job| job.run_id != run_id);
        before - inner.pending.len()
    }

    /// Requeue jobs with expired leases; jobs out of delivery budget are
    /// dead-lettered instead.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut inner = self.inner.lock().expect("queue lock");
        let expired: Vec<Uuid> = inner
            .claimed
            .iter()
            .filter(|(_, entry)| entry.lease_expires_at <= now)
            .map(|(job_id, _)| *job_id)
            .collect();

        let mut outcome = SweepOutcome::default();
        for job_id in expired {
            let entry = inner.claimed.remove(&job_id).expect("claimed entry");
            inner.decrement(&entry.job.key);
            if entry.job.deliveries >= self.config.max_deliveries {
                tracing::warn!(
                    job_id = %job_id,
                    run_id = %entry.job.run_id,
                    deliveries = entry.job.deliveries,
                    "job exceeded delivery budget, dead-lettering"
                );
                inner.dead.push(entry.job.clone());
                outcome.dead.push(entry.job);
            } else {
                tracing::debug!(job_id = %job_id, "lease expired, requeueing job");
                inner.pending.push_front(entry.job.clone());
                outcome.requeued.push(entry.job);
            }
        }
        outcome
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().expect("queue lock").pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().expect("queue lock").claimed.len()
    }

    pub fn dead_jobs(&self) -> Vec<Job> {
        self.inner.lock().expect("queue lock").dead.clone()
    }
}

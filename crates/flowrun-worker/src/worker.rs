use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng as _;
use tokio::sync::{broadcast, watch, Semaphore};
use uuid::Uuid;

use flowrun_core::RunStatus;
use flowrun_interpreter::FlowInterpreter;
use flowrun_queue::JobKind;

use crate::protocol::{
    CompletionReport, JobClaimRequest, JobDelivery, LocalBroker, ProgressReport, WorkerId,
    PROTOCOL_VERSION,
};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: WorkerId,
    /// How many runs this worker drives concurrently.
    pub max_parallel_runs: usize,
    /// Base poll interval when the queue is empty; the actual wait adds
    /// up to 50% jitter so a fleet of workers does not poll in lockstep.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: WorkerId::random(),
            max_parallel_runs: 4,
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Observable worker lifecycle events, mainly for tests and operators.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Claimed {
        job_id: Uuid,
        run_id: Uuid,
    },
    Finished {
        job_id: Uuid,
        run_id: Uuid,
        status: RunStatus,
    },
}

/// Claims jobs from the dispatcher and drives the interpreter, up to a
/// bounded number of runs in parallel.
///
/// A job is acknowledged only after the interpreter has durably recorded
/// the run's resulting status; a worker that dies mid-run simply lets the
/// lease expire and the job is redelivered elsewhere.
pub struct Worker {
    broker: LocalBroker,
    interpreter: Arc<FlowInterpreter>,
    config: WorkerConfig,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(broker: LocalBroker, interpreter: Arc<FlowInterpreter>, config: WorkerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            broker,
            interpreter,
            config,
            events,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn id(&self) -> &WorkerId {
        &self.config.id
    }

    /// The claim loop. Runs until `shutdown` flips, then drains in-flight
    /// runs before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_runs));
        tracing::info!(worker = %self.config.id, "worker started");

        while !*shutdown.borrow() {
            loop {
                let capacity = semaphore.available_permits() as u32;
                if capacity == 0 {
                    break;
                }
                let request = JobClaimRequest::new(self.config.id.clone(), capacity);
                let response = match self.broker.claim(request) {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::error!(worker = %self.config.id, ?err, "claim failed");
                        break;
                    }
                };
                let Some(delivery) = response.delivery else {
                    break;
                };
                let permit = semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed");
                let worker = self.clone();
                tokio::spawn(async move {
                    worker.execute(delivery).await;
                    drop(permit);
                });
            }

            let jitter_ms = (self.config.poll_interval.as_millis() as u64 / 2).max(1);
            let wait =
                self.config.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Drain: wait until every in-flight run has finished.
        let _all = semaphore
            .acquire_many(self.config.max_parallel_runs as u32)
            .await
            .expect("semaphore never closed");
        tracing::info!(worker = %self.config.id, "worker drained and stopped");
    }

    async fn execute(&self, delivery: JobDelivery) {
        let job = delivery.job;
        let _ = self.events.send(WorkerEvent::Claimed {
            job_id: job.job_id,
            run_id: job.run_id,
        });
        tracing::debug!(worker = %self.config.id, run_id = %job.run_id, deliveries = job.deliveries, "executing job");

        let stop = self.broker.dispatcher().stop_signal(job.run_id);
        let work = async {
            match job.kind.clone() {
                JobKind::Start => self.interpreter.run(job.run_id, stop).await,
                JobKind::Resume { token, payload } => {
                    self.interpreter.resume(job.run_id, token, payload, stop).await
                }
            }
        };

        // Heartbeat well inside the lease TTL, so a run that outlives a
        // single lease is never redelivered while this worker is on it.
        let lease_ttl = (delivery.lease_expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(30));
        let heartbeat_every = (lease_ttl / 3).max(Duration::from_millis(20));
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + heartbeat_every,
            heartbeat_every,
        );

        let mut work = std::pin::pin!(work);
        let result = loop {
            tokio::select! {
                result = &mut work => break result,
                _ = heartbeat.tick() => {
                    let report = ProgressReport {
                        protocol: PROTOCOL_VERSION,
                        worker_id: self.config.id.clone(),
                        job_id: job.job_id,
                        run_id: job.run_id,
                        token: delivery.token,
                        at: Utc::now(),
                    };
                    if let Err(err) = self.broker.progress(report) {
                        tracing::warn!(run_id = %job.run_id, ?err, "lease renewal rejected");
                    }
                }
            }
        };

        match result {
            Ok(run) => {
                let report = CompletionReport {
                    protocol: PROTOCOL_VERSION,
                    worker_id: self.config.id.clone(),
                    job_id: job.job_id,
                    token: delivery.token,
                    run_status: run.status,
                };
                if let Err(err) = self.broker.complete(report) {
                    tracing::error!(run_id = %job.run_id, ?err, "completion rejected");
                }
                let _ = self.events.send(WorkerEvent::Finished {
                    job_id: job.job_id,
                    run_id: job.run_id,
                    status: run.status,
                });
            }
            Err(err) => {
                // Unacknowledged; the lease will expire and the job is
                // redelivered, up to the delivery budget.
                tracing::error!(run_id = %job.run_id, ?err, "job execution failed, leaving claim unacknowledged");
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use error_stack::ResultExt as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use flowrun_core::{validate_version, FlowRun, FlowVersion, RunError, RunStatus, ValueRef};
use flowrun_state::RunStateStore;

use crate::job::{ClaimToken, ClaimedJob, ConcurrencyKey, Job};
use crate::queue::{JobQueue, QueueConfig};
use crate::{QueueError, Result};

/// Stop signals for in-flight runs, one watch channel per run.
#[derive(Default)]
pub struct StopRegistry {
    inner: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl StopRegistry {
    /// Subscribe to the stop signal for a run, creating the channel on
    /// first use.
    pub fn subscribe(&self, run_id: Uuid) -> watch::Receiver<bool> {
        let mut inner = self.inner.lock().expect("stop registry lock");
        inner
            .entry(run_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    /// Signal that a run should stop at the next step boundary.
    pub fn signal(&self, run_id: Uuid) {
        let inner = self.inner.lock().expect("stop registry lock");
        if let Some(tx) = inner.get(&run_id) {
            let _ = tx.send(true);
        }
    }

    pub fn remove(&self, run_id: Uuid) {
        let mut inner = self.inner.lock().expect("stop registry lock");
        inner.remove(&run_id);
    }
}

/// Front door for run lifecycle operations and the worker-facing queue.
///
/// Owns a sweeper task that periodically requeues expired leases and fails
/// the runs of dead-lettered jobs.
pub struct Dispatcher {
    store: Arc<dyn RunStateStore>,
    queue: Arc<JobQueue>,
    stops: Arc<StopRegistry>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn RunStateStore>, config: QueueConfig) -> Arc<Self> {
        let sweep_interval = config.sweep_interval;
        let queue = Arc::new(JobQueue::new(config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = Arc::new(Self {
            store,
            queue,
            stops: Arc::new(StopRegistry::default()),
            shutdown_tx,
            sweeper: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::sweeper_loop(
            dispatcher.clone(),
            sweep_interval,
            shutdown_rx,
        ));
        *dispatcher.sweeper.lock().expect("sweeper lock") = Some(handle);
        dispatcher
    }

    async fn sweeper_loop(
        dispatcher: Arc<Self>,
        interval: std::time::Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    dispatcher.sweep_now().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::debug!("dispatcher sweeper shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Run one sweep of expired leases. Dead-lettered jobs fail their run.
    pub async fn sweep_now(&self) {
        let outcome = self.queue.sweep_expired(chrono::Utc::now());
        for job in outcome.dead {
            let error = RunError::dead_lettered(job.deliveries);
            match self
                .store
                .transition_status(job.run_id, RunStatus::Failed, Some(error))
                .await
            {
                Ok(_) => {
                    tracing::warn!(run_id = %job.run_id, "run failed: job dead-lettered");
                    self.stops.remove(job.run_id);
                }
                Err(err) => {
                    tracing::error!(run_id = %job.run_id, ?err, "failed to fail dead-lettered run");
                }
            }
        }
    }

    /// Validate a flow version, create a `Queued` run for it, and enqueue
    /// its start job.
    pub async fn enqueue_run(
        &self,
        version: &FlowVersion,
        trigger_payload: ValueRef,
    ) -> Result<FlowRun> {
        validate_version(version).change_context(QueueError::InvalidFlow)?;

        let run = FlowRun::new(version.flow_id, version.version, trigger_payload);
        self.store
            .create_run(run.clone())
            .await
            .change_context(QueueError::State)?;
        self.queue
            .enqueue(Job::start(run.run_id, ConcurrencyKey::flow(run.flow_id)));
        tracing::info!(run_id = %run.run_id, flow_id = %run.flow_id, "run enqueued");
        Ok(run)
    }

    /// Deliver an external resume event. Consumes the run's resume token
    /// and enqueues a resume job carrying the event payload.
    pub async fn resume_run(&self, run_id: Uuid, token: Uuid, payload: ValueRef) -> Result<()> {
        let (run, resume) = self
            .store
            .take_resume(run_id, token)
            .await
            .change_context(QueueError::State)?;
        self.queue.enqueue(Job::resume(
            run.run_id,
            ConcurrencyKey::flow(run.flow_id),
            resume,
            payload,
        ));
        tracing::info!(run_id = %run_id, "run resumed");
        Ok(())
    }

    /// Request a stop. A queued run is stopped immediately and its pending
    /// job removed; a running run is signalled and stops at the next step
    /// boundary.
    pub async fn stop_run(&self, run_id: Uuid) -> Result<FlowRun> {
        let run = self
            .store
            .get_run(run_id)
            .await
            .change_context(QueueError::RunNotFound(run_id))?;
        match run.status {
            RunStatus::Queued | RunStatus::Paused => {
                self.queue.remove_pending(run_id);
                let stopped = self
                    .store
                    .transition_status(run_id, RunStatus::Stopped, None)
                    .await
                    .change_context(QueueError::State)?;
                self.stops.remove(run_id);
                tracing::info!(run_id = %run_id, "run stopped before execution");
                Ok(stopped)
            }
            RunStatus::Running => {
                self.stops.signal(run_id);
                tracing::info!(run_id = %run_id, "stop requested for running run");
                Ok(run)
            }
            // Stopping a terminal run is a no-op.
            _ => Ok(run),
        }
    }

    pub async fn run_status(&self, run_id: Uuid) -> Result<FlowRun> {
        self.store
            .get_run(run_id)
            .await
            .change_context(QueueError::RunNotFound(run_id))
    }

    /// Claim the next eligible job for a worker.
    pub fn claim(&self) -> Option<ClaimedJob> {
        self.queue.claim()
    }

    /// Acknowledge a job as finished. The run's terminal status was
    /// already recorded by the worker; this only settles the queue side.
    pub fn complete(&self, job_id: Uuid, token: ClaimToken) -> Result<Job> {
        let job = self.queue.complete(job_id, token)?;
        self.stops.remove(job.run_id);
        Ok(job)
    }

    /// Hand a claimed job back without finishing it.
    pub fn release(&self, job_id: Uuid, token: ClaimToken) -> Result<()> {
        self.queue.release(job_id, token)
    }

    /// Renew the lease on a claimed job. Workers call this periodically
    /// while a run outlives the base lease TTL.
    pub fn extend_lease(
        &self,
        job_id: Uuid,
        token: ClaimToken,
    ) -> Result<chrono::DateTime<chrono::Utc>> {
        self.queue.extend_lease(job_id, token)
    }

    /// Subscribe to the stop signal for a run.
    pub fn stop_signal(&self, run_id: Uuid) -> watch::Receiver<bool> {
        self.stops.subscribe(run_id)
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    /// Stop the sweeper task and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.sweeper.lock().expect("sweeper lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

//! Worker pool that claims jobs from the store and drives them.

use std::sync::Arc;
use std::time::Duration;

use neurochron_config::DispatcherConfig;
use neurochron_core::{CancelHandle, CancelSignal, Error as CoreError, Job, cancel_pair};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{SchedulerError, SchedulerResult};
use crate::heartbeat::LeaseHeartbeat;
use crate::orchestrator::{DriveOutcome, Orchestrator};

/// Backoff multiplier on the poll interval after a failed claim.
const CLAIM_ERROR_BACKOFF: u32 = 5;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrency bound: at most this many jobs are driven at once.
    pub workers: usize,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    /// Prefix for lease owner names; unique per process.
    pub instance_id: String,
}

impl WorkerConfig {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        let instance_id = config.instance_id.clone().unwrap_or_else(|| {
            let id = uuid::Uuid::new_v4().simple().to_string();
            format!("neurochron-{}", &id[..8])
        });
        Self {
            workers: config.workers,
            lease_ttl: config.lease_ttl,
            poll_interval: config.poll_interval,
            instance_id,
        }
    }
}

/// A fixed set of workers sharing one dispatcher and orchestrator.
pub struct WorkerPool {
    dispatcher: Arc<Dispatcher>,
    shutdown: CancelHandle,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        config: WorkerConfig,
        dispatcher: Arc<Dispatcher>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        let (shutdown, signal) = cancel_pair();
        let handles = (0..config.workers)
            .map(|n| {
                let worker = Worker {
                    id: format!("{}-w{n}", config.instance_id),
                    dispatcher: dispatcher.clone(),
                    orchestrator: orchestrator.clone(),
                    lease_ttl: config.lease_ttl,
                    poll_interval: config.poll_interval,
                    shutdown: signal.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        info!(workers = config.workers, instance = %config.instance_id, "Worker pool started");
        Self {
            dispatcher,
            shutdown,
            handles,
        }
    }

    /// Stop claiming, interrupt running jobs and wait for every worker to
    /// release its lease.
    pub async fn shutdown(self) -> SchedulerResult<()> {
        info!("Shutting down worker pool");
        self.shutdown.cancel();
        self.dispatcher.interrupt_all().await;
        for handle in self.handles {
            handle.await?;
        }
        info!("Worker pool stopped");
        Ok(())
    }
}

struct Worker {
    id: String,
    dispatcher: Arc<Dispatcher>,
    orchestrator: Arc<Orchestrator>,
    lease_ttl: Duration,
    poll_interval: Duration,
    shutdown: CancelSignal,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, "Starting worker");

        while !self.shutdown.is_cancelled() {
            let claimed = self
                .dispatcher
                .store()
                .claim_next(&self.id, self.lease_ttl)
                .await;
            match claimed {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => self.idle(self.poll_interval).await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    self.idle(self.poll_interval * CLAIM_ERROR_BACKOFF).await;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn idle(&mut self, period: Duration) {
        tokio::select! {
            _ = self.dispatcher.submitted() => {}
            _ = sleep(period) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        info!(worker_id = %self.id, job_id = %job_id, status = %job.status, "Claimed job");

        let (handle, signal) = cancel_pair();
        self.dispatcher.track(job_id, handle.clone()).await;
        if self.shutdown.is_cancelled() {
            handle.cancel();
        }
        let heartbeat = LeaseHeartbeat::spawn(
            self.dispatcher.store().clone(),
            job_id,
            self.id.clone(),
            self.lease_ttl,
            handle,
        );

        let result = self.orchestrator.drive(job, &self.id, signal).await;
        drop(heartbeat);
        self.dispatcher.untrack(job_id).await;

        match result {
            Ok(DriveOutcome::Finished(job)) => {
                info!(worker_id = %self.id, job_id = %job_id, status = %job.status, "Job finished");
            }
            Ok(DriveOutcome::Interrupted(job)) => {
                info!(
                    worker_id = %self.id,
                    job_id = %job_id,
                    status = %job.status,
                    "Job left resumable"
                );
                self.release(job_id).await;
            }
            Err(SchedulerError::Store(CoreError::Immutable(_))) => {
                info!(worker_id = %self.id, job_id = %job_id, "Job was finished elsewhere");
            }
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job_id, error = %e, "Halting job");
                self.release(job_id).await;
            }
        }
    }

    async fn release(&self, job_id: neurochron_core::JobId) {
        if let Err(e) = self.dispatcher.store().release_lease(job_id, &self.id).await {
            warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to release lease");
        }
    }
}

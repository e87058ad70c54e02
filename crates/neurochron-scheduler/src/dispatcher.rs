//! Submission intake, status queries and cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use neurochron_core::{
    CancelHandle, Error as CoreError, FailureCause, Job, JobError, JobFilter, JobId, JobStatus,
    JobStore, JobUpdate, NewJob, Precondition,
};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::error::SchedulerResult;

/// Attempts at a cancel that races with stage transitions.
const CANCEL_ATTEMPTS: usize = 3;

/// Front door to the job store for clients and workers.
///
/// Submission never waits for a worker: it persists a QUEUED record and
/// wakes an idle worker if there is one.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    wake: Notify,
    active: Mutex<HashMap<JobId, CancelHandle>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            wake: Notify::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate and persist a new job. Invalid input is rejected before any
    /// record is written.
    pub async fn submit(&self, input: NewJob) -> SchedulerResult<JobId> {
        let job = Job::new(input)?;
        let id = self.store.create(job).await?;
        info!(job_id = %id, "Job submitted");
        self.wake.notify_one();
        Ok(id)
    }

    pub async fn get(&self, id: JobId) -> SchedulerResult<Job> {
        Ok(self.store.get(id).await?)
    }

    pub fn list(&self, filter: JobFilter) -> BoxStream<'_, neurochron_core::Result<Job>> {
        self.store.list(filter)
    }

    /// Cancel a job. A QUEUED job fails immediately; an active one is
    /// flagged and stops at its next stage boundary, or sooner if its
    /// current stage observes the signal.
    pub async fn cancel(&self, id: JobId) -> SchedulerResult<Job> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.store.get(id).await?;
            if job.status.is_terminal() {
                let reason = format!("job {id} is already {}", job.status);
                return Err(CoreError::Immutable(reason).into());
            }

            let (precondition, update) = if job.status == JobStatus::Queued {
                let error = JobError {
                    stage: None,
                    cause: FailureCause::Cancelled,
                    message: "cancelled before dispatch".to_string(),
                    retry_count: 0,
                };
                (
                    Precondition::status(JobStatus::Queued),
                    JobUpdate::new().status(JobStatus::Failed).error(error),
                )
            } else {
                (
                    Precondition::status(job.status),
                    JobUpdate::new().cancel_requested(true),
                )
            };

            match self.store.update(id, &precondition, update).await {
                Ok(job) => {
                    if let Some(handle) = self.active.lock().await.get(&id) {
                        handle.cancel();
                    }
                    info!(job_id = %id, status = %job.status, "Cancellation recorded");
                    return Ok(job);
                }
                Err(CoreError::Conflict(reason)) => {
                    debug!(job_id = %id, %reason, "Job moved while cancelling, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoreError::Conflict(format!("job {id} kept changing while cancelling")).into())
    }

    /// Wait until a submission arrives.
    pub(crate) async fn submitted(&self) {
        self.wake.notified().await;
    }

    pub(crate) async fn track(&self, id: JobId, handle: CancelHandle) {
        self.active.lock().await.insert(id, handle);
    }

    pub(crate) async fn untrack(&self, id: JobId) {
        self.active.lock().await.remove(&id);
    }

    /// Signal every job running in this process to stop.
    pub(crate) async fn interrupt_all(&self) {
        for handle in self.active.lock().await.values() {
            handle.cancel();
        }
    }
}

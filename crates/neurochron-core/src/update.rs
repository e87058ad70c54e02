//! Partial updates to a job record.
//!
//! Every store applies updates through [`Job::apply`], so the lifecycle
//! invariants hold regardless of backend:
//! - status moves one step along the success path, or to FAILED;
//! - terminal jobs are never written again;
//! - a stage may only record its own artifact, never a prior stage's;
//! - `result` only accompanies COMPLETED and `error` only FAILED.

use chrono::{DateTime, Utc};

use crate::job::{
    Job, JobError, JobStatus, NotificationStatus, Prediction, PredictionResult, Stage,
    StageFailureRecord,
};
use crate::{Error, Result};

/// Optimistic-concurrency guard for [`Job::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precondition {
    pub status: JobStatus,
    /// When set, the write only succeeds while this owner holds a live lease.
    pub lease_owner: Option<String>,
}

impl Precondition {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            lease_owner: None,
        }
    }

    pub fn leased(status: JobStatus, owner: impl Into<String>) -> Self {
        Self {
            status,
            lease_owner: Some(owner.into()),
        }
    }
}

/// Fields to change on a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub artifact: Option<(Stage, String)>,
    pub prediction: Option<Prediction>,
    pub result: Option<PredictionResult>,
    pub error: Option<JobError>,
    pub last_failure: Option<StageFailureRecord>,
    pub attempts: Option<u32>,
    pub timeout_attempts: Option<u32>,
    pub notification: Option<NotificationStatus>,
    pub cancel_requested: Option<bool>,
    pub release_lease: bool,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn artifact(mut self, stage: Stage, location: impl Into<String>) -> Self {
        self.artifact = Some((stage, location.into()));
        self
    }

    pub fn prediction(mut self, prediction: Prediction) -> Self {
        self.prediction = Some(prediction);
        self
    }

    pub fn result(mut self, result: PredictionResult) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: JobError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn last_failure(mut self, failure: StageFailureRecord) -> Self {
        self.last_failure = Some(failure);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn timeout_attempts(mut self, attempts: u32) -> Self {
        self.timeout_attempts = Some(attempts);
        self
    }

    pub fn notification(mut self, notification: NotificationStatus) -> Self {
        self.notification = Some(notification);
        self
    }

    pub fn cancel_requested(mut self, requested: bool) -> Self {
        self.cancel_requested = Some(requested);
        self
    }

    pub fn release_lease(mut self) -> Self {
        self.release_lease = true;
        self
    }
}

impl Job {
    /// Validate `update` against `precondition` and the lifecycle invariants,
    /// then apply it. On error the job is left untouched.
    pub fn apply(
        &mut self,
        precondition: &Precondition,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check(precondition, &update, now)?;

        let target = update.status.unwrap_or(self.status);
        if target != self.status {
            self.attempts = 0;
            self.timeout_attempts = 0;
        }
        if let Some((stage, location)) = update.artifact {
            self.stage_artifacts.insert(stage, location);
        }
        if let Some(prediction) = update.prediction {
            self.prediction = Some(prediction);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        if let Some(failure) = update.last_failure {
            self.last_failure = Some(failure);
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(attempts) = update.timeout_attempts {
            self.timeout_attempts = attempts;
        }
        if let Some(notification) = update.notification {
            self.notification = Some(notification);
        }
        if let Some(requested) = update.cancel_requested {
            self.cancel_requested = requested;
        }
        if update.release_lease || target.is_terminal() {
            self.lease_owner = None;
            self.lease_expires_at = None;
        }
        if target.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    fn check(
        &self,
        precondition: &Precondition,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::Immutable(self.id.to_string()));
        }
        if self.status != precondition.status {
            return Err(Error::Conflict(format!(
                "job {} is {}, expected {}",
                self.id, self.status, precondition.status
            )));
        }
        if let Some(owner) = &precondition.lease_owner {
            if !self.is_leased_by(owner, now) {
                return Err(Error::Conflict(format!(
                    "lease on job {} is not held by {owner}",
                    self.id
                )));
            }
        }

        let target = update.status.unwrap_or(self.status);
        if target != self.status && !self.status.can_transition_to(target) {
            return Err(Error::InvalidInput(format!(
                "illegal transition {} -> {target}",
                self.status
            )));
        }
        if let Some((stage, _)) = &update.artifact {
            if self.status.stage() != Some(*stage) {
                return Err(Error::InvalidInput(format!(
                    "stage {stage} cannot record an artifact while job is {}",
                    self.status
                )));
            }
        }
        if update.result.is_some() && target != JobStatus::Completed {
            return Err(Error::InvalidInput(
                "a result may only be recorded on completion".to_string(),
            ));
        }
        if update.error.is_some() && target != JobStatus::Failed {
            return Err(Error::InvalidInput(
                "an error may only be recorded on failure".to_string(),
            ));
        }
        if target == JobStatus::Completed && update.result.is_none() && self.result.is_none() {
            return Err(Error::InvalidInput(
                "completion requires a result".to_string(),
            ));
        }
        if target == JobStatus::Failed && update.error.is_none() && self.error.is_none() {
            return Err(Error::InvalidInput("failure requires an error".to_string()));
        }
        Ok(())
    }
}

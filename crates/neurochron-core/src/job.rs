//! The job record and its lifecycle states.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::failure::FailureCause;
use crate::{Error, JobId, Result};

/// Youngest chronological age (exclusive) the age model is valid for.
pub const MIN_CHRONOLOGICAL_AGE: u32 = 21;

/// Oldest chronological age accepted at submission.
pub const MAX_CHRONOLOGICAL_AGE: u32 = 120;

/// One independently retryable step of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Convert,
    Preprocess,
    Predict,
    Notify,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Convert,
        Stage::Preprocess,
        Stage::Predict,
        Stage::Notify,
    ];

    /// The job status while this stage is running.
    pub fn status(self) -> JobStatus {
        match self {
            Stage::Convert => JobStatus::Converting,
            Stage::Preprocess => JobStatus::Preprocessing,
            Stage::Predict => JobStatus::Predicting,
            Stage::Notify => JobStatus::Notifying,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Convert => "convert",
            Stage::Preprocess => "preprocess",
            Stage::Predict => "predict",
            Stage::Notify => "notify",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown stage: {s}")))
    }
}

/// Lifecycle status of a job.
///
/// Non-terminal statuses form a strict total order:
/// QUEUED → CONVERTING → PREPROCESSING → PREDICTING → NOTIFYING → COMPLETED.
/// FAILED is reachable from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Converting,
    Preprocessing,
    Predicting,
    Notifying,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Converting,
        JobStatus::Preprocessing,
        JobStatus::Predicting,
        JobStatus::Notifying,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// The stage executed while in this status, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            JobStatus::Converting => Some(Stage::Convert),
            JobStatus::Preprocessing => Some(Stage::Preprocess),
            JobStatus::Predicting => Some(Stage::Predict),
            JobStatus::Notifying => Some(Stage::Notify),
            _ => None,
        }
    }

    /// Successor on the success path.
    pub fn next(self) -> Option<JobStatus> {
        match self {
            JobStatus::Queued => Some(JobStatus::Converting),
            JobStatus::Converting => Some(JobStatus::Preprocessing),
            JobStatus::Preprocessing => Some(JobStatus::Predicting),
            JobStatus::Predicting => Some(JobStatus::Notifying),
            JobStatus::Notifying => Some(JobStatus::Completed),
            JobStatus::Completed | JobStatus::Failed => None,
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == JobStatus::Failed || self.next() == Some(to)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Converting => "CONVERTING",
            JobStatus::Preprocessing => "PREPROCESSING",
            JobStatus::Predicting => "PREDICTING",
            JobStatus::Notifying => "NOTIFYING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Human-readable progress line for status dashboards.
    pub fn progress_message(self) -> &'static str {
        match self {
            JobStatus::Queued => "Job queued. Waiting for a free worker.",
            JobStatus::Converting => "Converting the uploaded scan to a volumetric image.",
            JobStatus::Preprocessing => "Running preprocessing (typically several hours).",
            JobStatus::Predicting => "Predicting brain age from the preprocessed volume.",
            JobStatus::Notifying => "Delivering results.",
            JobStatus::Completed => "Analysis complete. Results are ready.",
            JobStatus::Failed => "Job failed. See the error for details.",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status: {s}")))
    }
}

/// Raw output of the age model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_age: f64,
    pub explanation_ref: Option<String>,
}

/// Final payload of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub predicted_age: f64,
    pub chronological_age: u32,
    pub brain_age_gap: f64,
    pub interpretation: String,
    pub explanation_ref: Option<String>,
}

impl PredictionResult {
    pub fn new(prediction: &Prediction, chronological_age: u32) -> Self {
        let brain_age_gap = prediction.predicted_age - f64::from(chronological_age);
        Self {
            predicted_age: prediction.predicted_age,
            chronological_age,
            brain_age_gap,
            interpretation: interpret_gap(brain_age_gap),
            explanation_ref: prediction.explanation_ref.clone(),
        }
    }
}

/// Plain-language reading of a brain age gap.
pub fn interpret_gap(gap: f64) -> String {
    let rounded = (gap.abs() * 10.0).round() / 10.0;
    if rounded == 0.0 {
        "Brain age matches chronological age".to_string()
    } else if gap > 0.0 {
        format!("Brain appears {rounded:.1} years older than chronological age")
    } else {
        format!("Brain appears {rounded:.1} years younger than chronological age")
    }
}

/// Structured cause of a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub stage: Option<Stage>,
    pub cause: FailureCause,
    pub message: String,
    pub retry_count: u32,
}

impl JobError {
    /// The client-facing category; never an internal error string.
    pub fn category(&self) -> &'static str {
        self.cause.category()
    }
}

/// A stage failure as recorded before the retry/escalate decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailureRecord {
    pub stage: Stage,
    pub cause: FailureCause,
    pub message: String,
    pub retry_count: u32,
    pub at: DateTime<Utc>,
}

/// Outcome of the notification step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationStatus {
    pub delivered: bool,
    pub warning: Option<String>,
}

/// Input accepted at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub input_reference: String,
    pub chronological_age: u32,
    pub contact: String,
}

impl NewJob {
    pub fn validate(&self) -> Result<()> {
        if self.chronological_age <= MIN_CHRONOLOGICAL_AGE {
            return Err(Error::InvalidInput(format!(
                "brain age prediction is only valid for individuals older than {MIN_CHRONOLOGICAL_AGE} years"
            )));
        }
        if self.chronological_age > MAX_CHRONOLOGICAL_AGE {
            return Err(Error::InvalidInput(format!(
                "chronological age must be at most {MAX_CHRONOLOGICAL_AGE}"
            )));
        }
        if self.input_reference.trim().is_empty() {
            return Err(Error::InvalidInput("input reference is required".to_string()));
        }
        if self.contact.trim().is_empty() {
            return Err(Error::InvalidInput("contact address is required".to_string()));
        }
        Ok(())
    }
}

/// The unit of work driven through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub chronological_age: u32,
    pub contact: String,
    pub input_reference: String,
    pub subject_id: String,
    pub stage_artifacts: BTreeMap<Stage, String>,
    pub prediction: Option<Prediction>,
    pub result: Option<PredictionResult>,
    pub error: Option<JobError>,
    pub last_failure: Option<StageFailureRecord>,
    /// Retries consumed by the current stage.
    pub attempts: u32,
    /// Subset of `attempts` spent on timeouts.
    #[serde(default)]
    pub timeout_attempts: u32,
    pub notification: Option<NotificationStatus>,
    pub cancel_requested: bool,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a QUEUED job from validated submission input.
    pub fn new(input: NewJob) -> Result<Self> {
        input.validate()?;
        let id = JobId::new();
        let now = Utc::now();
        Ok(Self {
            id,
            status: JobStatus::Queued,
            chronological_age: input.chronological_age,
            contact: input.contact.trim().to_string(),
            input_reference: input.input_reference,
            subject_id: id.subject_id(),
            stage_artifacts: BTreeMap::new(),
            prediction: None,
            result: None,
            error: None,
            last_failure: None,
            attempts: 0,
            timeout_attempts: 0,
            notification: None,
            cancel_requested: false,
            lease_owner: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        })
    }

    pub fn artifact(&self, stage: Stage) -> Option<&str> {
        self.stage_artifacts.get(&stage).map(String::as_str)
    }

    /// Whether some worker holds an unexpired lease at `now`.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|at| at > now)
    }

    pub fn is_leased_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lease_owner.as_deref() == Some(owner) && self.has_live_lease(now)
    }

    /// Whether a free worker may pick this job up.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && !self.has_live_lease(now)
    }

    /// Take the lease for `owner`. Re-acquiring an own lease extends it.
    pub fn try_acquire_lease(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if self.has_live_lease(now) && self.lease_owner.as_deref() != Some(owner) {
            return false;
        }
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(lease_deadline(now, ttl));
        true
    }

    /// Extend a lease still held by `owner`.
    pub fn renew_lease(&mut self, owner: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() || !self.is_leased_by(owner, now) {
            return false;
        }
        self.lease_expires_at = Some(lease_deadline(now, ttl));
        true
    }

    pub fn release_lease(&mut self, owner: &str) {
        if self.lease_owner.as_deref() == Some(owner) {
            self.lease_owner = None;
            self.lease_expires_at = None;
        }
    }
}

pub fn lease_deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::days(365))
}

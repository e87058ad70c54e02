//! Job state machine - drives one leased job through its stages.
//!
//! The orchestrator resumes from whatever status the job record holds, so
//! a job picked up after a crash re-runs only the stage that had not yet
//! recorded its artifact. Every transition is a conditional store update
//! guarded by the expected status and the caller's lease; a store error
//! halts the job where it is.

use std::sync::Arc;

use chrono::Utc;
use neurochron_core::collaborator::{Notification, Notifier};
use neurochron_core::{
    CancelSignal, Error as CoreError, FailureCause, Job, JobError, JobStatus, JobStore,
    JobUpdate, NotificationStatus, Precondition, PredictionResult, Stage, StageFailure,
    StageFailureRecord, StageOutput, StageResult,
};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerResult;
use crate::retry::{Decision, RetryPolicy};
use crate::runners::RunnerSet;

/// How a call to [`Orchestrator::drive`] ended.
#[derive(Debug, Clone)]
pub enum DriveOutcome {
    /// The job is COMPLETED or FAILED.
    Finished(Job),
    /// Work stopped without a terminal transition (shutdown or lost lease).
    /// The job stays resumable.
    Interrupted(Job),
}

impl DriveOutcome {
    pub fn job(&self) -> &Job {
        match self {
            DriveOutcome::Finished(job) | DriveOutcome::Interrupted(job) => job,
        }
    }
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    runners: RunnerSet,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl Orchestrator {
    /// `notifier` sends failure notices; result notices go through the
    /// notify stage runner.
    pub fn new(
        store: Arc<dyn JobStore>,
        runners: RunnerSet,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            runners,
            notifier,
            policy,
        }
    }

    /// Drive `job` until it is terminal or interrupted. The caller must hold
    /// the job's lease as `owner`.
    pub async fn drive(
        &self,
        mut job: Job,
        owner: &str,
        mut cancel: CancelSignal,
    ) -> SchedulerResult<DriveOutcome> {
        loop {
            if job.status.is_terminal() {
                debug!(job_id = %job.id, status = %job.status, "Job already finished");
                return Ok(DriveOutcome::Finished(job));
            }
            if job.cancel_requested || cancel.is_cancelled() {
                return self.stop(job, owner).await;
            }

            let Some(stage) = job.status.stage() else {
                job = self
                    .write(&job, owner, JobUpdate::new().status(JobStatus::Converting))
                    .await?;
                info!(job_id = %job.id, status = %job.status, "Job started");
                continue;
            };

            info!(job_id = %job.id, stage = %stage, attempt = job.attempts + 1, "Running stage");
            let runner = self.runners.get(stage)?;
            let result = runner.run(&job, cancel.clone()).await;
            match result {
                StageResult::Success(output) => {
                    job = self.record_success(job, stage, output, owner).await?;
                }
                StageResult::Failure(failure) if failure.cause == FailureCause::Cancelled => {
                    return self.stop(job, owner).await;
                }
                StageResult::Failure(failure) => {
                    let decision =
                        self.policy
                            .decide(stage, &failure, job.attempts, job.timeout_attempts);
                    job = self.record_failure(&job, stage, &failure, decision, owner).await?;
                    match decision {
                        Decision::Retry { delay } => {
                            warn!(
                                job_id = %job.id,
                                stage = %stage,
                                cause = %failure.cause,
                                attempt = job.attempts,
                                ?delay,
                                error = %failure.message,
                                "Stage failed, retrying"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => {}
                            }
                        }
                        // Delivery is best effort: exhausting it still completes the job.
                        Decision::Fail if stage == Stage::Notify => {
                            job = self.complete(job, owner, Some(failure.message)).await?;
                        }
                        Decision::Fail => {
                            job = self.fail(job, owner, Some(stage), failure).await?;
                        }
                    }
                }
            }
        }
    }

    async fn write(&self, job: &Job, owner: &str, update: JobUpdate) -> SchedulerResult<Job> {
        let precondition = Precondition::leased(job.status, owner);
        Ok(self.store.update(job.id, &precondition, update).await?)
    }

    async fn record_success(
        &self,
        job: Job,
        stage: Stage,
        output: StageOutput,
        owner: &str,
    ) -> SchedulerResult<Job> {
        let next = job.status.next().ok_or_else(|| {
            CoreError::Internal(format!("job {} has no status after {}", job.id, job.status))
        })?;
        let update = match output {
            StageOutput::Delivered => return self.complete(job, owner, None).await,
            StageOutput::Artifact(location) => {
                JobUpdate::new().artifact(stage, location).status(next)
            }
            StageOutput::Prediction {
                artifact,
                prediction,
            } => JobUpdate::new()
                .artifact(stage, artifact)
                .prediction(prediction)
                .status(next),
        };
        let job = self.write(&job, owner, update).await?;
        info!(job_id = %job.id, stage = %stage, status = %job.status, "Stage succeeded");
        Ok(job)
    }

    async fn record_failure(
        &self,
        job: &Job,
        stage: Stage,
        failure: &StageFailure,
        decision: Decision,
        owner: &str,
    ) -> SchedulerResult<Job> {
        let mut update = JobUpdate::new().last_failure(StageFailureRecord {
            stage,
            cause: failure.cause,
            message: failure.message.clone(),
            retry_count: job.attempts,
            at: Utc::now(),
        });
        if let Decision::Retry { .. } = decision {
            update = update.attempts(job.attempts + 1);
            if failure.cause == FailureCause::Timeout {
                update = update.timeout_attempts(job.timeout_attempts + 1);
            }
        }
        self.write(job, owner, update).await
    }

    async fn complete(
        &self,
        job: Job,
        owner: &str,
        warning: Option<String>,
    ) -> SchedulerResult<Job> {
        let Some(prediction) = job.prediction.clone() else {
            let failure = StageFailure::fatal(
                FailureCause::InferenceError,
                "no prediction recorded before notification",
            );
            return self.fail(job, owner, Some(Stage::Predict), failure).await;
        };
        let result = PredictionResult::new(&prediction, job.chronological_age);
        let delivered = warning.is_none();
        let update = JobUpdate::new()
            .status(JobStatus::Completed)
            .result(result)
            .notification(NotificationStatus { delivered, warning });
        let job = self.write(&job, owner, update).await?;
        info!(
            job_id = %job.id,
            delivered,
            predicted_age = prediction.predicted_age,
            "Job completed"
        );
        Ok(job)
    }

    async fn fail(
        &self,
        job: Job,
        owner: &str,
        stage: Option<Stage>,
        failure: StageFailure,
    ) -> SchedulerResult<Job> {
        let cause = failure.cause;
        let error = JobError {
            stage,
            cause,
            message: failure.message,
            retry_count: job.attempts,
        };
        let update = JobUpdate::new().status(JobStatus::Failed).error(error);
        let job = self.write(&job, owner, update).await?;
        error!(
            job_id = %job.id,
            stage = ?stage,
            cause = %cause,
            retry_count = job.error.as_ref().map_or(0, |e| e.retry_count),
            "Job failed"
        );
        if cause != FailureCause::Cancelled {
            self.send_failure_notice(&job, cause).await;
        }
        Ok(job)
    }

    /// Stop work after a cancellation signal. A cancel request recorded on
    /// the job fails it; anything else (shutdown, lost lease) leaves it
    /// resumable.
    async fn stop(&self, job: Job, owner: &str) -> SchedulerResult<DriveOutcome> {
        let current = self.store.get(job.id).await?;
        if current.status.is_terminal() {
            return Ok(DriveOutcome::Finished(current));
        }
        if !current.is_leased_by(owner, Utc::now()) {
            warn!(job_id = %job.id, owner, "Lease lost, abandoning job");
            return Ok(DriveOutcome::Interrupted(current));
        }
        if !current.cancel_requested {
            info!(job_id = %job.id, status = %current.status, "Job interrupted");
            return Ok(DriveOutcome::Interrupted(current));
        }
        let stage = current.status.stage();
        let failure = StageFailure::fatal(FailureCause::Cancelled, "cancelled by request");
        let job = self.fail(current, owner, stage, failure).await?;
        Ok(DriveOutcome::Finished(job))
    }

    async fn send_failure_notice(&self, job: &Job, cause: FailureCause) {
        let notice = Notification::Failed {
            job_id: job.id,
            subject_id: job.subject_id.clone(),
            category: cause.category().to_string(),
        };
        match self.notifier.send(&job.contact, &notice).await {
            Ok(()) => info!(job_id = %job.id, "Failure notice sent"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Failure notice not delivered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        Harness, MockConverter, MockNotifier, MockPredictor, MockPreprocessor,
        immediate_policy_from, queued_job,
    };
    use neurochron_config::RetryConfig;
    use neurochron_core::cancel_pair;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const OWNER: &str = "worker-1";

    fn harness_with_preprocessor(preprocessor: MockPreprocessor) -> Harness {
        Harness::new(
            MockConverter::default(),
            preprocessor,
            MockPredictor::default(),
            MockNotifier::default(),
        )
    }

    #[tokio::test]
    async fn completes_with_brain_age_gap() {
        let h = Harness::new(
            MockConverter::default(),
            MockPreprocessor::default(),
            MockPredictor::new(81.51),
            MockNotifier::default(),
        );
        let job = h.claimed(45, OWNER).await;
        let id = job.id;

        let outcome = h
            .orchestrator()
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert!(matches!(outcome, DriveOutcome::Finished(_)));
        assert_eq!(job.status, JobStatus::Completed);

        let result = job.result.as_ref().unwrap();
        assert_eq!(result.predicted_age, 81.51);
        assert_eq!(result.chronological_age, 45);
        assert!((result.brain_age_gap - 36.51).abs() < 1e-9);
        assert!(job.error.is_none());
        assert!(job.lease_owner.is_none());
        assert!(job.finished_at.is_some());
        assert_eq!(job.notification.as_ref().map(|n| n.delivered), Some(true));
        assert!(job.artifact(Stage::Convert).is_some());
        assert_eq!(
            job.artifact(Stage::Preprocess),
            Some(format!("/subjects/{}", job.subject_id).as_str())
        );
        assert!(job.artifact(Stage::Predict).is_some());

        assert_eq!(
            h.store.history(id),
            vec![
                JobStatus::Queued,
                JobStatus::Converting,
                JobStatus::Preprocessing,
                JobStatus::Predicting,
                JobStatus::Notifying,
                JobStatus::Completed,
            ]
        );
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1, Notification::Completed { .. }));
    }

    #[tokio::test]
    async fn invalid_format_fails_without_retry() {
        let h = Harness::new(
            MockConverter {
                invalid: true,
                ..MockConverter::default()
            },
            MockPreprocessor::default(),
            MockPredictor::default(),
            MockNotifier::default(),
        );
        let job = h.claimed(45, OWNER).await;
        let id = job.id;

        let outcome = h
            .orchestrator()
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.as_ref().unwrap();
        assert_eq!(error.cause, FailureCause::InvalidFormat);
        assert_eq!(error.stage, Some(Stage::Convert));
        assert_eq!(error.retry_count, 0);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.preprocessor.calls.load(Ordering::SeqCst), 0);

        let last = job.last_failure.as_ref().unwrap();
        assert_eq!(last.cause, FailureCause::InvalidFormat);
        assert_eq!(last.retry_count, 0);

        assert_eq!(
            h.store.history(id),
            vec![JobStatus::Queued, JobStatus::Converting, JobStatus::Failed]
        );
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].1, Notification::Failed { .. }));
    }

    #[tokio::test]
    async fn transient_failure_retries_then_advances() {
        let h = Harness::new(
            MockConverter {
                io_failures: 2,
                ..MockConverter::default()
            },
            MockPreprocessor::default(),
            MockPredictor::default(),
            MockNotifier::default(),
        );
        let job = h.claimed(45, OWNER).await;

        let outcome = h
            .orchestrator()
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.attempts, 0);
        let last = job.last_failure.as_ref().unwrap();
        assert_eq!((last.stage, last.retry_count), (Stage::Convert, 1));
    }

    #[tokio::test]
    async fn repeated_timeout_fails_after_one_retry() {
        let h = harness_with_preprocessor(MockPreprocessor {
            timeouts: 2,
            ..MockPreprocessor::default()
        });
        let job = h.claimed(45, OWNER).await;

        let outcome = h
            .orchestrator()
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.as_ref().unwrap();
        assert_eq!(error.cause, FailureCause::Timeout);
        assert_eq!(error.stage, Some(Stage::Preprocess));
        assert_eq!(error.retry_count, 1);
        assert_eq!(h.preprocessor.calls.load(Ordering::SeqCst), 2);
        assert_eq!(job.error.as_ref().unwrap().category(), "Preprocessing took too long");
    }

    #[tokio::test]
    async fn timeout_after_tool_failure_still_gets_its_retry() {
        let h = harness_with_preprocessor(MockPreprocessor {
            tool_failures: 1,
            timeouts: 1,
            ..MockPreprocessor::default()
        });
        let mut retry = RetryConfig::default();
        retry.preprocess.max_retries = 3;
        let job = h.claimed(45, OWNER).await;

        let outcome = h
            .orchestrator_with(immediate_policy_from(retry, 1))
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.preprocessor.calls.load(Ordering::SeqCst), 3);
        let last = job.last_failure.as_ref().unwrap();
        assert_eq!(last.cause, FailureCause::Timeout);
        assert_eq!(last.retry_count, 1);
    }

    #[tokio::test]
    async fn missing_license_is_fatal() {
        let h = harness_with_preprocessor(MockPreprocessor {
            license_missing: true,
            ..MockPreprocessor::default()
        });
        let job = h.claimed(45, OWNER).await;

        let outcome = h
            .orchestrator()
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let error = outcome.job().error.clone().unwrap();
        assert_eq!(error.cause, FailureCause::LicenseMissing);
        assert_eq!(error.retry_count, 0);
        assert_eq!(h.preprocessor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_delivery_still_completes() {
        let h = Harness::new(
            MockConverter::default(),
            MockPreprocessor::default(),
            MockPredictor::new(60.0),
            MockNotifier::failing(),
        );
        let job = h.claimed(45, OWNER).await;

        let outcome = h
            .orchestrator()
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
        let notification = job.notification.as_ref().unwrap();
        assert!(!notification.delivered);
        assert!(notification.warning.is_some());
        // First attempt plus the notify stage's two retries.
        assert_eq!(h.notifier.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn resumes_at_preprocessing_after_lease_expiry() {
        let h = Harness::default();
        let mut job = queued_job(45);
        job.status = JobStatus::Preprocessing;
        job.stage_artifacts
            .insert(Stage::Convert, "/work/original/volume.nii".to_string());
        job.lease_owner = Some("dead-worker".to_string());
        job.lease_expires_at = Some(Utc::now() + chrono::TimeDelta::seconds(60));
        h.store.inner.put_raw(job.clone()).await;

        // The dead worker's lease is still live.
        let claimed = h
            .store
            .claim_next(OWNER, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(claimed.is_none());

        job.lease_expires_at = Some(Utc::now() - chrono::TimeDelta::seconds(1));
        h.store.inner.put_raw(job).await;
        let claimed = h
            .store
            .claim_next(OWNER, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Preprocessing);

        let outcome = h
            .orchestrator()
            .drive(claimed, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.preprocessor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            job.artifact(Stage::Convert),
            Some("/work/original/volume.nii")
        );
    }

    #[tokio::test]
    async fn completed_job_is_a_no_op() {
        let h = Harness::default();
        let job = h.claimed(45, OWNER).await;
        let orchestrator = h.orchestrator();
        let done = orchestrator
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap()
            .job()
            .clone();
        assert_eq!(done.status, JobStatus::Completed);

        let again = orchestrator
            .drive(done.clone(), OWNER, CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(again.job().updated_at, done.updated_at);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn cancel_request_fails_at_stage_boundary() {
        let h = Harness::default();
        let job = h.claimed(45, OWNER).await;
        let job = h
            .store
            .update(
                job.id,
                &Precondition::status(JobStatus::Queued),
                JobUpdate::new().cancel_requested(true),
            )
            .await
            .unwrap();

        let outcome = h
            .orchestrator()
            .drive(job, OWNER, CancelSignal::never())
            .await
            .unwrap();
        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_ref().unwrap().cause, FailureCause::Cancelled);
        assert_eq!(h.converter.calls.load(Ordering::SeqCst), 0);
        // Cancelled jobs get no failure notice.
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn signal_without_request_leaves_job_resumable() {
        let h = harness_with_preprocessor(MockPreprocessor {
            wait_for_cancel: true,
            ..MockPreprocessor::default()
        });
        let job = h.claimed(45, OWNER).await;
        let (handle, signal) = cancel_pair();
        let orchestrator = h.orchestrator();

        let drive = orchestrator.drive(job, OWNER, signal);
        let interrupt = async {
            while h.preprocessor.in_flight() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle.cancel();
        };
        let (outcome, ()) = tokio::join!(drive, interrupt);

        let outcome = outcome.unwrap();
        assert!(matches!(outcome, DriveOutcome::Interrupted(_)));
        assert_eq!(outcome.job().status, JobStatus::Preprocessing);
        assert!(outcome.job().error.is_none());
    }

    #[tokio::test]
    async fn lost_lease_halts_without_writing() {
        let h = Harness::default();
        let job = h.claimed(45, OWNER).await;

        let err = h
            .orchestrator()
            .drive(job.clone(), "someone-else", CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::SchedulerError::Store(CoreError::Conflict(_))
        ));
        assert_eq!(h.store.get(job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn store_outage_mid_transition_leaves_job_at_last_committed_stage() {
        let h = Harness::default();
        h.store.refuse_transitions_to(JobStatus::Predicting);
        let job = h.claimed(45, OWNER).await;

        let err = h
            .orchestrator()
            .drive(job.clone(), OWNER, CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::SchedulerError::Store(CoreError::Unavailable(_))
        ));

        let stored = h.store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Preprocessing);
        assert!(!stored.stage_artifacts.contains_key(&Stage::Preprocess));
        assert!(stored.stage_artifacts.contains_key(&Stage::Convert));
        assert_eq!(h.predictor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.store.history(job.id),
            vec![JobStatus::Queued, JobStatus::Converting, JobStatus::Preprocessing]
        );
    }
}

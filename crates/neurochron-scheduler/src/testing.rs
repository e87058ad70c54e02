//! Scripted collaborators and store wrappers for scheduler tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use neurochron_config::{RetryConfig, StageRetryConfig};
use neurochron_core::collaborator::{
    ConvertError, ConvertRequest, Converter, DeliveryError, Notification, Notifier,
    PredictError, PreprocessError, Predictor, Preprocessor, ToolInvocation,
};
use neurochron_core::{
    CancelSignal, Error, Job, JobFilter, JobId, JobStatus, JobStore, JobUpdate, NewJob, Precondition,
    Prediction, Result, StageRunner,
};
use neurochron_db::InMemoryJobStore;

use crate::orchestrator::Orchestrator;
use crate::retry::RetryPolicy;
use crate::runners::{ConvertRunner, NotifyRunner, PredictRunner, PreprocessRunner, RunnerSet};

pub fn new_job(age: u32) -> NewJob {
    NewJob {
        input_reference: "/uploads/scan.zip".to_string(),
        chronological_age: age,
        contact: "user@example.org".to_string(),
    }
}

pub fn queued_job(age: u32) -> Job {
    Job::new(new_job(age)).unwrap()
}

/// Retry budgets from the defaults with every delay set to zero.
pub fn immediate_policy() -> RetryPolicy {
    immediate_policy_from(RetryConfig::default(), 1)
}

/// `retry` with every delay set to zero.
pub fn immediate_policy_from(retry: RetryConfig, timeout_retries: u32) -> RetryPolicy {
    let zero = |c: StageRetryConfig| StageRetryConfig::new(c.max_retries, Duration::ZERO, Duration::ZERO);
    RetryPolicy::new(
        RetryConfig {
            convert: zero(retry.convert),
            preprocess: zero(retry.preprocess),
            predict: zero(retry.predict),
            notify: zero(retry.notify),
        },
        timeout_retries,
    )
}

#[derive(Default)]
pub struct MockConverter {
    pub calls: AtomicUsize,
    /// Leading calls that fail with a transient storage error.
    pub io_failures: usize,
    pub invalid: bool,
}

#[async_trait]
impl Converter for MockConverter {
    async fn convert(&self, request: &ConvertRequest) -> std::result::Result<String, ConvertError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.invalid {
            return Err(ConvertError::InvalidFormat("no DICOM files found".to_string()));
        }
        if call < self.io_failures {
            return Err(ConvertError::Io("upload bucket unavailable".to_string()));
        }
        Ok(format!(
            "{}/{}.nii",
            request.output_dir.display(),
            request.job_id
        ))
    }
}

#[derive(Default)]
pub struct MockPreprocessor {
    pub calls: AtomicUsize,
    /// Leading calls that exit non-zero.
    pub tool_failures: usize,
    /// Calls after the tool failures that time out.
    pub timeouts: usize,
    pub license_missing: bool,
    /// Block until cancelled instead of finishing.
    pub wait_for_cancel: bool,
    pub delay: Duration,
    pub in_flight: Mutex<HashSet<JobId>>,
    pub max_in_flight: AtomicUsize,
    pub overlapped: AtomicBool,
}

impl MockPreprocessor {
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

#[async_trait]
impl Preprocessor for MockPreprocessor {
    async fn run_external_tool(
        &self,
        invocation: &ToolInvocation,
        mut cancel: CancelSignal,
    ) -> std::result::Result<String, PreprocessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(invocation.job_id) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.max_in_flight.fetch_max(in_flight.len(), Ordering::SeqCst);
        }

        let outcome = if self.license_missing {
            Err(PreprocessError::LicenseMissing(
                invocation.license_ref.display().to_string(),
            ))
        } else if call < self.tool_failures {
            Err(PreprocessError::ToolFailed {
                exit_code: 1,
                message: "recon-all exited with ERRORS".to_string(),
            })
        } else if call < self.tool_failures + self.timeouts {
            Err(PreprocessError::Timeout(invocation.timeout))
        } else if self.wait_for_cancel {
            cancel.cancelled().await;
            Err(PreprocessError::Cancelled)
        } else {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(format!("/subjects/{}", invocation.subject_id)),
                _ = cancel.cancelled() => Err(PreprocessError::Cancelled),
            }
        };

        self.in_flight.lock().unwrap().remove(&invocation.job_id);
        outcome
    }
}

pub struct MockPredictor {
    pub calls: AtomicUsize,
    pub prediction: Prediction,
}

impl MockPredictor {
    pub fn new(predicted_age: f64) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            prediction: Prediction {
                predicted_age,
                explanation_ref: None,
            },
        }
    }

    pub fn explained(predicted_age: f64, explanation: &str) -> Self {
        let mut predictor = Self::new(predicted_age);
        predictor.prediction.explanation_ref = Some(explanation.to_string());
        predictor
    }
}

impl Default for MockPredictor {
    fn default() -> Self {
        Self::new(70.0)
    }
}

#[async_trait]
impl Predictor for MockPredictor {
    async fn predict(&self, _output_dir_ref: &str) -> std::result::Result<Prediction, PredictError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.prediction.clone())
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub fail: bool,
    pub attempts: AtomicUsize,
    pub sent: Mutex<Vec<(String, Notification)>>,
}

impl MockNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<(String, Notification)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn send(
        &self,
        contact: &str,
        notification: &Notification,
    ) -> std::result::Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DeliveryError::transient("mailbox unavailable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((contact.to_string(), notification.clone()));
        Ok(())
    }
}

/// Store wrapper that records every status it persists.
#[derive(Default)]
pub struct RecordingStore {
    pub inner: InMemoryJobStore,
    history: Mutex<Vec<(JobId, JobStatus)>>,
    unavailable_for: Mutex<Option<JobStatus>>,
}

impl RecordingStore {
    /// Fail every update that would move a job to `status`, as a dropped
    /// database connection would.
    pub fn refuse_transitions_to(&self, status: JobStatus) {
        *self.unavailable_for.lock().unwrap() = Some(status);
    }

    pub fn history(&self, id: JobId) -> Vec<JobStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(job_id, _)| *job_id == id)
            .map(|(_, status)| *status)
            .collect()
    }

    fn record(&self, job: &Job) {
        let mut history = self.history.lock().unwrap();
        let changed = history
            .iter()
            .rev()
            .find(|(id, _)| *id == job.id)
            .is_none_or(|(_, status)| *status != job.status);
        if changed {
            history.push((job.id, job.status));
        }
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn create(&self, job: Job) -> Result<JobId> {
        self.record(&job);
        self.inner.create(job).await
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.inner.get(id).await
    }

    async fn update(&self, id: JobId, precondition: &Precondition, update: JobUpdate) -> Result<Job> {
        let refused = *self.unavailable_for.lock().unwrap();
        if refused.is_some() && update.status == refused {
            return Err(Error::Unavailable("connection reset by peer".to_string()));
        }
        let job = self.inner.update(id, precondition, update).await?;
        self.record(&job);
        Ok(job)
    }

    fn list(&self, filter: JobFilter) -> BoxStream<'_, Result<Job>> {
        self.inner.list(filter)
    }

    async fn claim_next(&self, owner: &str, ttl: Duration) -> Result<Option<Job>> {
        self.inner.claim_next(owner, ttl).await
    }

    async fn renew_lease(&self, id: JobId, owner: &str, ttl: Duration) -> Result<bool> {
        self.inner.renew_lease(id, owner, ttl).await
    }

    async fn release_lease(&self, id: JobId, owner: &str) -> Result<()> {
        self.inner.release_lease(id, owner).await
    }
}

/// Mock collaborators wired into real runners over a recording store.
pub struct Harness {
    pub store: Arc<RecordingStore>,
    pub converter: Arc<MockConverter>,
    pub preprocessor: Arc<MockPreprocessor>,
    pub predictor: Arc<MockPredictor>,
    pub notifier: Arc<MockNotifier>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new(
            MockConverter::default(),
            MockPreprocessor::default(),
            MockPredictor::default(),
            MockNotifier::default(),
        )
    }
}

impl Harness {
    pub fn new(
        converter: MockConverter,
        preprocessor: MockPreprocessor,
        predictor: MockPredictor,
        notifier: MockNotifier,
    ) -> Self {
        Self {
            store: Arc::new(RecordingStore::default()),
            converter: Arc::new(converter),
            preprocessor: Arc::new(preprocessor),
            predictor: Arc::new(predictor),
            notifier: Arc::new(notifier),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(immediate_policy())
    }

    pub fn orchestrator_with(&self, policy: RetryPolicy) -> Orchestrator {
        let runners: Vec<Arc<dyn StageRunner>> = vec![
            Arc::new(ConvertRunner::new(self.converter.clone(), "/work")),
            Arc::new(PreprocessRunner::new(
                self.preprocessor.clone(),
                "/fs/license.txt",
                Duration::from_secs(60),
            )),
            Arc::new(PredictRunner::new(self.predictor.clone())),
            Arc::new(NotifyRunner::new(self.notifier.clone())),
        ];
        Orchestrator::new(
            self.store.clone(),
            RunnerSet::new(runners).unwrap(),
            self.notifier.clone(),
            policy,
        )
    }

    /// Persist a queued job and lease it to `owner`.
    pub async fn claimed(&self, age: u32, owner: &str) -> Job {
        self.store.create(queued_job(age)).await.unwrap();
        self.store
            .claim_next(owner, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap()
    }
}

/// Poll `store` until the job satisfies `done`.
pub async fn wait_for(
    store: &dyn JobStore,
    id: JobId,
    done: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get(id).await.unwrap();
        if done(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting on job {id}: {job:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

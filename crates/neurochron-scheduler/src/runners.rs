//! Stage runners wrapping the four collaborators.
//!
//! Each runner reads its input from the job snapshot, calls its
//! collaborator and translates the collaborator's error into a
//! [`StageFailure`] with a cause and retryability.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use neurochron_core::collaborator::{
    ConvertError, ConvertRequest, Converter, DeliveryError, Notification, Notifier,
    PredictError, PreprocessError, Predictor, Preprocessor, ToolInvocation,
};
use neurochron_core::{
    CancelSignal, FailureCause, Job, PredictionResult, Stage, StageFailure, StageOutput,
    StageResult, StageRunner,
};
use tracing::{debug, warn};

use crate::error::{SchedulerError, SchedulerResult};

pub fn convert_failure(err: ConvertError) -> StageFailure {
    match err {
        ConvertError::InvalidFormat(msg) => StageFailure::fatal(FailureCause::InvalidFormat, msg),
        ConvertError::Io(msg) => StageFailure::retryable(FailureCause::IoFailure, msg),
    }
}

pub fn preprocess_failure(err: PreprocessError) -> StageFailure {
    let message = err.to_string();
    match err {
        PreprocessError::ToolFailed { .. }
        | PreprocessError::NoOutput(_)
        | PreprocessError::Unavailable(_) => {
            StageFailure::retryable(FailureCause::ExternalToolError, message)
        }
        PreprocessError::LicenseMissing(_) => {
            StageFailure::fatal(FailureCause::LicenseMissing, message)
        }
        PreprocessError::Timeout(_) => StageFailure::retryable(FailureCause::Timeout, message),
        PreprocessError::Cancelled => StageFailure::fatal(FailureCause::Cancelled, message),
    }
}

pub fn predict_failure(err: PredictError) -> StageFailure {
    StageFailure::retryable(FailureCause::InferenceError, err.to_string())
}

pub fn delivery_failure(err: DeliveryError) -> StageFailure {
    StageFailure {
        cause: FailureCause::DeliveryError,
        retryable: err.transient,
        message: err.message,
    }
}

/// Read the artifact a previous stage recorded.
fn input_artifact(job: &Job, stage: Stage) -> Result<&str, StageFailure> {
    job.artifact(stage).ok_or_else(|| {
        StageFailure::fatal(
            FailureCause::IoFailure,
            format!("no {stage} artifact recorded for job {}", job.id),
        )
    })
}

pub struct ConvertRunner {
    converter: Arc<dyn Converter>,
    work_dir: PathBuf,
}

impl ConvertRunner {
    pub fn new(converter: Arc<dyn Converter>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            converter,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl StageRunner for ConvertRunner {
    fn stage(&self) -> Stage {
        Stage::Convert
    }

    async fn run(&self, job: &Job, _cancel: CancelSignal) -> StageResult {
        let request = ConvertRequest {
            job_id: job.id,
            raw_file_ref: job.input_reference.clone(),
            output_dir: self.work_dir.join(job.id.to_string()),
        };
        match self.converter.convert(&request).await {
            Ok(volume) => StageResult::Success(StageOutput::Artifact(volume)),
            Err(e) => StageResult::Failure(convert_failure(e)),
        }
    }
}

pub struct PreprocessRunner {
    preprocessor: Arc<dyn Preprocessor>,
    license: PathBuf,
    timeout: Duration,
}

impl PreprocessRunner {
    pub fn new(
        preprocessor: Arc<dyn Preprocessor>,
        license: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            preprocessor,
            license: license.into(),
            timeout,
        }
    }
}

#[async_trait]
impl StageRunner for PreprocessRunner {
    fn stage(&self) -> Stage {
        Stage::Preprocess
    }

    async fn run(&self, job: &Job, cancel: CancelSignal) -> StageResult {
        let volume = match input_artifact(job, Stage::Convert) {
            Ok(volume) => volume,
            Err(failure) => return StageResult::Failure(failure),
        };
        let invocation = ToolInvocation {
            job_id: job.id,
            subject_id: job.subject_id.clone(),
            volume_ref: volume.to_string(),
            license_ref: self.license.clone(),
            timeout: self.timeout,
        };
        debug!(job_id = %job.id, subject = %job.subject_id, "Invoking preprocessing tool");
        match self.preprocessor.run_external_tool(&invocation, cancel).await {
            Ok(output_dir) => StageResult::Success(StageOutput::Artifact(output_dir)),
            Err(e) => StageResult::Failure(preprocess_failure(e)),
        }
    }
}

pub struct PredictRunner {
    predictor: Arc<dyn Predictor>,
}

impl PredictRunner {
    pub fn new(predictor: Arc<dyn Predictor>) -> Self {
        Self { predictor }
    }
}

#[async_trait]
impl StageRunner for PredictRunner {
    fn stage(&self) -> Stage {
        Stage::Predict
    }

    async fn run(&self, job: &Job, _cancel: CancelSignal) -> StageResult {
        let output_dir = match input_artifact(job, Stage::Preprocess) {
            Ok(dir) => dir,
            Err(failure) => return StageResult::Failure(failure),
        };
        match self.predictor.predict(output_dir).await {
            Ok(prediction) => {
                // The explanation map is the stage's artifact when the model
                // produced one; otherwise the input it was computed from.
                let artifact = prediction
                    .explanation_ref
                    .clone()
                    .unwrap_or_else(|| output_dir.to_string());
                StageResult::Success(StageOutput::Prediction {
                    artifact,
                    prediction,
                })
            }
            Err(e) => StageResult::Failure(predict_failure(e)),
        }
    }
}

pub struct NotifyRunner {
    notifier: Arc<dyn Notifier>,
}

impl NotifyRunner {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl StageRunner for NotifyRunner {
    fn stage(&self) -> Stage {
        Stage::Notify
    }

    async fn run(&self, job: &Job, _cancel: CancelSignal) -> StageResult {
        let Some(prediction) = &job.prediction else {
            return StageResult::Failure(StageFailure::fatal(
                FailureCause::DeliveryError,
                "no prediction to report",
            ));
        };
        let notice = Notification::Completed {
            job_id: job.id,
            subject_id: job.subject_id.clone(),
            result: PredictionResult::new(prediction, job.chronological_age),
        };
        match self.notifier.send(&job.contact, &notice).await {
            Ok(()) => StageResult::Success(StageOutput::Delivered),
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    backend = self.notifier.name(),
                    error = %e,
                    "Result notification failed"
                );
                StageResult::Failure(delivery_failure(e))
            }
        }
    }
}

/// One runner per stage.
#[derive(Clone)]
pub struct RunnerSet {
    runners: BTreeMap<Stage, Arc<dyn StageRunner>>,
}

impl RunnerSet {
    /// Build from runners keyed by the stage they report. Every stage must
    /// be covered.
    pub fn new(runners: impl IntoIterator<Item = Arc<dyn StageRunner>>) -> SchedulerResult<Self> {
        let runners: BTreeMap<_, _> = runners.into_iter().map(|r| (r.stage(), r)).collect();
        if let Some(missing) = Stage::ALL.iter().find(|s| !runners.contains_key(*s)) {
            return Err(SchedulerError::MissingRunner(*missing));
        }
        Ok(Self { runners })
    }

    pub fn get(&self, stage: Stage) -> SchedulerResult<&Arc<dyn StageRunner>> {
        self.runners
            .get(&stage)
            .ok_or(SchedulerError::MissingRunner(stage))
    }
}

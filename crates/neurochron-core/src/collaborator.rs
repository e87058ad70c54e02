//! Boundaries to the opaque collaborators each stage wraps.
//!
//! Collaborators report typed errors; stage runners translate them into
//! [`StageFailure`](crate::failure::StageFailure) values.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::JobId;
use crate::cancel::CancelSignal;
use crate::job::{Prediction, PredictionResult};

/// Input for a format conversion.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub job_id: JobId,
    pub raw_file_ref: String,
    /// Directory the converted volume should be written under.
    pub output_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("input is not a decodable scan: {0}")]
    InvalidFormat(String),

    #[error("storage error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::Io(err.to_string())
    }
}

/// DICOM to volumetric conversion.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Returns the location of the converted volume.
    async fn convert(&self, request: &ConvertRequest) -> Result<String, ConvertError>;
}

/// One run of the external preprocessing tool.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub job_id: JobId,
    pub subject_id: String,
    pub volume_ref: String,
    pub license_ref: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("tool exited with code {exit_code}: {message}")]
    ToolFailed { exit_code: i64, message: String },

    #[error("tool produced no usable output: {0}")]
    NoOutput(String),

    #[error("license file not found at {0}")]
    LicenseMissing(String),

    #[error("tool exceeded {0:?}")]
    Timeout(Duration),

    #[error("tool run was cancelled")]
    Cancelled,

    #[error("tool runtime unavailable: {0}")]
    Unavailable(String),
}

/// Long-running external preprocessing tool, isolated per invocation.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Returns the location of the tool's output directory. Implementations
    /// must stop the tool and discard partial output when `cancel` fires or
    /// the invocation timeout elapses.
    async fn run_external_tool(
        &self,
        invocation: &ToolInvocation,
        cancel: CancelSignal,
    ) -> Result<String, PreprocessError>;
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("inference failed: {0}")]
    Inference(String),

    #[error("model returned an unusable value: {0}")]
    InvalidOutput(String),
}

/// Brain age inference over a preprocessed output directory.
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, output_dir_ref: &str) -> Result<Prediction, PredictError>;
}

/// Message handed to a [`Notifier`].
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Completed {
        job_id: JobId,
        subject_id: String,
        result: PredictionResult,
    },
    Failed {
        job_id: JobId,
        subject_id: String,
        category: String,
    },
}

impl Notification {
    pub fn job_id(&self) -> JobId {
        match self {
            Notification::Completed { job_id, .. } | Notification::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn subject(&self) -> String {
        match self {
            Notification::Completed { subject_id, .. } => {
                format!("[NeuroChron] Brain Age Analysis Complete - {subject_id}")
            }
            Notification::Failed { subject_id, .. } => {
                format!("[NeuroChron] Brain Age Analysis Failed - {subject_id}")
            }
        }
    }

    pub fn body(&self) -> String {
        match self {
            Notification::Completed {
                job_id,
                subject_id,
                result,
            } => format!(
                "Your brain age analysis has finished.\n\n\
                 Job: {job_id}\n\
                 Subject: {subject_id}\n\
                 Predicted brain age: {:.2}\n\
                 Chronological age: {}\n\
                 Brain age gap: {:+.2}\n\n\
                 {}\n",
                result.predicted_age,
                result.chronological_age,
                result.brain_age_gap,
                result.interpretation,
            ),
            Notification::Failed {
                job_id,
                subject_id,
                category,
            } => format!(
                "Your brain age analysis could not be completed.\n\n\
                 Job: {job_id}\n\
                 Subject: {subject_id}\n\
                 Reason: {category}\n"
            ),
        }
    }
}

#[derive(Debug, Error)]
#[error("delivery failed: {message}")]
pub struct DeliveryError {
    pub message: String,
    /// Whether another attempt may succeed.
    pub transient: bool,
}

impl DeliveryError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Best-effort delivery of results to the submitter.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, contact: &str, notification: &Notification) -> Result<(), DeliveryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Prediction;

    #[test]
    fn completed_notice_renders_result() {
        let result = PredictionResult::new(
            &Prediction {
                predicted_age: 81.51,
                explanation_ref: None,
            },
            45,
        );
        let notice = Notification::Completed {
            job_id: JobId::new(),
            subject_id: "subj_0123456789ab".to_string(),
            result,
        };
        assert_eq!(
            notice.subject(),
            "[NeuroChron] Brain Age Analysis Complete - subj_0123456789ab"
        );
        let body = notice.body();
        assert!(body.contains("Predicted brain age: 81.51"));
        assert!(body.contains("Brain age gap: +36.51"));
        assert!(body.contains("36.5 years older"));
    }

    #[test]
    fn failed_notice_carries_category_only() {
        let notice = Notification::Failed {
            job_id: JobId::new(),
            subject_id: "subj_0123456789ab".to_string(),
            category: "Preprocessing took too long".to_string(),
        };
        assert!(notice.subject().contains("Failed"));
        assert!(notice.body().contains("Reason: Preprocessing took too long"));
    }
}

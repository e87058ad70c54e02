//! Stage outcomes and the failure taxonomy.
//!
//! Retry policy is decided from data: every failed stage run yields a
//! [`StageFailure`] tagged with its cause and whether it may be retried.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::job::Prediction;

/// Why a stage failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCause {
    /// Uploaded file could not be decoded.
    InvalidFormat,
    /// Transient storage error.
    #[serde(rename = "IOFailure")]
    IoFailure,
    /// Preprocessing tool exited non-zero or produced no usable output.
    ExternalToolError,
    /// The preprocessing tool's license file is absent.
    LicenseMissing,
    /// The preprocessing tool exceeded its wall-clock ceiling.
    Timeout,
    /// Numeric or model error during inference.
    InferenceError,
    /// Notification could not be delivered.
    DeliveryError,
    /// The job was cancelled.
    Cancelled,
}

impl FailureCause {
    /// Client-facing description of the failure category.
    pub fn category(self) -> &'static str {
        match self {
            FailureCause::InvalidFormat => "The uploaded file is not a readable MRI scan",
            FailureCause::IoFailure => "The uploaded file could not be read from storage",
            FailureCause::ExternalToolError => "Preprocessing of the scan failed",
            FailureCause::LicenseMissing => "The preprocessing service is not configured",
            FailureCause::Timeout => "Preprocessing took too long",
            FailureCause::InferenceError => "Brain age prediction failed",
            FailureCause::DeliveryError => "The result notification could not be delivered",
            FailureCause::Cancelled => "The job was cancelled",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCause::InvalidFormat => "InvalidFormat",
            FailureCause::IoFailure => "IOFailure",
            FailureCause::ExternalToolError => "ExternalToolError",
            FailureCause::LicenseMissing => "LicenseMissing",
            FailureCause::Timeout => "Timeout",
            FailureCause::InferenceError => "InferenceError",
            FailureCause::DeliveryError => "DeliveryError",
            FailureCause::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed stage run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageFailure {
    pub cause: FailureCause,
    pub retryable: bool,
    pub message: String,
}

impl StageFailure {
    pub fn retryable(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            retryable: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.cause, self.message)
    }
}

/// What a successful stage produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Location of a durable artifact (converted volume, tool output directory).
    Artifact(String),
    /// Model output together with the reference recorded for the stage.
    Prediction {
        artifact: String,
        prediction: Prediction,
    },
    /// The notification was accepted for delivery.
    Delivered,
}

impl StageOutput {
    pub fn artifact(&self) -> Option<&str> {
        match self {
            StageOutput::Artifact(location) => Some(location),
            StageOutput::Prediction { artifact, .. } => Some(artifact),
            StageOutput::Delivered => None,
        }
    }
}

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageResult {
    Success(StageOutput),
    Failure(StageFailure),
}

impl StageResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StageResult::Success(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_serializes_as_variant_name() {
        let json = serde_json::to_string(&FailureCause::Timeout).unwrap();
        assert_eq!(json, "\"Timeout\"");
        let parsed: FailureCause = serde_json::from_str("\"LicenseMissing\"").unwrap();
        assert_eq!(parsed, FailureCause::LicenseMissing);
    }

    #[test]
    fn io_failure_wire_name_matches_display() {
        let json = serde_json::to_string(&FailureCause::IoFailure).unwrap();
        assert_eq!(json, format!("\"{}\"", FailureCause::IoFailure.as_str()));
        let parsed: FailureCause = serde_json::from_str("\"IOFailure\"").unwrap();
        assert_eq!(parsed, FailureCause::IoFailure);
    }

    #[test]
    fn constructors_set_retryability() {
        assert!(StageFailure::retryable(FailureCause::IoFailure, "disk").retryable);
        assert!(!StageFailure::fatal(FailureCause::InvalidFormat, "garbage").retryable);
    }

    #[test]
    fn only_artifact_outputs_carry_locations() {
        assert_eq!(
            StageOutput::Artifact("/work/out".into()).artifact(),
            Some("/work/out")
        );
        assert_eq!(StageOutput::Delivered.artifact(), None);
    }
}

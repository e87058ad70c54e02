//! Core domain types and traits for the NeuroChron brain-age pipeline.
//!
//! This crate contains:
//! - Job identifiers, the job record and its lifecycle states
//! - Stage outcomes and the failure taxonomy
//! - Invariant-checked job updates
//! - Collaborator, stage runner and job store traits
//! - Cooperative cancellation

pub mod cancel;
pub mod collaborator;
pub mod error;
pub mod failure;
pub mod id;
pub mod job;
pub mod runner;
pub mod store;
pub mod update;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use error::{Error, Result};
pub use failure::{FailureCause, StageFailure, StageOutput, StageResult};
pub use id::JobId;
pub use job::{
    Job, JobError, JobStatus, NewJob, NotificationStatus, Prediction, PredictionResult, Stage,
    StageFailureRecord,
};
pub use runner::StageRunner;
pub use store::{JobFilter, JobStore};
pub use update::{JobUpdate, Precondition};

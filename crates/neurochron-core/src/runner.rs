//! Uniform stage runner contract.

use async_trait::async_trait;

use crate::cancel::CancelSignal;
use crate::failure::StageResult;
use crate::job::{Job, Stage};

/// Runs one pipeline stage for a job.
///
/// Runners never touch the job store. They read what they need from the
/// job snapshot and report the outcome; the orchestrator persists it.
#[async_trait]
pub trait StageRunner: Send + Sync {
    fn stage(&self) -> Stage;

    async fn run(&self, job: &Job, cancel: CancelSignal) -> StageResult;
}

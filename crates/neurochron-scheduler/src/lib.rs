//! Pipeline orchestration and job dispatch for NeuroChron.
//!
//! A fixed pool of workers claims jobs from the store under a renewable
//! lease and drives each through its stages. Stage failures are retried
//! per stage with exponential backoff before the job is failed.

pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod orchestrator;
pub mod retry;
pub mod runners;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatcher::Dispatcher;
pub use error::{SchedulerError, SchedulerResult};
pub use orchestrator::{DriveOutcome, Orchestrator};
pub use retry::{Decision, RetryPolicy};
pub use runners::{ConvertRunner, NotifyRunner, PredictRunner, PreprocessRunner, RunnerSet};
pub use worker::{WorkerConfig, WorkerPool};

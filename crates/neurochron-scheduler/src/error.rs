use neurochron_core::Error as CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] CoreError),

    #[error("no runner registered for stage {0}")]
    MissingRunner(neurochron_core::Stage),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

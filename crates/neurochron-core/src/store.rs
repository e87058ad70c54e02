//! Job store abstraction.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::job::{Job, JobStatus};
use crate::update::{JobUpdate, Precondition};
use crate::{JobId, Result};

/// Listing filter. Results are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
    }
}

/// Durable record of every submitted job.
///
/// `update` is atomic: readers see either the whole update or none of it.
/// Errors follow [`crate::Error`]: `NotFound` for unknown ids, `Conflict`
/// when the precondition does not hold, `Immutable` for terminal jobs and
/// `Unavailable` when the backing store cannot be reached.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: Job) -> Result<JobId>;

    async fn get(&self, id: JobId) -> Result<Job>;

    /// Apply `update` if `precondition` holds, returning the new record.
    async fn update(&self, id: JobId, precondition: &Precondition, update: JobUpdate)
    -> Result<Job>;

    /// Lazily stream jobs matching `filter`.
    fn list(&self, filter: JobFilter) -> BoxStream<'_, Result<Job>>;

    /// Lease the oldest non-terminal job without a live lease.
    async fn claim_next(&self, owner: &str, ttl: Duration) -> Result<Option<Job>>;

    /// Extend `owner`'s lease. Returns false once the lease is lost.
    async fn renew_lease(&self, id: JobId, owner: &str, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, id: JobId, owner: &str) -> Result<()>;
}

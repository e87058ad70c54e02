//! In-process job store.
//!
//! Not durable. Used by tests and for single-process development runs
//! without a database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::RwLock;

use neurochron_core::{
    Error, Job, JobFilter, JobId, JobStore, JobUpdate, Precondition, Result,
};

#[derive(Debug, Default, Clone)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a record without any checks. Tests use this to stage
    /// crash-recovery states such as an expired lease.
    #[cfg(any(test, feature = "testing"))]
    pub async fn put_raw(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<JobId> {
        let id = job.id;
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(Error::Conflict(format!("job {id} already exists")));
        }
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {id}")))
    }

    async fn update(
        &self,
        id: JobId,
        precondition: &Precondition,
        update: JobUpdate,
    ) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        // Apply to a copy so a rejected update leaves the record untouched.
        let mut next = job.clone();
        next.apply(precondition, update, Utc::now())?;
        *job = next.clone();
        Ok(next)
    }

    fn list(&self, filter: JobFilter) -> BoxStream<'_, Result<Job>> {
        stream::once(async move {
            let mut jobs: Vec<Job> = self
                .jobs
                .read()
                .await
                .values()
                .filter(|job| filter.matches(job))
                .cloned()
                .collect();
            jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            if let Some(limit) = filter.limit {
                jobs.truncate(limit);
            }
            stream::iter(jobs.into_iter().map(Ok))
        })
        .flatten()
        .boxed()
    }

    async fn claim_next(&self, owner: &str, ttl: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let next = jobs
            .values_mut()
            .filter(|job| job.is_claimable(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let Some(job) = next else {
            return Ok(None);
        };
        Ok(job.try_acquire_lease(owner, ttl, now).then(|| job.clone()))
    }

    async fn renew_lease(&self, id: JobId, owner: &str, ttl: Duration) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {id}")))?;
        Ok(job.renew_lease(owner, ttl, Utc::now()))
    }

    async fn release_lease(&self, id: JobId, owner: &str) -> Result<()> {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.release_lease(owner);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use neurochron_core::{JobStatus, NewJob};

    fn new_job(contact: &str) -> Job {
        Job::new(NewJob {
            input_reference: "/uploads/scan.dcm".to_string(),
            chronological_age: 45,
            contact: contact.to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = InMemoryJobStore::new();
        let job = new_job("a@example.com");
        let id = store.create(job.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store.get(JobId::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn rejected_update_leaves_record_untouched() {
        let store = InMemoryJobStore::new();
        let id = store.create(new_job("a@example.com")).await.unwrap();
        let before = store.get(id).await.unwrap();

        let err = store
            .update(
                id,
                &Precondition::status(JobStatus::Converting),
                JobUpdate::new().status(JobStatus::Preprocessing),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(store.get(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn claims_fifo_and_never_twice() {
        let store = InMemoryJobStore::new();
        let first = new_job("first@example.com");
        let mut second = new_job("second@example.com");
        second.created_at = first.created_at + chrono::TimeDelta::milliseconds(5);
        store.create(second.clone()).await.unwrap();
        store.create(first.clone()).await.unwrap();

        let ttl = Duration::from_secs(60);
        let a = store.claim_next("w1", ttl).await.unwrap().unwrap();
        let b = store.claim_next("w2", ttl).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert!(store.claim_next("w3", ttl).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_claimable_again() {
        let store = InMemoryJobStore::new();
        let mut job = new_job("a@example.com");
        job.lease_owner = Some("dead-worker".to_string());
        job.lease_expires_at = Some(Utc::now() - chrono::TimeDelta::seconds(1));
        store.put_raw(job.clone()).await;

        let claimed = store
            .claim_next("w1", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.lease_owner.as_deref(), Some("w1"));
        assert!(
            !store
                .renew_lease(job.id, "dead-worker", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn list_is_newest_first_with_filter_and_limit() {
        let store = InMemoryJobStore::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut job = new_job(&format!("{i}@example.com"));
            job.created_at = base + chrono::TimeDelta::seconds(i);
            ids.push(store.create(job).await.unwrap());
        }
        store
            .update(
                ids[0],
                &Precondition::status(JobStatus::Queued),
                JobUpdate::new().status(JobStatus::Converting),
            )
            .await
            .unwrap();

        let all: Vec<Job> = store.list(JobFilter::default()).try_collect().await.unwrap();
        let order: Vec<JobId> = all.iter().map(|j| j.id).collect();
        assert_eq!(order, vec![ids[2], ids[1], ids[0]]);

        let queued: Vec<Job> = store
            .list(JobFilter {
                status: Some(JobStatus::Queued),
                limit: Some(1),
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, ids[2]);
    }
}

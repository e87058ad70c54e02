//! PostgreSQL job store.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::PgPool;
use sqlx::types::Json;

use neurochron_core::{
    Job, JobError, JobFilter, JobId, JobStatus, JobStore, JobUpdate, NotificationStatus,
    Precondition, Prediction, PredictionResult, Result, Stage, StageFailureRecord,
};

use crate::{DbError, DbResult};

/// A job row as stored in the `jobs` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: uuid::Uuid,
    pub status: String,
    pub chronological_age: i32,
    pub contact: String,
    pub input_reference: String,
    pub subject_id: String,
    pub stage_artifacts: Json<BTreeMap<Stage, String>>,
    pub prediction: Option<Json<Prediction>>,
    pub result: Option<Json<PredictionResult>>,
    pub error: Option<Json<JobError>>,
    pub last_failure: Option<Json<StageFailureRecord>>,
    pub attempts: i32,
    pub timeout_attempts: i32,
    pub notification: Option<Json<NotificationStatus>>,
    pub cancel_requested: bool,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Job> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|_| DbError::Corrupt(format!("job {} has status {}", row.id, row.status)))?;
        let chronological_age = u32::try_from(row.chronological_age).map_err(|_| {
            DbError::Corrupt(format!("job {} has age {}", row.id, row.chronological_age))
        })?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            status,
            chronological_age,
            contact: row.contact,
            input_reference: row.input_reference,
            subject_id: row.subject_id,
            stage_artifacts: row.stage_artifacts.0,
            prediction: row.prediction.map(|p| p.0),
            result: row.result.map(|r| r.0),
            error: row.error.map(|e| e.0),
            last_failure: row.last_failure.map(|f| f.0),
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            timeout_attempts: u32::try_from(row.timeout_attempts).unwrap_or(0),
            notification: row.notification.map(|n| n.0),
            cancel_requested: row.cancel_requested,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
        })
    }
}

/// PostgreSQL implementation of [`JobStore`].
///
/// Updates run in a transaction that locks the row, checks the
/// precondition against the locked copy and writes the whole record back,
/// so readers never observe a half-applied transition.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(&self, job: &Job) -> DbResult<JobId> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, status, chronological_age, contact, input_reference, subject_id,
                stage_artifacts, attempts, cancel_requested, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(job.chronological_age as i32)
        .bind(&job.contact)
        .bind(&job.input_reference)
        .bind(&job.subject_id)
        .bind(Json(&job.stage_artifacts))
        .bind(job.attempts as i32)
        .bind(job.cancel_requested)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let conflict = neurochron_core::Error::Conflict(format!("job {} already exists", job.id));
            return Err(conflict.into());
        }
        Ok(job.id)
    }

    async fn fetch(&self, id: JobId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        Job::try_from(row)
    }

    async fn apply_update(
        &self,
        id: JobId,
        precondition: &Precondition,
        update: JobUpdate,
    ) -> DbResult<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {id}")))?;
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut *tx)
            .await?;

        let mut job = Job::try_from(row)?;
        job.apply(precondition, update, now)?;

        sqlx::query(
            r#"
            UPDATE jobs SET
                status = $2,
                stage_artifacts = $3,
                prediction = $4,
                result = $5,
                error = $6,
                last_failure = $7,
                attempts = $8,
                notification = $9,
                cancel_requested = $10,
                lease_owner = $11,
                lease_expires_at = $12,
                updated_at = $13,
                finished_at = $14,
                timeout_attempts = $15
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(Json(&job.stage_artifacts))
        .bind(job.prediction.as_ref().map(Json))
        .bind(job.result.as_ref().map(Json))
        .bind(job.error.as_ref().map(Json))
        .bind(job.last_failure.as_ref().map(Json))
        .bind(job.attempts as i32)
        .bind(job.notification.as_ref().map(Json))
        .bind(job.cancel_requested)
        .bind(job.lease_owner.as_deref())
        .bind(job.lease_expires_at)
        .bind(job.updated_at)
        .bind(job.finished_at)
        .bind(job.timeout_attempts as i32)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// Claim the oldest active job whose lease is free or expired.
    /// Uses SKIP LOCKED so concurrent claimers never block on each other.
    async fn claim(&self, owner: &str, ttl: Duration) -> DbResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET lease_owner = $1, lease_expires_at = NOW() + make_interval(secs => $2)
            WHERE id = (
                SELECT id FROM jobs
                WHERE status NOT IN ('COMPLETED', 'FAILED')
                  AND (lease_expires_at IS NULL OR lease_expires_at <= NOW())
                ORDER BY created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        let job = row.map(Job::try_from).transpose()?;
        if let Some(job) = &job {
            tracing::debug!(job_id = %job.id, owner, status = %job.status, "claimed job lease");
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: Job) -> Result<JobId> {
        Ok(self.insert(&job).await?)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        Ok(self.fetch(id).await?)
    }

    async fn update(
        &self,
        id: JobId,
        precondition: &Precondition,
        update: JobUpdate,
    ) -> Result<Job> {
        Ok(self.apply_update(id, precondition, update).await?)
    }

    fn list(&self, filter: JobFilter) -> BoxStream<'_, Result<Job>> {
        let limit = filter.limit.map(|l| l as i64);
        sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(limit)
        .fetch(&self.pool)
        .map(|row| -> Result<Job> {
            let row = row.map_err(DbError::from)?;
            Ok(Job::try_from(row)?)
        })
        .boxed()
    }

    async fn claim_next(&self, owner: &str, ttl: Duration) -> Result<Option<Job>> {
        Ok(self.claim(owner, ttl).await?)
    }

    async fn renew_lease(&self, id: JobId, owner: &str, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1
              AND lease_owner = $2
              AND lease_expires_at > NOW()
              AND status NOT IN ('COMPLETED', 'FAILED')
            "#,
        )
        .bind(id.as_uuid())
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, id: JobId, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET lease_owner = NULL, lease_expires_at = NULL WHERE id = $1 AND lease_owner = $2",
        )
        .bind(id.as_uuid())
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}

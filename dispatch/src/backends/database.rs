//! SQL-backed queue on SQLite.
//!
//! One row per job in `dispatch_jobs`. A claim is a single
//! `UPDATE ... RETURNING` that stamps a fresh lease token on the oldest ready
//! row, so two workers can never hold the same job. The token is the handle.

use crate::{
    config::ConnectionConfig,
    jobs::{Job, JobHandle, LeasedJob, QueueName},
    Error, Result,
};
use chrono::Utc;
use nanoid::nanoid;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::{str::FromStr, time::Duration};
use tracing::{debug, instrument, warn};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS dispatch_jobs (
        id             TEXT PRIMARY KEY,
        queue          TEXT NOT NULL,
        body           BLOB NOT NULL,
        attempts       INTEGER NOT NULL DEFAULT 0,
        available_at   INTEGER NOT NULL,
        reserved_until INTEGER NULL,
        lease          TEXT NULL UNIQUE,
        created_at     INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS dispatch_jobs_ready
        ON dispatch_jobs (queue, available_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dispatch_failed_jobs (
        id        TEXT PRIMARY KEY,
        queue     TEXT NOT NULL,
        body      BLOB NOT NULL,
        failed_at INTEGER NOT NULL
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct Backend {
    pool: SqlitePool,
    queue: QueueName,
    visibility_timeout: Duration,
}

impl Backend {
    /// Opens the pool and creates the tables if needed. Fails with
    /// `BackendUnavailable` when the database cannot be opened.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let url = config.require_url()?;
        let options = SqliteConnectOptions::from_str(url)?;
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            // every connection to `:memory:` would otherwise see its own database
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await?;
        Self::with_pool(pool, config.queue_name(), config.visibility_timeout()).await
    }

    pub async fn with_pool(
        pool: SqlitePool,
        queue: QueueName,
        visibility_timeout: Duration,
    ) -> Result<Self> {
        for statement in SCHEMA.iter() {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            queue,
            visibility_timeout,
        })
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait::async_trait]
impl super::Backend for Backend {
    fn name(&self) -> &'static str {
        "database"
    }

    #[instrument(skip(self), fields(queue = %self.queue))]
    async fn enqueue(&self, mut job: Job, delay: Duration) -> Result<JobHandle> {
        job.delay_by(delay)?;
        let body = job.to_bytes()?;
        sqlx::query(
            r#"
            INSERT INTO dispatch_jobs (id, queue, body, attempts, available_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(job.id().as_str())
        .bind(self.queue.as_str())
        .bind(body)
        .bind(i64::from(job.attempts()))
        .bind(job.available_at().timestamp_millis())
        .bind(job.created_at().timestamp_millis())
        .execute(&self.pool)
        .await?;
        debug!("stored job {}", job.id());
        Ok(JobHandle::new(job.id().as_str()))
    }

    #[instrument(skip(self), fields(queue = %self.queue))]
    async fn dequeue(&self) -> Result<Option<LeasedJob>> {
        let now = Utc::now().timestamp_millis();
        let lease = nanoid!();
        let row = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET reserved_until = ?1, lease = ?2
            WHERE id = (
                SELECT id FROM dispatch_jobs
                WHERE queue = ?3
                  AND available_at <= ?4
                  AND (reserved_until IS NULL OR reserved_until <= ?4)
                ORDER BY available_at, created_at
                LIMIT 1
            )
            RETURNING body
            "#,
        )
        .bind(now.saturating_add(millis(self.visibility_timeout)))
        .bind(&lease)
        .bind(self.queue.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let body: Vec<u8> = row.try_get("body")?;
                Ok(Some(LeasedJob {
                    job: Job::from_bytes(&body)?,
                    handle: JobHandle::new(lease),
                }))
            }
            None => Ok(None),
        }
    }

    async fn ack(&self, handle: &JobHandle) -> Result<()> {
        let deleted = sqlx::query("DELETE FROM dispatch_jobs WHERE lease = ?1")
            .bind(handle.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(Error::HandleExpired(handle.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %self.queue))]
    async fn release(&self, handle: &JobHandle, delay: Duration) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT body FROM dispatch_jobs WHERE lease = ?1")
            .bind(handle.as_str())
            .fetch_optional(&mut *tx)
            .await?;
        let body: Vec<u8> = match row {
            Some(row) => row.try_get("body")?,
            None => return Err(Error::HandleExpired(handle.to_string())),
        };

        let mut job = Job::from_bytes(&body)?;
        let affected = if job.record_attempt() {
            warn!("job {} exhausted {} attempts", job.id(), job.max_attempts());
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO dispatch_failed_jobs (id, queue, body, failed_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )
            .bind(job.id().as_str())
            .bind(self.queue.as_str())
            .bind(job.to_bytes()?)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM dispatch_jobs WHERE lease = ?1")
                .bind(handle.as_str())
                .execute(&mut *tx)
                .await?
                .rows_affected()
        } else {
            job.delay_by(delay)?;
            sqlx::query(
                r#"
                UPDATE dispatch_jobs
                SET body = ?1, attempts = ?2, available_at = ?3, reserved_until = NULL, lease = NULL
                WHERE lease = ?4
                "#,
            )
            .bind(job.to_bytes()?)
            .bind(i64::from(job.attempts()))
            .bind(job.available_at().timestamp_millis())
            .bind(handle.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            return Err(Error::HandleExpired(handle.to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT body FROM dispatch_failed_jobs WHERE queue = ?1 ORDER BY failed_at",
        )
        .bind(self.queue.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let body: Vec<u8> = row.try_get("body")?;
                Job::from_bytes(&body)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Backend as _;

    async fn backend(visibility_timeout: Duration) -> Backend {
        let config = ConnectionConfig::new("database")
            .with_url("sqlite::memory:")
            .with_queue("reports")
            .with_visibility_timeout(visibility_timeout);
        Backend::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn claims_oldest_ready_job() {
        let backend = backend(Duration::from_secs(60)).await;
        let first = Job::new("a", Vec::new());
        let second = Job::new("b", Vec::new());
        backend.enqueue(first.clone(), Duration::ZERO).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        backend.enqueue(second, Duration::ZERO).await.unwrap();

        let leased = backend.dequeue().await.unwrap().unwrap();
        assert_eq!(leased.job.id(), first.id());
    }

    #[tokio::test]
    async fn leased_job_is_invisible_until_timeout() {
        let backend = backend(Duration::from_secs(60)).await;
        backend
            .enqueue(Job::new("a", Vec::new()), Duration::ZERO)
            .await
            .unwrap();
        assert!(backend.dequeue().await.unwrap().is_some());
        assert!(backend.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaimed_lease_cannot_be_acked() {
        let backend = backend(Duration::ZERO).await;
        backend
            .enqueue(Job::new("a", Vec::new()), Duration::ZERO)
            .await
            .unwrap();
        let first = backend.dequeue().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = backend.dequeue().await.unwrap().unwrap();

        assert!(matches!(
            backend.ack(&first.handle).await,
            Err(Error::HandleExpired(_))
        ));
        backend.ack(&second.handle).await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_file_is_backend_unavailable() {
        let mut config = ConnectionConfig::new("database")
            .with_url("sqlite:///nonexistent-dispatch-dir/jobs.db");
        config.connect_timeout_ms = 200;
        let err = Backend::connect(&config).await.unwrap_err();
        assert_eq!(err.kind(), "backend_unavailable");
    }
}

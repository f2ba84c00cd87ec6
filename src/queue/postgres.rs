//! PostgreSQL queue store
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so concurrent workers never take the
//! same row. Each queue is meant to be worked by one process: at startup
//! `recover_active` requeues every active row, including rows another live
//! process would still be running.

use super::job::{Job, JobId, JobState, RecurringSchedule};
use super::store::{QueueSnapshot, QueueStore};
use crate::config::DatabaseConfig;
use crate::error::{RebalancerError, RebalancerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info};

const JOB_COLUMNS: &str = "id, queue, name, group_key, payload, attempts, max_attempts, \
     backoff_base_ms, state, run_at, last_error, schedule_name, schedule_interval_ms, created_at";

/// Durable store backed by the `queue_jobs` table
pub struct PgQueueStore {
    pool: PgPool,
}

impl PgQueueStore {
    pub async fn new(config: &DatabaseConfig) -> RebalancerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RebalancerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_jobs (
                id UUID PRIMARY KEY,
                seq BIGSERIAL,
                queue VARCHAR(64) NOT NULL,
                name VARCHAR(128) NOT NULL,
                group_key VARCHAR(128),
                payload JSONB NOT NULL,
                attempts INT NOT NULL DEFAULT 0,
                max_attempts INT NOT NULL,
                backoff_base_ms BIGINT NOT NULL,
                state VARCHAR(20) NOT NULL,
                run_at TIMESTAMPTZ NOT NULL,
                last_error TEXT,
                schedule_name VARCHAR(128),
                schedule_interval_ms BIGINT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_jobs_due
            ON queue_jobs (queue, state, run_at, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_jobs_schedule
            ON queue_jobs (queue, schedule_name)
            WHERE schedule_name IS NOT NULL AND state IN ('queued', 'active')
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Queue store migrations complete");
        Ok(())
    }

    /// Shared with the rebalance ledger
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Health check
    pub async fn health_check(&self) -> RebalancerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(&self, job: &Job, on_conflict: &str) -> RebalancerResult<u64> {
        let (schedule_name, schedule_interval) = match &job.schedule {
            Some(s) => (Some(s.name.clone()), Some(s.interval_ms as i64)),
            None => (None, None),
        };

        let query = format!(
            "INSERT INTO queue_jobs ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) {}",
            JOB_COLUMNS, on_conflict
        );

        let result = sqlx::query(&query)
            .bind(job.id)
            .bind(&job.queue)
            .bind(&job.name)
            .bind(&job.group_key)
            .bind(&job.payload)
            .bind(job.attempts as i32)
            .bind(job.max_attempts as i32)
            .bind(job.backoff_base_ms as i64)
            .bind(job.state.as_str())
            .bind(job.run_at)
            .bind(&job.last_error)
            .bind(schedule_name)
            .bind(schedule_interval)
            .bind(job.created_at)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

fn job_from_row(row: &PgRow) -> RebalancerResult<Job> {
    let schedule = match (
        row.try_get::<Option<String>, _>("schedule_name")?,
        row.try_get::<Option<i64>, _>("schedule_interval_ms")?,
    ) {
        (Some(name), Some(interval_ms)) => Some(RecurringSchedule {
            name,
            interval_ms: interval_ms as u64,
        }),
        _ => None,
    };

    Ok(Job {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        name: row.try_get("name")?,
        group_key: row.try_get("group_key")?,
        payload: row.try_get("payload")?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts")? as u32,
        backoff_base_ms: row.try_get::<i64, _>("backoff_base_ms")? as u64,
        state: JobState::parse(row.try_get::<&str, _>("state")?)?,
        run_at: row.try_get("run_at")?,
        last_error: row.try_get("last_error")?,
        schedule,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl QueueStore for PgQueueStore {
    async fn push(&self, job: Job) -> RebalancerResult<()> {
        self.insert(&job, "").await?;
        debug!("Stored job {} ({}) on {}", job.id, job.name, job.queue);
        Ok(())
    }

    async fn push_recurring(&self, job: Job) -> RebalancerResult<Job> {
        let schedule = job.schedule.as_ref().ok_or_else(|| {
            RebalancerError::Internal(format!("job {} has no schedule", job.id))
        })?;

        let inserted = self
            .insert(
                &job,
                "ON CONFLICT (queue, schedule_name) \
                 WHERE schedule_name IS NOT NULL AND state IN ('queued', 'active') DO NOTHING",
            )
            .await?;
        if inserted == 1 {
            return Ok(job);
        }

        let query = format!(
            "SELECT {} FROM queue_jobs WHERE queue = $1 AND schedule_name = $2 \
             AND state IN ('queued', 'active') LIMIT 1",
            JOB_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(&job.queue)
            .bind(&schedule.name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => job_from_row(&row),
            // existing instance finished between the insert and the read
            None => {
                self.insert(&job, "").await?;
                Ok(job)
            }
        }
    }

    async fn fetch_next(&self, queue: &str, now: DateTime<Utc>) -> RebalancerResult<Option<Job>> {
        let query = format!(
            r#"
            UPDATE queue_jobs SET state = 'active', updated_at = NOW()
            WHERE id = (
                SELECT id FROM queue_jobs
                WHERE queue = $1 AND state = 'queued' AND run_at <= $2
                ORDER BY run_at, seq
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(queue)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, id: JobId) -> RebalancerResult<()> {
        sqlx::query(
            "UPDATE queue_jobs SET state = 'completed', updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: JobId,
        run_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<String>,
    ) -> RebalancerResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'queued', run_at = $2, attempts = $3,
                last_error = COALESCE($4, last_error), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(attempts as i32)
        .bind(last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, id: JobId, attempts: u32, error: String) -> RebalancerResult<()> {
        sqlx::query(
            r#"
            UPDATE queue_jobs
            SET state = 'dead', attempts = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts as i32)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_schedule(&self, queue: &str, name: &str) -> RebalancerResult<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM queue_jobs WHERE queue = $1 AND schedule_name = $2 AND state = 'queued'",
        )
        .bind(queue)
        .bind(name)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let detached = sqlx::query(
            r#"
            UPDATE queue_jobs SET schedule_name = NULL, schedule_interval_ms = NULL
            WHERE queue = $1 AND schedule_name = $2 AND state = 'active'
            "#,
        )
        .bind(queue)
        .bind(name)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        Ok(deleted + detached > 0)
    }

    async fn get(&self, id: JobId) -> RebalancerResult<Option<Job>> {
        let query = format!("SELECT {} FROM queue_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn snapshot(&self, queue: &str, now: DateTime<Utc>) -> RebalancerResult<QueueSnapshot> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'queued' AND run_at <= $2) AS ready,
                COUNT(*) FILTER (WHERE state = 'queued' AND run_at > $2) AS deferred,
                COUNT(*) FILTER (WHERE state = 'active') AS active,
                COUNT(*) FILTER (WHERE state = 'completed') AS completed,
                COUNT(*) FILTER (WHERE state = 'dead') AS dead
            FROM queue_jobs WHERE queue = $1
            "#,
        )
        .bind(queue)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueSnapshot {
            ready: row.try_get::<i64, _>("ready")? as u64,
            deferred: row.try_get::<i64, _>("deferred")? as u64,
            active: row.try_get::<i64, _>("active")? as u64,
            completed: row.try_get::<i64, _>("completed")? as u64,
            dead: row.try_get::<i64, _>("dead")? as u64,
        })
    }

    async fn dead_jobs(&self, queue: &str, limit: usize) -> RebalancerResult<Vec<Job>> {
        let query = format!(
            "SELECT {} FROM queue_jobs WHERE queue = $1 AND state = 'dead' \
             ORDER BY updated_at DESC LIMIT $2",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(queue)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn recover_active(&self, queue: &str) -> RebalancerResult<u64> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET state = 'queued', updated_at = NOW() \
             WHERE queue = $1 AND state = 'active'",
        )
        .bind(queue)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    //! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`

    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn store() -> Arc<PgQueueStore> {
        let config = DatabaseConfig {
            url: std::env::var("DATABASE_URL").expect("DATABASE_URL"),
            max_connections: 8,
            min_connections: 1,
        };
        let store = PgQueueStore::new(&config).await.unwrap();
        store.run_migrations().await.unwrap();
        Arc::new(store)
    }

    /// Tests share one database, so each gets its own queue
    fn queue_name() -> String {
        format!("test-{}", Uuid::new_v4().simple())
    }

    fn job(queue: &str, run_at: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            name: "sample".to_string(),
            group_key: Some("chain:10".to_string()),
            payload: json!({ "n": 1 }),
            attempts: 0,
            max_attempts: 3,
            backoff_base_ms: 10,
            state: JobState::Queued,
            run_at,
            last_error: None,
            schedule: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_concurrent_fetches_never_claim_the_same_job() {
        let store = store().await;
        let queue = queue_name();
        let now = Utc::now();
        for _ in 0..20 {
            store.push(job(&queue, now)).await.unwrap();
        }

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Some(job) = store.fetch_next(&queue, now).await.unwrap() {
                        assert_eq!(job.state, JobState::Active);
                        claimed.push(job.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for worker in futures::future::join_all(workers).await {
            all.extend(worker.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
        assert_eq!(store.snapshot(&queue, now).await.unwrap().active, 20);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_reregistering_a_schedule_does_not_duplicate_it() {
        let store = store().await;
        let queue = queue_name();
        let mut template = job(&queue, Utc::now());
        template.schedule = Some(RecurringSchedule {
            name: "check-balances-0x01".to_string(),
            interval_ms: 60_000,
        });

        let first = store.push_recurring(template.clone()).await.unwrap();
        let mut again = template.clone();
        again.id = Uuid::new_v4();
        let second = store.push_recurring(again).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.snapshot(&queue, Utc::now()).await.unwrap().ready, 1);

        // an active instance still blocks a second one
        store.fetch_next(&queue, Utc::now()).await.unwrap().unwrap();
        let mut third = template.clone();
        third.id = Uuid::new_v4();
        assert_eq!(store.push_recurring(third).await.unwrap().id, first.id);

        assert!(store.remove_schedule(&queue, "check-balances-0x01").await.unwrap());
        let detached = store.get(first.id).await.unwrap().unwrap();
        assert!(detached.schedule.is_none());
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_reschedule_defers_and_keeps_last_error() {
        let store = store().await;
        let queue = queue_name();
        let now = Utc::now();
        let j = job(&queue, now);
        store.push(j.clone()).await.unwrap();
        store.fetch_next(&queue, now).await.unwrap().unwrap();

        let later = now + chrono::Duration::seconds(60);
        store.reschedule(j.id, later, 1, Some("boom".to_string())).await.unwrap();

        let stored = store.get(j.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert!(store.fetch_next(&queue, now).await.unwrap().is_none());

        // a delay passes no error and must not erase the previous one
        store.reschedule(j.id, now, 1, None).await.unwrap();
        let stored = store.fetch_next(&queue, now).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("boom"));

        store.mark_dead(j.id, 3, "gave up".to_string()).await.unwrap();
        let dead = store.dead_jobs(&queue, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_recover_active_requeues_claimed_jobs() {
        let store = store().await;
        let queue = queue_name();
        let now = Utc::now();
        store.push(job(&queue, now)).await.unwrap();
        let claimed = store.fetch_next(&queue, now).await.unwrap().unwrap();

        assert_eq!(store.recover_active(&queue).await.unwrap(), 1);
        let again = store.fetch_next(&queue, now).await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.group_key.as_deref(), Some("chain:10"));
        assert_eq!(again.payload, json!({ "n": 1 }));
    }
}

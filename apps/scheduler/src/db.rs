use crate::types::{Job, JobStatus};
use alloy::primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Acquire, PgPool, Row, postgres::PgRow};
use thiserror::Error;
use userop::UserOperation;
use uuid::Uuid;

const MIGRATIONS: &[(i32, &str)] = &[(1, include_str!("../db/migrations/0001_jobs.sql"))];

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("a job for this (account, chain, on-chain job id) already exists")]
    Conflict,
    #[error("job not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Persistent job store. Jobs are created once, flipped to a terminal status
/// by the scheduler's sync step, and never deleted.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Registration entry point; the scheduler itself never creates jobs.
    #[allow(dead_code)]
    async fn create(&self, job: &Job) -> Result<(), RepoError>;

    /// All jobs still in `queuing`.
    async fn find_active(&self) -> Result<Vec<Job>, RepoError>;

    #[allow(dead_code)]
    async fn find_by_id(&self, id: Uuid) -> Result<Job, RepoError>;

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), RepoError>;
}

pub struct JobsDb {
    pool: PgPool,
}

impl JobsDb {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .context("connect DATABASE_URL")?;
        Ok(Self { pool })
    }

    /// Applies pending migrations. An advisory lock serializes concurrent
    /// process startups; the lock is session-scoped, so the whole sequence
    /// runs on one connection.
    pub async fn migrate(&self) -> Result<()> {
        const MIGRATION_LOCK_KEY: i64 = 0x4A4F_4253_4348_4544; // "JOBSCHED"
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquire connection for migrations")?;

        sqlx::query("select pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .context("acquire migration lock")?;

        let res: Result<()> = async {
            // Bootstrap creates the migration table itself, so it always runs
            // (every statement is idempotent).
            sqlx::raw_sql(MIGRATIONS[0].1)
                .execute(&mut *conn)
                .await
                .context("apply schema bootstrap (v1)")?;
            sqlx::query(
                "insert into schema_migrations(version) values ($1) \
                 on conflict (version) do nothing",
            )
            .bind(MIGRATIONS[0].0)
            .execute(&mut *conn)
            .await
            .context("record schema bootstrap (v1)")?;

            for (version, sql) in &MIGRATIONS[1..] {
                let applied: Option<i32> =
                    sqlx::query_scalar("select version from schema_migrations where version = $1")
                        .bind(*version)
                        .fetch_optional(&mut *conn)
                        .await
                        .context("read schema_migrations")?;
                if applied.is_some() {
                    continue;
                }

                let mut tx = conn.begin().await.context("begin migration tx")?;
                sqlx::raw_sql(sql)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("apply migration v{version}"))?;
                sqlx::query("insert into schema_migrations(version) values ($1)")
                    .bind(*version)
                    .execute(&mut *tx)
                    .await
                    .context("insert schema_migrations")?;
                tx.commit().await.context("commit migration tx")?;
            }
            Ok(())
        }
        .await;

        let _ = sqlx::query("select pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await;

        res
    }
}

fn row_to_job(row: &PgRow) -> Result<Job, RepoError> {
    let id: Uuid = row.try_get("id").map_err(unavailable)?;
    let account: Vec<u8> = row.try_get("account_address").map_err(unavailable)?;
    let chain_id: i64 = row.try_get("chain_id").map_err(unavailable)?;
    let on_chain_job_id: i64 = row.try_get("on_chain_job_id").map_err(unavailable)?;
    let entry_point: Vec<u8> = row.try_get("entry_point").map_err(unavailable)?;
    let user_op: sqlx::types::Json<UserOperation> =
        row.try_get("user_operation").map_err(unavailable)?;
    let status: String = row.try_get("status").map_err(unavailable)?;
    let error_message: Option<String> = row.try_get("error_message").map_err(unavailable)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(unavailable)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(unavailable)?;

    if account.len() != 20 || entry_point.len() != 20 {
        return Err(RepoError::Unavailable(anyhow::anyhow!(
            "job {id} has a malformed address column"
        )));
    }

    Ok(Job {
        id,
        account: Address::from_slice(&account),
        chain_id: chain_id as u64,
        on_chain_job_id,
        entry_point: Address::from_slice(&entry_point),
        user_op: user_op.0,
        status: JobStatus::parse(&status).map_err(RepoError::Unavailable)?,
        error_message,
        created_at,
        updated_at,
    })
}

fn unavailable(err: sqlx::Error) -> RepoError {
    RepoError::Unavailable(anyhow::Error::new(err))
}

const SELECT_JOB: &str = "select id, account_address, chain_id, on_chain_job_id, entry_point, \
     user_operation, status, error_message, created_at, updated_at from jobs";

#[async_trait]
impl JobRepository for JobsDb {
    async fn create(&self, job: &Job) -> Result<(), RepoError> {
        let res = sqlx::query(
            "insert into jobs (id, account_address, chain_id, on_chain_job_id, entry_point, \
             user_operation, status, error_message) \
             values ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(job.id)
        .bind(job.account.as_slice())
        .bind(job.chain_id as i64)
        .bind(job.on_chain_job_id)
        .bind(job.entry_point.as_slice())
        .bind(sqlx::types::Json(&job.user_op))
        .bind(job.status.as_db_str())
        .bind(job.error_message.as_deref())
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                Err(RepoError::Conflict)
            }
            Err(err) => Err(unavailable(err)),
        }
    }

    async fn find_active(&self) -> Result<Vec<Job>, RepoError> {
        let rows = sqlx::query(&format!("{SELECT_JOB} where status = 'queuing'"))
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(row_to_job).collect()
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Job, RepoError> {
        let row = sqlx::query(&format!("{SELECT_JOB} where id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        match row {
            Some(row) => row_to_job(&row),
            None => Err(RepoError::NotFound),
        }
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
    ) -> Result<(), RepoError> {
        // The `status = 'queuing'` guard keeps terminal statuses final: a
        // repeated sync write (cache eviction failed last tick) is a no-op.
        sqlx::query(
            "update jobs set status = $2, error_message = $3, updated_at = now() \
             where id = $1 and status = 'queuing'",
        )
        .bind(id)
        .bind(status.as_db_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }
}

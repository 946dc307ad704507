//! PostgreSQL implementation of the schwartz job queue's [`ShardDriver`].
//!
//! # Features
//!
//! - The lease protocol's sole write primitive, `grab_if_unchanged`, is a
//!   single conditional `UPDATE ... WHERE jobid = $1 AND grabbed_until = $2`.
//!   Postgres's row-level locking during the UPDATE guarantees only one
//!   competing worker observes `rows_affected = 1`.
//! - `(funcid, uniqkey)` uniqueness is enforced by a real unique index:
//!   a collision surfaces as `SchwartzError::ConstraintViolated`, which
//!   `Client::insert` turns into "return the existing handle."
//! - `replace_with` uses a single `sqlx::Transaction` spanning every insert
//!   plus the original row's removal.
//!
//! # Database schema
//!
//! See `migrations/20260101000000_schwartz_core.sql` for the full DDL.
//! Run it with [`PgShardDriver::migrate`], which wraps `sqlx::migrate!`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use schwartz_postgres::PgShardDriver;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/schwartz").await?;
//! let driver = PgShardDriver::new(pool);
//! driver.migrate().await?;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use schwartz_core::{
    ErrorRow, ExitStatusRow, GrabUpdate, JobOrder, JobQuery, JobRow, SchwartzError,
    SchwartzResult, ShardDriver,
};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

/// A PostgreSQL-backed shard. Clone is cheap: the pool is reference
/// counted internally by `sqlx`.
#[derive(Clone)]
pub struct PgShardDriver {
    pool: PgPool,
}

impl PgShardDriver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool, for callers that need direct access
    /// (health checks, custom reporting queries).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run this crate's bundled migrations against the pool's database.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        debug!("running schwartz-postgres migrations");
        sqlx::migrate!().run(&self.pool).await
    }
}

/// Map a raw `sqlx::Error` onto the core error taxonomy. Unique-key
/// violations become `ConstraintViolated`; anything that looks like lost
/// connectivity becomes `ConnectionLost`, which marks the shard unhealthy.
fn map_sqlx_err(err: sqlx::Error) -> SchwartzError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
            debug!(error = %db_err, "unique constraint violated");
            SchwartzError::ConstraintViolated(db_err.message().to_string())
        }
        sqlx::Error::PoolTimedOut => {
            warn!(error = %err, "pool checkout timed out");
            SchwartzError::Timeout(err.to_string())
        }
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            warn!(error = %err, "connection to shard lost");
            SchwartzError::ConnectionLost(err.to_string())
        }
        _ => {
            warn!(error = %err, "unclassified database error, treating as connection lost");
            SchwartzError::ConnectionLost(err.to_string())
        }
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> JobRow {
    JobRow {
        jobid: row.get("jobid"),
        funcid: row.get("funcid"),
        arg: row.get("arg"),
        uniqkey: row.get("uniqkey"),
        insert_time: row.get("insert_time"),
        run_after: row.get("run_after"),
        grabbed_until: row.get("grabbed_until"),
        priority: row.get("priority"),
        coalesce: row.get("coalesce"),
    }
}

fn row_to_error(row: &sqlx::postgres::PgRow) -> ErrorRow {
    ErrorRow {
        error_time: row.get("error_time"),
        jobid: row.get("jobid"),
        funcid: row.get("funcid"),
        message: row.get("message"),
    }
}

fn row_to_exit_status(row: &sqlx::postgres::PgRow) -> ExitStatusRow {
    ExitStatusRow {
        jobid: row.get("jobid"),
        funcid: row.get("funcid"),
        status: row.get("status"),
        completion_time: row.get("completion_time"),
        delete_after: row.get("delete_after"),
    }
}

const JOB_COLUMNS: &str =
    "jobid, funcid, arg, uniqkey, insert_time, run_after, grabbed_until, priority, coalesce";

#[async_trait]
impl ShardDriver for PgShardDriver {
    type Transaction = Transaction<'static, Postgres>;

    async fn begin(&self) -> SchwartzResult<Self::Transaction> {
        self.pool.begin().await.map_err(map_sqlx_err)
    }

    async fn commit(&self, txn: Self::Transaction) -> SchwartzResult<()> {
        txn.commit().await.map_err(map_sqlx_err)
    }

    async fn rollback(&self, txn: Self::Transaction) -> SchwartzResult<()> {
        txn.rollback().await.map_err(map_sqlx_err)
    }

    async fn intern_funcname(&self, funcname: &str) -> SchwartzResult<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO funcmap (funcname)
            VALUES ($1)
            ON CONFLICT (funcname) DO UPDATE SET funcname = EXCLUDED.funcname
            RETURNING funcid
            "#,
        )
        .bind(funcname)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.get("funcid"))
    }

    async fn resolve_funcname(&self, funcid: i64) -> SchwartzResult<Option<String>> {
        let row = sqlx::query("SELECT funcname FROM funcmap WHERE funcid = $1")
            .bind(funcid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.map(|r| r.get("funcname")))
    }

    async fn resolve_funcid(&self, funcname: &str) -> SchwartzResult<Option<i64>> {
        let row = sqlx::query("SELECT funcid FROM funcmap WHERE funcname = $1")
            .bind(funcname)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.map(|r| r.get("funcid")))
    }

    async fn insert_job(&self, row: &JobRow) -> SchwartzResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO job (funcid, arg, uniqkey, insert_time, run_after, grabbed_until, priority, coalesce)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING jobid
            "#,
        )
        .bind(row.funcid)
        .bind(&row.arg)
        .bind(&row.uniqkey)
        .bind(row.insert_time)
        .bind(row.run_after)
        .bind(row.grabbed_until)
        .bind(row.priority)
        .bind(&row.coalesce)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.get("jobid"))
    }

    async fn insert_job_txn(&self, txn: &mut Self::Transaction, row: &JobRow) -> SchwartzResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO job (funcid, arg, uniqkey, insert_time, run_after, grabbed_until, priority, coalesce)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING jobid
            "#,
        )
        .bind(row.funcid)
        .bind(&row.arg)
        .bind(&row.uniqkey)
        .bind(row.insert_time)
        .bind(row.run_after)
        .bind(row.grabbed_until)
        .bind(row.priority)
        .bind(&row.coalesce)
        .fetch_one(&mut **txn)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.get("jobid"))
    }

    async fn find_job(&self, jobid: i64) -> SchwartzResult<Option<JobRow>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM job WHERE jobid = $1"))
            .bind(jobid)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.as_ref().map(row_to_job))
    }

    async fn find_job_by_uniqkey(&self, funcid: i64, uniqkey: &str) -> SchwartzResult<Option<JobRow>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE funcid = $1 AND uniqkey = $2"
        ))
        .bind(funcid)
        .bind(uniqkey)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.as_ref().map(row_to_job))
    }

    async fn search_jobs(&self, query: &JobQuery) -> SchwartzResult<Vec<JobRow>> {
        let order_by = match query.order {
            JobOrder::PriorityDescJobIdAsc => "priority DESC, jobid ASC",
        };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE funcid = ANY($1) AND run_after <= $2 AND grabbed_until <= $3 \
             ORDER BY {order_by} LIMIT $4"
        );
        let rows = sqlx::query(&sql)
            .bind(&query.funcids)
            .bind(query.run_after_le)
            .bind(query.grabbed_until_le)
            .bind(query.limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn grab_if_unchanged(&self, update: &GrabUpdate) -> SchwartzResult<u64> {
        let result = sqlx::query(
            "UPDATE job SET grabbed_until = $1 WHERE jobid = $2 AND grabbed_until = $3",
        )
        .bind(update.new_grabbed_until)
        .bind(update.jobid)
        .bind(update.expected_grabbed_until)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn release_for_retry(&self, jobid: i64, run_after: i64) -> SchwartzResult<()> {
        sqlx::query("UPDATE job SET run_after = $1, grabbed_until = 0 WHERE jobid = $2")
            .bind(run_after)
            .bind(jobid)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn refresh_lease(
        &self,
        jobid: i64,
        expected_grabbed_until: i64,
        new_grabbed_until: i64,
    ) -> SchwartzResult<()> {
        let result = sqlx::query(
            "UPDATE job SET grabbed_until = $1 WHERE jobid = $2 AND grabbed_until = $3",
        )
        .bind(new_grabbed_until)
        .bind(jobid)
        .bind(expected_grabbed_until)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            warn!(jobid, "refresh_lease found no row with the expected grabbed_until");
            return Err(SchwartzError::LeaseLost {
                shard_id: "postgres".to_string(),
                jobid,
            });
        }
        Ok(())
    }

    async fn remove_job(&self, jobid: i64) -> SchwartzResult<()> {
        sqlx::query("DELETE FROM job WHERE jobid = $1")
            .bind(jobid)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn remove_job_txn(&self, txn: &mut Self::Transaction, jobid: i64) -> SchwartzResult<()> {
        sqlx::query("DELETE FROM job WHERE jobid = $1")
            .bind(jobid)
            .execute(&mut **txn)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn insert_error(&self, row: &ErrorRow) -> SchwartzResult<()> {
        sqlx::query("INSERT INTO error (error_time, jobid, funcid, message) VALUES ($1, $2, $3, $4)")
            .bind(row.error_time)
            .bind(row.jobid)
            .bind(row.funcid)
            .bind(&row.message)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn count_errors(&self, jobid: i64) -> SchwartzResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM error WHERE jobid = $1")
            .bind(jobid)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(row.get("n"))
    }

    async fn list_errors(&self, jobid: i64) -> SchwartzResult<Vec<ErrorRow>> {
        let rows = sqlx::query(
            "SELECT error_time, jobid, funcid, message FROM error WHERE jobid = $1 ORDER BY error_id ASC",
        )
        .bind(jobid)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.iter().map(row_to_error).collect())
    }

    async fn insert_exit_status(&self, row: &ExitStatusRow) -> SchwartzResult<()> {
        sqlx::query(
            r#"
            INSERT INTO exitstatus (jobid, funcid, status, completion_time, delete_after)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (jobid) DO UPDATE SET
                status = EXCLUDED.status,
                completion_time = EXCLUDED.completion_time,
                delete_after = EXCLUDED.delete_after
            "#,
        )
        .bind(row.jobid)
        .bind(row.funcid)
        .bind(row.status)
        .bind(row.completion_time)
        .bind(row.delete_after)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn insert_exit_status_txn(
        &self,
        txn: &mut Self::Transaction,
        row: &ExitStatusRow,
    ) -> SchwartzResult<()> {
        sqlx::query(
            r#"
            INSERT INTO exitstatus (jobid, funcid, status, completion_time, delete_after)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (jobid) DO UPDATE SET
                status = EXCLUDED.status,
                completion_time = EXCLUDED.completion_time,
                delete_after = EXCLUDED.delete_after
            "#,
        )
        .bind(row.jobid)
        .bind(row.funcid)
        .bind(row.status)
        .bind(row.completion_time)
        .bind(row.delete_after)
        .execute(&mut **txn)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn find_exit_status(&self, jobid: i64) -> SchwartzResult<Option<ExitStatusRow>> {
        let row = sqlx::query(
            "SELECT jobid, funcid, status, completion_time, delete_after FROM exitstatus WHERE jobid = $1",
        )
        .bind(jobid)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(row.as_ref().map(row_to_exit_status))
    }

    async fn sweep_exit_statuses(&self, now: i64) -> SchwartzResult<u64> {
        let result = sqlx::query("DELETE FROM exitstatus WHERE delete_after < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn list_jobs(&self, funcid: i64, limit: i64) -> SchwartzResult<Vec<JobRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE funcid = $1 ORDER BY insert_time DESC LIMIT $2"
        ))
        .bind(funcid)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(rows.iter().map(row_to_job).collect())
    }
}

/// Convenience constructor bundling pool creation and migration into one call.
pub async fn connect_and_migrate(database_url: &str) -> anyhow::Result<Arc<PgShardDriver>> {
    let pool = PgPool::connect(database_url).await?;
    let driver = PgShardDriver::new(pool);
    driver.migrate().await?;
    Ok(Arc::new(driver))
}

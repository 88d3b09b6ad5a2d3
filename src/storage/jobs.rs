//! Leased job queue atop the relational store.
//!
//! `claim_job` is a single atomic statement (an `UPDATE ... RETURNING`) so
//! two workers racing on the same queue can never both claim the same row —
//! SQLite serializes writers, and the `WHERE` clause's row selection and the
//! `SET` happen in one step.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::errors::StorageError;
use crate::ids;

use super::models::{Job, JobStatus, parse_json_column};

pub const DEFAULT_LEASE_SECS: i64 = 5 * 60;
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

pub struct CreateJob<'a> {
    pub queue: &'a str,
    pub job_type: &'a str,
    pub payload: Value,
    pub idempotency_key: &'a str,
    pub priority: i64,
    pub max_attempts: Option<i64>,
    pub run_id: Option<&'a str>,
    pub project_id: Option<&'a str>,
}

pub fn create_job(conn: &Connection, input: CreateJob<'_>) -> Result<Job, StorageError> {
    if let Some(existing) = get_job_by_idempotency_key(conn, input.idempotency_key)? {
        return Ok(existing);
    }

    let id = ids::job_id();
    let now = Utc::now();
    let inserted = conn.execute(
        "INSERT INTO jobs (
            id, queue, job_type, payload, idempotency_key, status, priority,
            attempts, max_attempts, run_id, project_id, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?11)
        ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            id,
            input.queue,
            input.job_type,
            input.payload.to_string(),
            input.idempotency_key,
            JobStatus::Queued.as_str(),
            input.priority,
            input.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            input.run_id,
            input.project_id,
            now.to_rfc3339(),
        ],
    )?;

    if inserted == 0 {
        return get_job_by_idempotency_key(conn, input.idempotency_key)?.ok_or(
            StorageError::NotFound {
                kind: "job",
                id: input.idempotency_key.to_string(),
            },
        );
    }

    get_job(conn, &id)?.ok_or(StorageError::NotFound { kind: "job", id })
}

/// Claims the top-priority queued row (or a `processing` row with an
/// expired lease) for `queue`, in one atomic statement. Returns `None` when
/// the queue is empty.
pub fn claim_job(
    conn: &Connection,
    queue: &str,
    worker_id: &str,
    lease_secs: i64,
) -> Result<Option<Job>, StorageError> {
    let now = Utc::now();
    let lease_expires = now + Duration::seconds(lease_secs);

    let claimed_id: Option<String> = conn
        .query_row(
            "UPDATE jobs SET
                status = ?1,
                claimed_by = ?2,
                claimed_at = ?3,
                lease_expires_at = ?4,
                attempts = attempts + 1
             WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ?5
                  AND (
                    status = ?6
                    OR (status = ?1 AND lease_expires_at < ?7)
                  )
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
             )
             RETURNING id",
            params![
                JobStatus::Processing.as_str(),
                worker_id,
                now.to_rfc3339(),
                lease_expires.to_rfc3339(),
                queue,
                JobStatus::Queued.as_str(),
                now.to_rfc3339(),
            ],
            |row| row.get(0),
        )
        .optional()?;

    match claimed_id {
        Some(id) => get_job(conn, &id),
        None => Ok(None),
    }
}

pub fn complete_job(conn: &Connection, job_id: &str) -> Result<(), StorageError> {
    let updated = conn.execute(
        "UPDATE jobs SET status = ?1 WHERE id = ?2 AND status = ?3",
        params![
            JobStatus::Completed.as_str(),
            job_id,
            JobStatus::Processing.as_str()
        ],
    )?;
    if updated == 0 {
        return Err(StorageError::NotFound {
            kind: "processing job",
            id: job_id.to_string(),
        });
    }
    Ok(())
}

/// `failJob`: dead-letters once `attempts >= maxAttempts`, else schedules a
/// retry `retryDelayMs` in the future and clears the lease.
pub fn fail_job(
    conn: &Connection,
    job_id: &str,
    error: &str,
    retry_delay_ms: i64,
) -> Result<JobStatus, StorageError> {
    let (attempts, max_attempts): (i64, i64) = conn.query_row(
        "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
        [job_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let status = if attempts >= max_attempts {
        JobStatus::Dead
    } else {
        JobStatus::Failed
    };

    let next_retry_at = if status == JobStatus::Failed {
        Some((Utc::now() + Duration::milliseconds(retry_delay_ms)).to_rfc3339())
    } else {
        None
    };

    conn.execute(
        "UPDATE jobs SET
            status = ?1, last_error = ?2, next_retry_at = ?3,
            claimed_by = NULL, claimed_at = NULL, lease_expires_at = NULL
         WHERE id = ?4",
        params![status.as_str(), error, next_retry_at, job_id],
    )?;

    Ok(status)
}

/// Only the current lease owner may renew.
pub fn renew_lease(
    conn: &Connection,
    job_id: &str,
    worker_id: &str,
    lease_secs: i64,
) -> Result<bool, StorageError> {
    let lease_expires = Utc::now() + Duration::seconds(lease_secs);
    let updated = conn.execute(
        "UPDATE jobs SET lease_expires_at = ?1
         WHERE id = ?2 AND claimed_by = ?3 AND status = ?4",
        params![
            lease_expires.to_rfc3339(),
            job_id,
            worker_id,
            JobStatus::Processing.as_str()
        ],
    )?;
    Ok(updated > 0)
}

pub fn find_retryable_jobs(conn: &Connection, queue: &str) -> Result<Vec<Job>, StorageError> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE queue = ?1 AND status = ?2 AND next_retry_at <= ?3",
    )?;
    let rows = stmt
        .query_map(
            params![queue, JobStatus::Failed.as_str(), now],
            row_to_job,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Promotes retryable `failed` jobs back to `queued`.
pub fn requeue_retryable_jobs(conn: &Connection, queue: &str) -> Result<usize, StorageError> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE jobs SET status = ?1, next_retry_at = NULL
         WHERE queue = ?2 AND status = ?3 AND next_retry_at <= ?4",
        params![JobStatus::Queued.as_str(), queue, JobStatus::Failed.as_str(), now],
    )?;
    Ok(updated)
}

pub fn find_expired_leases(conn: &Connection) -> Result<Vec<Job>, StorageError> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT * FROM jobs WHERE status = ?1 AND lease_expires_at < ?2",
    )?;
    let rows = stmt
        .query_map(params![JobStatus::Processing.as_str(), now], row_to_job)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_old_completed_jobs(
    conn: &Connection,
    older_than_days: i64,
) -> Result<usize, StorageError> {
    let cutoff = (Utc::now() - Duration::days(older_than_days)).to_rfc3339();
    let deleted = conn.execute(
        "DELETE FROM jobs WHERE status = ?1 AND created_at < ?2",
        params![JobStatus::Completed.as_str(), cutoff],
    )?;
    Ok(deleted)
}

pub fn get_job(conn: &Connection, id: &str) -> Result<Option<Job>, StorageError> {
    conn.query_row("SELECT * FROM jobs WHERE id = ?1", [id], row_to_job)
        .optional()
        .map_err(Into::into)
}

pub fn get_job_by_idempotency_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<Job>, StorageError> {
    conn.query_row(
        "SELECT * FROM jobs WHERE idempotency_key = ?1",
        [key],
        row_to_job,
    )
    .optional()
    .map_err(Into::into)
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    Ok(Job {
        id: row.get("id")?,
        queue: row.get("queue")?,
        job_type: row.get("job_type")?,
        payload: parse_json_column(&payload),
        idempotency_key: row.get("idempotency_key")?,
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Queued),
        priority: row.get("priority")?,
        claimed_by: row.get("claimed_by")?,
        claimed_at: parse_optional_ts(row, "claimed_at")?,
        lease_expires_at: parse_optional_ts(row, "lease_expires_at")?,
        attempts: row.get("attempts")?,
        max_attempts: row.get("max_attempts")?,
        last_error: row.get("last_error")?,
        next_retry_at: parse_optional_ts(row, "next_retry_at")?,
        run_id: row.get("run_id")?,
        project_id: row.get("project_id")?,
        created_at: parse_optional_ts(row, "created_at")?.unwrap_or_else(Utc::now),
    })
}

fn parse_optional_ts(
    row: &rusqlite::Row<'_>,
    col: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use serde_json::json;

    fn job_input(key: &str) -> CreateJob<'_> {
        CreateJob {
            queue: "runs",
            job_type: "advance_run",
            payload: json!({}),
            idempotency_key: key,
            priority: 0,
            max_attempts: None,
            run_id: None,
            project_id: None,
        }
    }

    #[test]
    fn create_job_is_idempotent_on_key() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        let a = create_job(&conn, job_input("k")).unwrap();
        let b = create_job(&conn, job_input("k")).unwrap();
        assert_eq!(a.id, b.id);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn claim_is_priority_then_fifo() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        create_job(
            &conn,
            CreateJob {
                priority: 0,
                ..job_input("low")
            },
        )
        .unwrap();
        create_job(
            &conn,
            CreateJob {
                priority: 5,
                ..job_input("high")
            },
        )
        .unwrap();

        let claimed = claim_job(&conn, "runs", "worker-1", DEFAULT_LEASE_SECS)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.idempotency_key, "high");
    }

    #[test]
    fn expired_lease_is_reclaimed_with_incremented_attempts() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        create_job(&conn, job_input("k")).unwrap();

        let claimed = claim_job(&conn, "runs", "worker-a", DEFAULT_LEASE_SECS)
            .unwrap()
            .unwrap();
        assert_eq!(claimed.attempts, 1);

        // Backdate the lease by 6 minutes.
        let past = (Utc::now() - Duration::minutes(6)).to_rfc3339();
        conn.execute(
            "UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2",
            params![past, claimed.id],
        )
        .unwrap();

        let reclaimed = claim_job(&conn, "runs", "worker-b", DEFAULT_LEASE_SECS)
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.claimed_by.as_deref(), Some("worker-b"));
    }

    #[test]
    fn claim_on_empty_queue_returns_none() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        assert!(claim_job(&conn, "runs", "worker-1", DEFAULT_LEASE_SECS)
            .unwrap()
            .is_none());
    }

    #[test]
    fn fail_job_dead_letters_after_max_attempts() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        create_job(
            &conn,
            CreateJob {
                max_attempts: Some(1),
                ..job_input("k")
            },
        )
        .unwrap();
        let claimed = claim_job(&conn, "runs", "worker-1", DEFAULT_LEASE_SECS)
            .unwrap()
            .unwrap();
        let status = fail_job(&conn, &claimed.id, "boom", 1000).unwrap();
        assert_eq!(status, JobStatus::Dead);
    }

    #[test]
    fn only_lease_owner_can_renew() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        create_job(&conn, job_input("k")).unwrap();
        let claimed = claim_job(&conn, "runs", "worker-a", DEFAULT_LEASE_SECS)
            .unwrap()
            .unwrap();
        assert!(!renew_lease(&conn, &claimed.id, "worker-b", 300).unwrap());
        assert!(renew_lease(&conn, &claimed.id, "worker-a", 300).unwrap());
    }
}

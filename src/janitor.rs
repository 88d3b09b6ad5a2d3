//! Periodic maintenance: the sweeps that keep leases, worktrees, ports, and
//! the stream/outbox tables from silently accumulating stale rows. One
//! `tokio::time::interval` per concern, run independently so a slow sweep
//! doesn't delay the others. Each sweep checks out its own connection from
//! the pool rather than holding one across ticks.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::errors::StorageError;
use crate::storage::{Db, jobs, worktrees};
use crate::{outbox, stream};

const LEASE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const WORKTREE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const PORT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const STREAM_PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOX_RESET_INTERVAL: Duration = Duration::from_secs(60);
const DEFERRED_FLUSH_INTERVAL: Duration = Duration::from_secs(5 * 60);

const STREAM_RETENTION_DAYS: i64 = 14;
const RETRY_QUEUE: &str = "runs";

/// Runs every sweep on its own interval until `cancel` fires. Returns once
/// all sweep tasks have wound down.
pub async fn run(db: Db, cancel: CancellationToken) {
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(sweep_loop(LEASE_SWEEP_INTERVAL, cancel.clone(), {
        let db = db.clone();
        move || {
            let db = db.clone();
            async move { requeue_expired_leases(&db.conn()?) }
        }
    }));

    tasks.spawn(sweep_loop(WORKTREE_SWEEP_INTERVAL, cancel.clone(), {
        let db = db.clone();
        move || {
            let db = db.clone();
            async move { sweep_orphaned_worktrees(&db.conn()?) }
        }
    }));

    tasks.spawn(sweep_loop(PORT_SWEEP_INTERVAL, cancel.clone(), {
        let db = db.clone();
        move || {
            let db = db.clone();
            async move { worktrees::release_expired_port_leases(&db.conn()?) }
        }
    }));

    tasks.spawn(sweep_loop(STREAM_PRUNE_INTERVAL, cancel.clone(), {
        let db = db.clone();
        move || {
            let db = db.clone();
            async move { stream::prune_stream_events(&db.conn()?, STREAM_RETENTION_DAYS) }
        }
    }));

    tasks.spawn(sweep_loop(RETRY_SWEEP_INTERVAL, cancel.clone(), {
        let db = db.clone();
        move || {
            let db = db.clone();
            async move { jobs::requeue_retryable_jobs(&db.conn()?, RETRY_QUEUE) }
        }
    }));

    tasks.spawn(sweep_loop(OUTBOX_RESET_INTERVAL, cancel.clone(), {
        let db = db.clone();
        move || {
            let db = db.clone();
            async move { outbox::reset_stalled_processing(&db.conn()?) }
        }
    }));

    tasks.spawn(sweep_loop(DEFERRED_FLUSH_INTERVAL, cancel.clone(), {
        let db = db.clone();
        move || {
            let db = db.clone();
            async move { outbox::flush_orphaned_deferred_events(&db.conn()?, outbox::MIRROR_DEFERRED_ORPHAN_SECS) }
        }
    }));

    while tasks.join_next().await.is_some() {}
}

/// Drives one sweep function on a fixed interval, tracing its result, until
/// `cancel` fires. Each sweep is independent: a failure logs and the loop
/// keeps ticking rather than taking the whole janitor down.
async fn sweep_loop<F, Fut>(period: Duration, cancel: CancellationToken, mut sweep: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<usize, StorageError>> + Send,
{
    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                match sweep().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(count = n, "janitor sweep reclaimed rows"),
                    Err(err) => tracing::warn!(%err, "janitor sweep failed"),
                }
            }
        }
    }
}

/// Requeues jobs whose lease expired without the worker completing or
/// failing them — a crashed worker's claim never gets released otherwise.
fn requeue_expired_leases(conn: &rusqlite::Connection) -> Result<usize, StorageError> {
    let expired = jobs::find_expired_leases(conn)?;
    let mut requeued = 0;
    for job in expired {
        jobs::fail_job(conn, &job.id, "lease expired", 0)?;
        requeued += 1;
    }
    Ok(requeued)
}

/// Marks `active` worktree rows `destroyed` (and releases their ports) when
/// their on-disk checkout is already gone, so a manually deleted or
/// partially cleaned-up directory doesn't strand the row forever.
fn sweep_orphaned_worktrees(conn: &rusqlite::Connection) -> Result<usize, StorageError> {
    let active = worktrees::list_active_worktrees(conn)?;
    let mut swept = 0;
    for worktree in active {
        if !Path::new(&worktree.path).exists() {
            worktrees::release_worktree_ports(conn, &worktree.id)?;
            worktrees::mark_destroyed(conn, &worktree.id)?;
            swept += 1;
        }
    }
    Ok(swept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::jobs::{CreateJob, claim_job};
    use chrono::{Duration as ChronoDuration, Utc};
    use rusqlite::params;
    use serde_json::json;

    #[test]
    fn requeue_expired_leases_fails_jobs_past_their_lease() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        jobs::create_job(
            &conn,
            CreateJob {
                queue: "runs",
                job_type: "run_step",
                payload: json!({}),
                idempotency_key: "k1",
                priority: 0,
                max_attempts: None,
                run_id: None,
                project_id: None,
            },
        )
        .unwrap();
        let claimed = claim_job(&conn, "runs", "worker-1", jobs::DEFAULT_LEASE_SECS).unwrap().unwrap();

        let past = (Utc::now() - ChronoDuration::minutes(10)).to_rfc3339();
        conn.execute("UPDATE jobs SET lease_expires_at = ?1 WHERE id = ?2", params![past, claimed.id]).unwrap();

        let requeued = requeue_expired_leases(&conn).unwrap();
        assert_eq!(requeued, 1);
    }

    #[test]
    fn sweep_orphaned_worktrees_marks_missing_directories_destroyed() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute("INSERT INTO users (id, email, created_at) VALUES ('usr_1','a@b.com', ?1)", [&now]).unwrap();
        conn.execute(
            "INSERT INTO projects (id, user_id, name, org_installation_id, port_range_start, port_range_end, created_at)
             VALUES ('proj_1','usr_1','p','inst', 3100, 3199, ?1)",
            [&now],
        ).unwrap();
        conn.execute("INSERT INTO repos (id, project_id, upstream_node_id, created_at) VALUES ('repo_1','proj_1','node', ?1)", [&now]).unwrap();
        conn.execute(
            "INSERT INTO worktrees (id, run_id, project_id, repo_id, path, branch, base_commit, status, created_at)
             VALUES ('wt_1','run_1','proj_1','repo_1','/nonexistent/path/for/test','b','abc','active', ?1)",
            [&now],
        ).unwrap();

        let swept = sweep_orphaned_worktrees(&conn).unwrap();
        assert_eq!(swept, 1);

        let status: String = conn.query_row("SELECT status FROM worktrees WHERE id = 'wt_1'", [], |r| r.get(0)).unwrap();
        assert_eq!(status, "destroyed");
    }
}

use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StorageError;
use crate::ids;

use super::models::{PortLease, Worktree, WorktreeStatus};

pub struct NewWorktree<'a> {
    pub run_id: &'a str,
    pub project_id: &'a str,
    pub repo_id: &'a str,
    pub path: &'a str,
    pub branch: &'a str,
    pub base_commit: &'a str,
}

pub fn get_worktree_for_run(
    conn: &Connection,
    run_id: &str,
) -> Result<Option<Worktree>, StorageError> {
    conn.query_row(
        "SELECT * FROM worktrees WHERE run_id = ?1 AND status = ?2",
        params![run_id, WorktreeStatus::Active.as_str()],
        row_to_worktree,
    )
    .optional()
    .map_err(Into::into)
}

pub fn insert_worktree(conn: &Connection, input: NewWorktree<'_>) -> Result<Worktree, StorageError> {
    let id = ids::worktree_id();
    conn.execute(
        "INSERT INTO worktrees (id, run_id, project_id, repo_id, path, branch, base_commit, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            input.run_id,
            input.project_id,
            input.repo_id,
            input.path,
            input.branch,
            input.base_commit,
            WorktreeStatus::Active.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    get_worktree_for_run(conn, input.run_id)?.ok_or(StorageError::NotFound {
        kind: "worktree",
        id,
    })
}

pub fn mark_destroyed(conn: &Connection, id: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE worktrees SET status = ?1 WHERE id = ?2",
        params![WorktreeStatus::Destroyed.as_str(), id],
    )?;
    Ok(())
}

pub fn update_heartbeat(conn: &Connection, id: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE worktrees SET last_heartbeat_at = ?1 WHERE id = ?2",
        params![Utc::now().to_rfc3339(), id],
    )?;
    Ok(())
}

pub fn list_active_worktrees(conn: &Connection) -> Result<Vec<Worktree>, StorageError> {
    let mut stmt =
        conn.prepare("SELECT * FROM worktrees WHERE status = ?1")?;
    let rows = stmt
        .query_map([WorktreeStatus::Active.as_str()], row_to_worktree)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lowest free port in `[range_start, range_end]` for `project_id`, among
/// `is_active=1` leases.
pub fn allocate_port(
    conn: &Connection,
    project_id: &str,
    worktree_id: &str,
    purpose: &str,
    range_start: i64,
    range_end: i64,
    lease_hours: i64,
) -> Result<Option<PortLease>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT port FROM port_leases WHERE project_id = ?1 AND is_active = 1",
    )?;
    let taken: std::collections::HashSet<i64> = stmt
        .query_map([project_id], |row| row.get(0))?
        .collect::<Result<_, _>>()?;

    let Some(port) = (range_start..=range_end).find(|p| !taken.contains(p)) else {
        return Ok(None);
    };

    let id = ids::port_lease_id();
    let expires_at = Utc::now() + Duration::hours(lease_hours);
    conn.execute(
        "INSERT INTO port_leases (id, project_id, worktree_id, port, purpose, is_active, expires_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
        params![
            id,
            project_id,
            worktree_id,
            port,
            purpose,
            expires_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(Some(PortLease {
        id,
        project_id: project_id.to_string(),
        worktree_id: worktree_id.to_string(),
        port,
        purpose: purpose.to_string(),
        is_active: true,
        expires_at,
        created_at: Utc::now(),
    }))
}

pub fn release_port(conn: &Connection, lease_id: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE port_leases SET is_active = 0 WHERE id = ?1",
        [lease_id],
    )?;
    Ok(())
}

pub fn release_worktree_ports(conn: &Connection, worktree_id: &str) -> Result<usize, StorageError> {
    let updated = conn.execute(
        "UPDATE port_leases SET is_active = 0 WHERE worktree_id = ?1 AND is_active = 1",
        [worktree_id],
    )?;
    Ok(updated)
}

pub fn release_expired_port_leases(conn: &Connection) -> Result<usize, StorageError> {
    let now = Utc::now().to_rfc3339();
    let updated = conn.execute(
        "UPDATE port_leases SET is_active = 0 WHERE is_active = 1 AND expires_at < ?1",
        [now],
    )?;
    Ok(updated)
}

fn row_to_worktree(row: &rusqlite::Row<'_>) -> rusqlite::Result<Worktree> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(Worktree {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        project_id: row.get("project_id")?,
        repo_id: row.get("repo_id")?,
        path: row.get("path")?,
        branch: row.get("branch")?,
        base_commit: row.get("base_commit")?,
        status: WorktreeStatus::from_str(&status).unwrap_or(WorktreeStatus::Active),
        last_heartbeat_at: parse_optional_ts(row, "last_heartbeat_at")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn parse_optional_ts(
    row: &rusqlite::Row<'_>,
    col: &str,
) -> rusqlite::Result<Option<chrono::DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    Ok(raw.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;

    #[test]
    fn port_allocation_picks_lowest_free_port() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        let a = allocate_port(&conn, "proj_1", "wt_1", "dev", 3100, 3105, 24)
            .unwrap()
            .unwrap();
        assert_eq!(a.port, 3100);
        let b = allocate_port(&conn, "proj_1", "wt_2", "dev", 3100, 3105, 24)
            .unwrap()
            .unwrap();
        assert_eq!(b.port, 3101);
        release_port(&conn, &a.id).unwrap();
        let c = allocate_port(&conn, "proj_1", "wt_3", "dev", 3100, 3105, 24)
            .unwrap()
            .unwrap();
        assert_eq!(c.port, 3100);
    }

    #[test]
    fn port_exhaustion_errors() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        allocate_port(&conn, "proj_1", "wt_1", "dev", 3100, 3100, 24).unwrap();
        let none = allocate_port(&conn, "proj_1", "wt_2", "dev", 3100, 3100, 24).unwrap();
        assert!(none.is_none());
    }
}

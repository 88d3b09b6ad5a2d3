use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StorageError;
use crate::ids;

use super::models::{Phase, Run, parse_json_column};

pub struct CreateRun<'a> {
    pub task_id: &'a str,
    pub project_id: &'a str,
    pub repo_id: &'a str,
    pub policy_set_id: &'a str,
    pub base_branch: &'a str,
}

/// Creates a run with `phase=pending`, a per-task monotonic `runNumber`, and
/// the deterministic branch name `conductor/run-<id>`. Also sets
/// `tasks.active_run_id` to the new run, since a task has at most one
/// active run at a time.
pub fn create_run(conn: &Connection, input: CreateRun<'_>) -> Result<Run, StorageError> {
    let id = ids::run_id();
    let now = Utc::now();

    let run_number: i64 = conn.query_row(
        "SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs WHERE task_id = ?1",
        [input.task_id],
        |row| row.get(0),
    )?;

    let branch = format!("conductor/run-{id}");

    conn.execute(
        "INSERT INTO runs (
            id, task_id, project_id, repo_id, policy_set_id, run_number,
            phase, step, base_branch, branch, next_sequence, last_event_sequence,
            plan_revisions, test_fix_attempts, review_rounds, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9, 1, 0, 0, 0, 0, ?10)",
        params![
            id,
            input.task_id,
            input.project_id,
            input.repo_id,
            input.policy_set_id,
            run_number,
            Phase::Pending.as_str(),
            input.base_branch,
            branch,
            now.to_rfc3339(),
        ],
    )?;

    conn.execute(
        "UPDATE tasks SET active_run_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![id, now.to_rfc3339(), input.task_id],
    )?;

    get_run(conn, &id)?.ok_or(StorageError::NotFound {
        kind: "run",
        id: id.clone(),
    })
}

pub fn get_run(conn: &Connection, id: &str) -> Result<Option<Run>, StorageError> {
    conn.query_row("SELECT * FROM runs WHERE id = ?1", [id], row_to_run)
        .optional()
        .map_err(Into::into)
}

/// Loads the run inside a write transaction under a row lock, so concurrent
/// `transitionPhase` callers on the same run serialize. Requires an
/// immediate-mode transaction on the caller's side.
pub fn get_run_for_update(conn: &Connection, id: &str) -> Result<Option<Run>, StorageError> {
    conn.query_row(
        "SELECT * FROM runs WHERE id = ?1",
        [id],
        row_to_run,
    )
    .optional()
    .map_err(Into::into)
}

/// Finds the run in `repo_id` carrying `pr_number`, used to resolve an
/// inbound `pull_request` webhook back to the run that opened it.
pub fn find_run_by_pr_number(conn: &Connection, repo_id: &str, pr_number: i64) -> Result<Option<Run>, StorageError> {
    conn.query_row(
        "SELECT * FROM runs WHERE repo_id = ?1 AND pr_number = ?2",
        params![repo_id, pr_number],
        row_to_run,
    )
    .optional()
    .map_err(Into::into)
}

pub fn set_phase(
    conn: &Connection,
    run_id: &str,
    phase: Phase,
    step: Option<&str>,
) -> Result<(), StorageError> {
    let completed_at = if phase.is_terminal() {
        Some(Utc::now().to_rfc3339())
    } else {
        None
    };
    conn.execute(
        "UPDATE runs SET phase = ?1, step = ?2, completed_at = COALESCE(?3, completed_at) WHERE id = ?4",
        params![phase.as_str(), step, completed_at, run_id],
    )?;
    Ok(())
}

pub fn set_blocked(
    conn: &Connection,
    run_id: &str,
    reason: &str,
    context: &serde_json::Value,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE runs SET phase = ?1, blocked_reason = ?2, blocked_context = ?3 WHERE id = ?4",
        params![
            Phase::Blocked.as_str(),
            reason,
            context.to_string(),
            run_id
        ],
    )?;
    Ok(())
}

/// Clears `task.active_run_id` if it still points at this run — a
/// non-owning back-pointer, so clearing it never cascades.
pub fn clear_active_run_if_matches(
    conn: &Connection,
    task_id: &str,
    run_id: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE tasks SET active_run_id = NULL WHERE id = ?1 AND active_run_id = ?2",
        params![task_id, run_id],
    )?;
    Ok(())
}

pub fn set_paused(conn: &Connection, run_id: &str, paused: bool) -> Result<(), StorageError> {
    let value = if paused {
        Some(Utc::now().to_rfc3339())
    } else {
        None
    };
    conn.execute(
        "UPDATE runs SET paused_at = ?1 WHERE id = ?2",
        params![value, run_id],
    )?;
    Ok(())
}

pub fn increment_plan_revisions(conn: &Connection, run_id: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE runs SET plan_revisions = plan_revisions + 1 WHERE id = ?1",
        [run_id],
    )?;
    Ok(())
}

pub fn increment_review_rounds(conn: &Connection, run_id: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE runs SET review_rounds = review_rounds + 1 WHERE id = ?1",
        [run_id],
    )?;
    Ok(())
}

pub fn increment_test_fix_attempts(conn: &Connection, run_id: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE runs SET test_fix_attempts = test_fix_attempts + 1 WHERE id = ?1",
        [run_id],
    )?;
    Ok(())
}

pub fn set_last_event_sequence(
    conn: &Connection,
    run_id: &str,
    sequence: i64,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE runs SET last_event_sequence = ?1 WHERE id = ?2",
        params![sequence, run_id],
    )?;
    Ok(())
}

pub fn set_pr_info(
    conn: &Connection,
    run_id: &str,
    pr_url: &str,
    pr_number: i64,
    pr_state: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE runs SET pr_url = ?1, pr_number = ?2, pr_state = ?3 WHERE id = ?4",
        params![pr_url, pr_number, pr_state, run_id],
    )?;
    Ok(())
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let phase_str: String = row.get("phase")?;
    let blocked_context: Option<String> = row.get("blocked_context")?;
    Ok(Run {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        project_id: row.get("project_id")?,
        repo_id: row.get("repo_id")?,
        policy_set_id: row.get("policy_set_id")?,
        run_number: row.get("run_number")?,
        phase: Phase::from_str(&phase_str).unwrap_or(Phase::Pending),
        step: row.get("step")?,
        base_branch: row.get("base_branch")?,
        branch: row.get("branch")?,
        next_sequence: row.get("next_sequence")?,
        last_event_sequence: row.get("last_event_sequence")?,
        paused_at: parse_ts(row, "paused_at")?,
        blocked_reason: row.get("blocked_reason")?,
        blocked_context: blocked_context.map(|s| parse_json_column(&s)),
        plan_revisions: row.get("plan_revisions")?,
        test_fix_attempts: row.get("test_fix_attempts")?,
        review_rounds: row.get("review_rounds")?,
        pr_url: row.get("pr_url")?,
        pr_number: row.get("pr_number")?,
        pr_state: row.get("pr_state")?,
        created_at: parse_ts(row, "created_at")?.unwrap_or_else(Utc::now),
        completed_at: parse_ts(row, "completed_at")?,
    })
}

fn parse_ts(
    row: &rusqlite::Row<'_>,
    col: &str,
) -> rusqlite::Result<Option<chrono::DateTime<Utc>>> {
    let raw: Option<String> = row.get(col)?;
    Ok(raw.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
}

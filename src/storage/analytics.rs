//! Read-only analytics queries. All queries are scoped via
//! `projects.user_id` so a user can only see their own projects' runs.

use rusqlite::Connection;
use serde::Serialize;

use crate::errors::StorageError;

#[derive(Debug, Serialize)]
pub struct Totals {
    pub total_runs: i64,
    pub completed_runs: i64,
    pub cancelled_runs: i64,
    pub success_rate: f64,
}

pub fn totals(conn: &Connection, user_id: &str) -> Result<Totals, StorageError> {
    let total_runs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runs r
         JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?;
    let completed_runs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runs r
         JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1 AND r.phase = 'completed'",
        [user_id],
        |row| row.get(0),
    )?;
    let cancelled_runs: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runs r
         JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1 AND r.phase = 'cancelled'",
        [user_id],
        |row| row.get(0),
    )?;
    let finished = completed_runs + cancelled_runs;
    let success_rate = if finished > 0 {
        completed_runs as f64 / finished as f64
    } else {
        0.0
    };
    Ok(Totals {
        total_runs,
        completed_runs,
        cancelled_runs,
        success_rate,
    })
}

/// Average wall-clock seconds between `createdAt` and `completedAt` for
/// completed runs.
pub fn average_cycle_time_seconds(conn: &Connection, user_id: &str) -> Result<f64, StorageError> {
    conn.query_row(
        "SELECT AVG(
            (julianday(r.completed_at) - julianday(r.created_at)) * 86400.0
         )
         FROM runs r JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1 AND r.phase = 'completed' AND r.completed_at IS NOT NULL",
        [user_id],
        |row| row.get::<_, Option<f64>>(0),
    )
    .map(|v| v.unwrap_or(0.0))
    .map_err(Into::into)
}

/// Average time spent in `awaiting_plan_approval`, computed by pairing each
/// run's entry phase-transition event (`to = awaiting_plan_approval`) with
/// its exit event (`from = awaiting_plan_approval`).
pub fn average_time_in_plan_approval_seconds(
    conn: &Connection,
    user_id: &str,
) -> Result<f64, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT e.run_id, e.payload, e.created_at
         FROM events e
         JOIN runs r ON r.id = e.run_id
         JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1 AND e.type = 'phase.transitioned'
         ORDER BY e.run_id, e.sequence ASC",
    )?;
    let rows: Vec<(String, String, String)> = stmt
        .query_map([user_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut entries: std::collections::HashMap<String, chrono::DateTime<chrono::Utc>> =
        std::collections::HashMap::new();
    let mut durations = Vec::new();

    for (run_id, payload, created_at) in rows {
        let payload: serde_json::Value = serde_json::from_str(&payload).unwrap_or_default();
        let to = payload.get("to").and_then(|v| v.as_str()).unwrap_or("");
        let from = payload.get("from").and_then(|v| v.as_str()).unwrap_or("");
        let ts = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now());

        if to == "awaiting_plan_approval" {
            entries.insert(run_id.clone(), ts);
        } else if from == "awaiting_plan_approval"
            && let Some(entered) = entries.remove(&run_id)
        {
            durations.push((ts - entered).num_seconds() as f64);
        }
    }

    if durations.is_empty() {
        Ok(0.0)
    } else {
        Ok(durations.iter().sum::<f64>() / durations.len() as f64)
    }
}

#[derive(Debug, Serialize)]
pub struct PhaseCount {
    pub phase: String,
    pub count: i64,
}

pub fn runs_by_phase(conn: &Connection, user_id: &str) -> Result<Vec<PhaseCount>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT r.phase, COUNT(*) FROM runs r
         JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1
         GROUP BY r.phase",
    )?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok(PhaseCount {
                phase: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Serialize)]
pub struct ProjectRunCount {
    pub project_id: String,
    pub run_count: i64,
}

pub fn top_projects_by_run_count(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<ProjectRunCount>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT r.project_id, COUNT(*) as n FROM runs r
         JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1
         GROUP BY r.project_id
         ORDER BY n DESC
         LIMIT 5",
    )?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok(ProjectRunCount {
                project_id: row.get(0)?,
                run_count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Serialize)]
pub struct DayCount {
    pub day: String,
    pub count: i64,
}

pub fn completion_histogram_7d(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<DayCount>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT date(r.completed_at) as day, COUNT(*) FROM runs r
         JOIN projects p ON p.id = r.project_id
         WHERE p.user_id = ?1 AND r.phase = 'completed'
           AND r.completed_at >= date('now', '-7 days')
         GROUP BY day
         ORDER BY day ASC",
    )?;
    let rows = stmt
        .query_map([user_id], |row| {
            Ok(DayCount {
                day: row.get(0)?,
                count: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StorageError;
use crate::ids;
use crate::redact::hash_canonical;

use super::models::Artifact;

pub fn create_artifact(
    conn: &Connection,
    run_id: &str,
    kind: &str,
    content: &str,
    validation_status: &str,
) -> Result<Artifact, StorageError> {
    let id = ids::artifact_id();
    let now = Utc::now();
    let checksum = hash_canonical(content);

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM artifacts WHERE run_id = ?1 AND kind = ?2",
        params![run_id, kind],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO artifacts (id, run_id, kind, version, content, checksum, validation_status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, run_id, kind, version, content, checksum, validation_status, now.to_rfc3339()],
    )?;

    get_artifact(conn, &id)?.ok_or(StorageError::NotFound { kind: "artifact", id })
}

pub fn get_artifact(conn: &Connection, id: &str) -> Result<Option<Artifact>, StorageError> {
    conn.query_row("SELECT * FROM artifacts WHERE id = ?1", [id], row_to_artifact)
        .optional()
        .map_err(Into::into)
}

pub fn latest_artifact(
    conn: &Connection,
    run_id: &str,
    kind: &str,
) -> Result<Option<Artifact>, StorageError> {
    conn.query_row(
        "SELECT * FROM artifacts WHERE run_id = ?1 AND kind = ?2 ORDER BY version DESC LIMIT 1",
        params![run_id, kind],
        row_to_artifact,
    )
    .optional()
    .map_err(Into::into)
}

fn row_to_artifact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Artifact> {
    let created_at: String = row.get("created_at")?;
    Ok(Artifact {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        kind: row.get("kind")?,
        version: row.get("version")?,
        content: row.get("content")?,
        checksum: row.get("checksum")?,
        validation_status: row.get("validation_status")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;

    #[test]
    fn artifact_versions_increment_per_kind() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (id, task_id, project_id, repo_id, policy_set_id, run_number, phase, base_branch, branch, created_at)
             VALUES ('run_1','task_1','proj_1','repo_1','default',1,'planning','main','b', ?1)",
            [&now],
        ).unwrap();

        let first = create_artifact(&conn, "run_1", "plan", "v1", "pending").unwrap();
        let second = create_artifact(&conn, "run_1", "plan", "v2", "pending").unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);

        let latest = latest_artifact(&conn, "run_1", "plan").unwrap().unwrap();
        assert_eq!(latest.content, "v2");
    }
}

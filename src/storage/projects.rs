//! Row-level storage for projects and repos. Both are created out of band
//! (via the upstream app install flow); this module only reads them.

use rusqlite::{Connection, OptionalExtension};

use crate::errors::StorageError;

use super::models::{Project, Repo};

pub fn get_project(conn: &Connection, id: &str) -> Result<Option<Project>, StorageError> {
    conn.query_row("SELECT * FROM projects WHERE id = ?1", [id], row_to_project)
        .optional()
        .map_err(Into::into)
}

pub fn get_repo(conn: &Connection, id: &str) -> Result<Option<Repo>, StorageError> {
    conn.query_row("SELECT * FROM repos WHERE id = ?1", [id], row_to_repo)
        .optional()
        .map_err(Into::into)
}

pub fn get_repo_by_upstream_node_id(conn: &Connection, node_id: &str) -> Result<Option<Repo>, StorageError> {
    conn.query_row(
        "SELECT * FROM repos WHERE upstream_node_id = ?1",
        [node_id],
        row_to_repo,
    )
    .optional()
    .map_err(Into::into)
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let created_at: String = row.get("created_at")?;
    Ok(Project {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        org_installation_id: row.get("org_installation_id")?,
        port_range_start: row.get("port_range_start")?,
        port_range_end: row.get("port_range_end")?,
        default_base_branch: row.get("default_base_branch")?,
        default_policy_set_id: row.get("default_policy_set_id")?,
        test_command: row.get("test_command")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

fn row_to_repo(row: &rusqlite::Row<'_>) -> rusqlite::Result<Repo> {
    let created_at: String = row.get("created_at")?;
    Ok(Repo {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        upstream_node_id: row.get("upstream_node_id")?,
        clone_url: row.get("clone_url")?,
        clone_path: row.get("clone_path")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
    })
}

//! Row-level storage for agent invocations/messages/tool invocations and
//! the seeded policy catalog. Higher-level tool-loop behavior lives in
//! [`crate::agent`].

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::errors::StorageError;
use crate::ids;

use super::models::{
    AgentInvocation, AgentMessage, InvocationStatus, ToolInvocation, ToolInvocationStatus,
    parse_json_column,
};

pub fn create_invocation(conn: &Connection, run_id: &str, step: &str) -> Result<AgentInvocation, StorageError> {
    let id = ids::invocation_id();
    conn.execute(
        "INSERT INTO agent_invocations (id, run_id, step, status, tokens_input, tokens_output, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, 0, ?5)",
        params![id, run_id, step, InvocationStatus::Running.as_str(), Utc::now().to_rfc3339()],
    )?;
    get_invocation(conn, &id)?.ok_or(StorageError::NotFound {
        kind: "agent invocation",
        id,
    })
}

pub fn get_invocation(conn: &Connection, id: &str) -> Result<Option<AgentInvocation>, StorageError> {
    conn.query_row("SELECT * FROM agent_invocations WHERE id = ?1", [id], row_to_invocation)
        .optional()
        .map_err(Into::into)
}

pub fn complete_invocation(
    conn: &Connection,
    id: &str,
    tokens_input: i64,
    tokens_output: i64,
    duration_ms: i64,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE agent_invocations
         SET status = ?1, tokens_input = ?2, tokens_output = ?3, duration_ms = ?4
         WHERE id = ?5",
        params![InvocationStatus::Completed.as_str(), tokens_input, tokens_output, duration_ms, id],
    )?;
    Ok(())
}

pub fn fail_invocation(conn: &Connection, id: &str, error: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE agent_invocations SET status = ?1, error = ?2 WHERE id = ?3",
        params![InvocationStatus::Failed.as_str(), error, id],
    )?;
    Ok(())
}

/// Appends a message at the next turn index for `invocation_id`.
pub fn append_message(
    conn: &Connection,
    invocation_id: &str,
    role: &str,
    content: &str,
) -> Result<AgentMessage, StorageError> {
    append_message_with_size(conn, invocation_id, role, content, content.len() as i64)
}

/// Appends a message recording an explicit `original_size_bytes`, used when
/// `content` has been replaced with a truncation stub but the true size of
/// the omitted body should still be recorded.
pub fn append_message_with_size(
    conn: &Connection,
    invocation_id: &str,
    role: &str,
    content: &str,
    original_size_bytes: i64,
) -> Result<AgentMessage, StorageError> {
    let next_turn: i64 = conn.query_row(
        "SELECT COALESCE(MAX(turn_index), -1) + 1 FROM agent_messages WHERE invocation_id = ?1",
        [invocation_id],
        |row| row.get(0),
    )?;
    let id = ids::message_id();
    conn.execute(
        "INSERT INTO agent_messages (id, invocation_id, turn_index, role, content, content_size_bytes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            invocation_id,
            next_turn,
            role,
            content,
            original_size_bytes,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(AgentMessage {
        id,
        invocation_id: invocation_id.to_string(),
        turn_index: next_turn,
        role: role.to_string(),
        content: content.to_string(),
        content_size_bytes: original_size_bytes,
        created_at: Utc::now(),
    })
}

pub fn list_messages(conn: &Connection, invocation_id: &str) -> Result<Vec<AgentMessage>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, invocation_id, turn_index, role, content, content_size_bytes, created_at
         FROM agent_messages WHERE invocation_id = ?1 ORDER BY turn_index ASC",
    )?;
    let rows = stmt
        .query_map([invocation_id], |row| {
            let created_at: String = row.get(6)?;
            Ok(AgentMessage {
                id: row.get(0)?,
                invocation_id: row.get(1)?,
                turn_index: row.get(2)?,
                role: row.get(3)?,
                content: row.get(4)?,
                content_size_bytes: row.get(5)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub struct NewToolInvocation<'a> {
    pub invocation_id: &'a str,
    pub tool_name: &'a str,
    pub args_redacted: Value,
    pub payload_hash: &'a str,
    pub policy_id: Option<&'a str>,
    pub status: ToolInvocationStatus,
}

pub fn create_tool_invocation(
    conn: &Connection,
    input: NewToolInvocation<'_>,
) -> Result<ToolInvocation, StorageError> {
    let id = ids::tool_invocation_id();
    conn.execute(
        "INSERT INTO tool_invocations (id, invocation_id, tool_name, args_redacted, payload_hash, policy_id, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            input.invocation_id,
            input.tool_name,
            input.args_redacted.to_string(),
            input.payload_hash,
            input.policy_id,
            input.status.as_str(),
            Utc::now().to_rfc3339(),
        ],
    )?;
    get_tool_invocation(conn, &id)?.ok_or(StorageError::NotFound {
        kind: "tool invocation",
        id,
    })
}

pub fn get_tool_invocation(conn: &Connection, id: &str) -> Result<Option<ToolInvocation>, StorageError> {
    conn.query_row("SELECT * FROM tool_invocations WHERE id = ?1", [id], row_to_tool_invocation)
        .optional()
        .map_err(Into::into)
}

pub fn complete_tool_invocation(conn: &Connection, id: &str, duration_ms: i64) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE tool_invocations SET status = ?1, duration_ms = ?2 WHERE id = ?3",
        params![ToolInvocationStatus::Completed.as_str(), duration_ms, id],
    )?;
    Ok(())
}

pub fn fail_tool_invocation(conn: &Connection, id: &str, error: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE tool_invocations SET status = ?1, error = ?2 WHERE id = ?3",
        params![ToolInvocationStatus::Failed.as_str(), error, id],
    )?;
    Ok(())
}

/// Idempotently seeds the policy catalog at startup (`INSERT OR IGNORE`).
pub fn seed_policies(conn: &Connection, policies: &[(&str, &str)]) -> Result<(), StorageError> {
    for (id, name) in policies {
        conn.execute(
            "INSERT INTO policies (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![id, name],
        )?;
    }
    Ok(())
}

fn row_to_invocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentInvocation> {
    let status: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    Ok(AgentInvocation {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        step: row.get("step")?,
        status: InvocationStatus::from_str(&status).unwrap_or(InvocationStatus::Running),
        tokens_input: row.get("tokens_input")?,
        tokens_output: row.get("tokens_output")?,
        duration_ms: row.get("duration_ms")?,
        error: row.get("error")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_tool_invocation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ToolInvocation> {
    let status: String = row.get("status")?;
    let args: String = row.get("args_redacted")?;
    let created_at: String = row.get("created_at")?;
    Ok(ToolInvocation {
        id: row.get("id")?,
        invocation_id: row.get("invocation_id")?,
        tool_name: row.get("tool_name")?,
        args_redacted: parse_json_column(&args),
        payload_hash: row.get("payload_hash")?,
        policy_id: row.get("policy_id")?,
        status: ToolInvocationStatus::from_str(&status).unwrap_or(ToolInvocationStatus::Started),
        duration_ms: row.get("duration_ms")?,
        error: row.get("error")?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use serde_json::json;

    fn seed_run(conn: &Connection) {
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (id, task_id, project_id, repo_id, policy_set_id, run_number, phase, base_branch, branch, created_at)
             VALUES ('run_1','task_1','proj_1','repo_1','default',1,'executing','main','b', ?1)",
            [&now],
        ).unwrap();
    }

    #[test]
    fn messages_append_in_turn_order() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        seed_run(&conn);
        let inv = create_invocation(&conn, "run_1", "implementer").unwrap();
        append_message(&conn, &inv.id, "system", "be careful").unwrap();
        let second = append_message(&conn, &inv.id, "user", "do the thing").unwrap();
        assert_eq!(second.turn_index, 1);
        let messages = list_messages(&conn, &inv.id).unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn tool_invocation_round_trips() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        seed_run(&conn);
        let inv = create_invocation(&conn, "run_1", "implementer").unwrap();
        let ti = create_tool_invocation(
            &conn,
            NewToolInvocation {
                invocation_id: &inv.id,
                tool_name: "write_file",
                args_redacted: json!({ "path": "a.txt" }),
                payload_hash: "sha256:cjson:v1:deadbeef",
                policy_id: Some("worktree_boundary"),
                status: ToolInvocationStatus::Started,
            },
        )
        .unwrap();
        complete_tool_invocation(&conn, &ti.id, 42).unwrap();
        let reloaded = get_tool_invocation(&conn, &ti.id).unwrap().unwrap();
        assert_eq!(reloaded.status, ToolInvocationStatus::Completed);
    }

    #[test]
    fn seeding_policies_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        seed_policies(&conn, &[("worktree_boundary", "Worktree boundary")]).unwrap();
        seed_policies(&conn, &[("worktree_boundary", "Worktree boundary")]).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM policies", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}

use chrono::Utc;
use rusqlite::{Connection, params};

use crate::errors::StorageError;
use crate::ids;
use crate::storage::models::OperatorActionKind;

pub struct NewOperatorAction<'a> {
    pub run_id: &'a str,
    pub action: OperatorActionKind,
    pub actor_id: &'a str,
    pub actor_type: &'a str,
    pub actor_display_name: Option<&'a str>,
    pub comment: Option<&'a str>,
    pub from_phase: Option<&'a str>,
    pub to_phase: Option<&'a str>,
}

pub fn insert_operator_action(
    conn: &Connection,
    input: NewOperatorAction<'_>,
) -> Result<String, StorageError> {
    let id = ids::operator_action_id();
    conn.execute(
        "INSERT INTO operator_actions (
            id, run_id, action, actor_id, actor_type, actor_display_name,
            comment, from_phase, to_phase, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            id,
            input.run_id,
            input.action.as_str(),
            input.actor_id,
            input.actor_type,
            input.actor_display_name,
            input.comment,
            input.from_phase,
            input.to_phase,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(id)
}

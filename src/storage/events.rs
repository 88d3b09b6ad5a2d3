use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::errors::StorageError;
use crate::ids;

use super::models::{Event, EventClass, EventSource, parse_json_column};

pub struct CreateEvent<'a> {
    pub project_id: &'a str,
    pub run_id: Option<&'a str>,
    pub event_type: &'a str,
    pub class: EventClass,
    pub payload: Value,
    pub idempotency_key: &'a str,
    pub source: EventSource,
}

/// `createEvent`: deduplicates on `idempotencyKey`, returning the existing
/// row unchanged if present; otherwise assigns the next per-run sequence
/// (via [`super::Db::next_sequence`]) and inserts. The caller is expected to
/// hold a transaction when the sequence bump must be atomic with other
/// writes (e.g. a phase transition).
pub fn create_event(conn: &Connection, input: CreateEvent<'_>) -> Result<Event, StorageError> {
    if let Some(existing) = get_event_by_idempotency_key(conn, input.idempotency_key)? {
        return Ok(existing);
    }

    let sequence = match input.run_id {
        Some(run_id) => Some(super::Db::next_sequence(conn, run_id)?),
        None => None,
    };

    let id = ids::event_id();
    let now = Utc::now();

    let inserted = conn.execute(
        "INSERT INTO events (
            id, project_id, run_id, type, class, payload, sequence,
            idempotency_key, source, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            id,
            input.project_id,
            input.run_id,
            input.event_type,
            input.class.as_str(),
            input.payload.to_string(),
            sequence,
            input.idempotency_key,
            input.source.as_str(),
            now.to_rfc3339(),
        ],
    )?;

    if inserted == 0 {
        // Lost a race with a concurrent insert of the same key.
        return get_event_by_idempotency_key(conn, input.idempotency_key)?.ok_or(
            StorageError::NotFound {
                kind: "event",
                id: input.idempotency_key.to_string(),
            },
        );
    }

    get_event(conn, &id)?.ok_or(StorageError::NotFound {
        kind: "event",
        id,
    })
}

pub fn get_event(conn: &Connection, id: &str) -> Result<Option<Event>, StorageError> {
    conn.query_row("SELECT * FROM events WHERE id = ?1", [id], row_to_event)
        .optional()
        .map_err(Into::into)
}

pub fn get_event_by_idempotency_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<Event>, StorageError> {
    conn.query_row(
        "SELECT * FROM events WHERE idempotency_key = ?1",
        [key],
        row_to_event,
    )
    .optional()
    .map_err(Into::into)
}

pub fn get_event_by_sequence(
    conn: &Connection,
    run_id: &str,
    sequence: i64,
) -> Result<Option<Event>, StorageError> {
    conn.query_row(
        "SELECT * FROM events WHERE run_id = ?1 AND sequence = ?2",
        params![run_id, sequence],
        row_to_event,
    )
    .optional()
    .map_err(Into::into)
}

pub fn list_events_for_run(conn: &Connection, run_id: &str) -> Result<Vec<Event>, StorageError> {
    let mut stmt =
        conn.prepare("SELECT * FROM events WHERE run_id = ?1 ORDER BY sequence ASC")?;
    let rows = stmt
        .query_map([run_id], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let class: String = row.get("class")?;
    let source: String = row.get("source")?;
    let payload: String = row.get("payload")?;
    let created_at: String = row.get("created_at")?;
    Ok(Event {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        run_id: row.get("run_id")?,
        event_type: row.get("type")?,
        class: EventClass::from_str(&class).unwrap_or(EventClass::Fact),
        payload: parse_json_column(&payload),
        sequence: row.get("sequence")?,
        idempotency_key: row.get("idempotency_key")?,
        source: EventSource::from_str(&source).unwrap_or(EventSource::Orchestrator),
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

    #[test]
    fn duplicate_idempotency_key_returns_existing_row() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();

        let first = create_event(
            &conn,
            CreateEvent {
                project_id: "proj_1",
                run_id: None,
                event_type: "issue.opened",
                class: EventClass::Fact,
                payload: json!({"a": 1}),
                idempotency_key: "webhook:d1:issue:1",
                source: EventSource::Webhook,
            },
        )
        .unwrap();

        let second = create_event(
            &conn,
            CreateEvent {
                project_id: "proj_1",
                run_id: None,
                event_type: "issue.opened",
                class: EventClass::Fact,
                payload: json!({"a": 2}),
                idempotency_key: "webhook:d1:issue:1",
                source: EventSource::Webhook,
            },
        )
        .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.payload, second.payload);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn sequences_are_strictly_increasing_per_run() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (id, task_id, project_id, repo_id, policy_set_id, run_number, phase, base_branch, branch, created_at)
             VALUES ('run_1','task_1','proj_1','repo_1','default',1,'pending','main','b', ?1)",
            [&now],
        )
        .unwrap();

        for i in 0..3 {
            create_event(
                &conn,
                CreateEvent {
                    project_id: "proj_1",
                    run_id: Some("run_1"),
                    event_type: "phase.transitioned",
                    class: EventClass::Decision,
                    payload: json!({"i": i}),
                    idempotency_key: &format!("k{i}"),
                    source: EventSource::Orchestrator,
                },
            )
            .unwrap();
        }

        let events = list_events_for_run(&conn, "run_1").unwrap();
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence.unwrap()).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}

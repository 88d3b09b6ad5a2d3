//! Row-level storage operations for `github_writes` (the outbox table) and
//! `mirror_deferred_events`. The higher-level enqueue/rate-limit/coalesce
//! behavior lives in [`crate::outbox`]; this module only owns the SQL.

use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::errors::StorageError;
use crate::ids;

use super::models::{OutboxEntry, OutboxStatus, parse_json_column};

pub struct NewOutboxEntry<'a> {
    pub run_id: &'a str,
    pub kind: &'a str,
    pub target_node_id: &'a str,
    pub target_type: &'a str,
    pub payload: Value,
    pub payload_hash: &'a str,
    pub idempotency_key: &'a str,
}

pub struct InsertOutcome {
    pub entry: OutboxEntry,
    pub is_new: bool,
}

pub fn insert_outbox_entry(
    conn: &Connection,
    input: NewOutboxEntry<'_>,
) -> Result<InsertOutcome, StorageError> {
    if let Some(existing) = get_outbox_by_idempotency_key(conn, input.idempotency_key)? {
        return Ok(InsertOutcome {
            entry: existing,
            is_new: false,
        });
    }

    let id = ids::outbox_id();
    let now = Utc::now();
    let inserted = conn.execute(
        "INSERT INTO github_writes (
            id, run_id, kind, target_node_id, target_type, payload, payload_hash,
            idempotency_key, status, retry_count, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)
        ON CONFLICT(idempotency_key) DO NOTHING",
        params![
            id,
            input.run_id,
            input.kind,
            input.target_node_id,
            input.target_type,
            input.payload.to_string(),
            input.payload_hash,
            input.idempotency_key,
            OutboxStatus::Queued.as_str(),
            now.to_rfc3339(),
        ],
    )?;

    if inserted == 0 {
        let existing = get_outbox_by_idempotency_key(conn, input.idempotency_key)?.ok_or(
            StorageError::NotFound {
                kind: "outbox entry",
                id: input.idempotency_key.to_string(),
            },
        )?;
        return Ok(InsertOutcome {
            entry: existing,
            is_new: false,
        });
    }

    let entry = get_outbox_entry(conn, &id)?.ok_or(StorageError::NotFound {
        kind: "outbox entry",
        id,
    })?;
    Ok(InsertOutcome {
        entry,
        is_new: true,
    })
}

pub fn claim_outbox_entries(
    conn: &Connection,
    limit: i64,
) -> Result<Vec<OutboxEntry>, StorageError> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "SELECT id FROM github_writes WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2",
    )?;
    let ids: Vec<String> = stmt
        .query_map(params![OutboxStatus::Queued.as_str(), limit], |r| r.get(0))?
        .collect::<Result<_, _>>()?;

    let mut claimed = Vec::new();
    for id in ids {
        let updated = conn.execute(
            "UPDATE github_writes SET status = ?1, sent_at = ?2 WHERE id = ?3 AND status = ?4",
            params![OutboxStatus::Processing.as_str(), now, id, OutboxStatus::Queued.as_str()],
        )?;
        if updated > 0
            && let Some(entry) = get_outbox_entry(conn, &id)?
        {
            claimed.push(entry);
        }
    }
    Ok(claimed)
}

pub fn complete_outbox_entry(
    conn: &Connection,
    id: &str,
    upstream_id: &str,
    upstream_url: &str,
) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE github_writes SET status = ?1, upstream_id = ?2, upstream_url = ?3 WHERE id = ?4",
        params![OutboxStatus::Completed.as_str(), upstream_id, upstream_url, id],
    )?;
    Ok(())
}

pub fn fail_outbox_entry(conn: &Connection, id: &str, error: &str) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE github_writes SET status = ?1, error = ?2, retry_count = retry_count + 1 WHERE id = ?3",
        params![OutboxStatus::Failed.as_str(), error, id],
    )?;
    Ok(())
}

/// Resets `processing` rows whose `sent_at` is older than `stale_after_secs`
/// back to `queued`, so a crashed writer doesn't strand them forever.
pub fn reset_stalled_processing(
    conn: &Connection,
    stale_after_secs: i64,
) -> Result<usize, StorageError> {
    let cutoff = (Utc::now() - Duration::seconds(stale_after_secs)).to_rfc3339();
    let updated = conn.execute(
        "UPDATE github_writes SET status = ?1, sent_at = NULL
         WHERE status = ?2 AND sent_at < ?3",
        params![OutboxStatus::Queued.as_str(), OutboxStatus::Processing.as_str(), cutoff],
    )?;
    Ok(updated)
}

pub fn get_outbox_entry(conn: &Connection, id: &str) -> Result<Option<OutboxEntry>, StorageError> {
    conn.query_row("SELECT * FROM github_writes WHERE id = ?1", [id], row_to_outbox)
        .optional()
        .map_err(Into::into)
}

pub fn get_outbox_by_idempotency_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<OutboxEntry>, StorageError> {
    conn.query_row(
        "SELECT * FROM github_writes WHERE idempotency_key = ?1",
        [key],
        row_to_outbox,
    )
    .optional()
    .map_err(Into::into)
}

/// Most recent non-cancelled comment's timestamp for a run, used by the
/// mirror rate limiter.
pub fn most_recent_comment_at(
    conn: &Connection,
    run_id: &str,
) -> Result<Option<chrono::DateTime<Utc>>, StorageError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT created_at FROM github_writes
             WHERE run_id = ?1 AND kind = 'comment' AND status != ?2
             ORDER BY created_at DESC LIMIT 1",
            params![run_id, OutboxStatus::Cancelled.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
}

pub struct NewDeferredEvent<'a> {
    pub run_id: &'a str,
    pub idempotency_key: &'a str,
    pub summary: &'a str,
}

/// Inserts a deferred mirror event, de-duplicated by `idempotencyKey`, and
/// reports whether it was newly inserted.
pub fn insert_deferred_event(
    conn: &Connection,
    input: NewDeferredEvent<'_>,
) -> Result<bool, StorageError> {
    let id = ids::deferred_event_id();
    let inserted = conn.execute(
        "INSERT INTO mirror_deferred_events (id, run_id, idempotency_key, summary, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(idempotency_key) DO NOTHING",
        params![id, input.run_id, input.idempotency_key, input.summary, Utc::now().to_rfc3339()],
    )?;
    Ok(inserted > 0)
}

pub struct DeferredEvent {
    pub id: String,
    pub summary: String,
    pub created_at: chrono::DateTime<Utc>,
}

pub fn list_deferred_events(
    conn: &Connection,
    run_id: &str,
) -> Result<Vec<DeferredEvent>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, summary, created_at FROM mirror_deferred_events
         WHERE run_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([run_id], |row| {
            let created_at: String = row.get(2)?;
            Ok(DeferredEvent {
                id: row.get(0)?,
                summary: row.get(1)?,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn delete_deferred_events(conn: &Connection, ids: &[String]) -> Result<(), StorageError> {
    for id in ids {
        conn.execute("DELETE FROM mirror_deferred_events WHERE id = ?1", [id])?;
    }
    Ok(())
}

/// Releases deferred rows stranded past `stale_after_secs` (the run never
/// came back around to flush them).
pub fn flush_orphaned_deferred_events(
    conn: &Connection,
    stale_after_secs: i64,
) -> Result<usize, StorageError> {
    let cutoff = (Utc::now() - Duration::seconds(stale_after_secs)).to_rfc3339();
    let deleted = conn.execute(
        "DELETE FROM mirror_deferred_events WHERE created_at < ?1",
        [cutoff],
    )?;
    Ok(deleted)
}

fn row_to_outbox(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let status: String = row.get("status")?;
    let payload: String = row.get("payload")?;
    let created_at: String = row.get("created_at")?;
    Ok(OutboxEntry {
        id: row.get("id")?,
        run_id: row.get("run_id")?,
        kind: row.get("kind")?,
        target_node_id: row.get("target_node_id")?,
        target_type: row.get("target_type")?,
        payload: parse_json_column(&payload),
        payload_hash: row.get("payload_hash")?,
        idempotency_key: row.get("idempotency_key")?,
        status: OutboxStatus::from_str(&status).unwrap_or(OutboxStatus::Queued),
        retry_count: row.get("retry_count")?,
        sent_at: parse_optional_ts(row, "sent_at")?,
        upstream_id: row.get("upstream_id")?,
        upstream_url: row.get("upstream_url")?,
        error: row.get("error")?,
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

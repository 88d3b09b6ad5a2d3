//! Outbox: durable intents to write to the upstream platform, plus a
//! rate-limited, coalescing mirror helper layered on top for comment posts.

use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde_json::Value;

use crate::errors::StorageError;
use crate::platform::PlatformClient;
use crate::redact::{hash_value, redact_string};
use crate::storage::outbox as storage;

pub const STALLED_PROCESSING_THRESHOLD_SECS: i64 = 5 * 60;
pub const MIRROR_RATE_LIMIT_SECS: i64 = 30;
pub const MIRROR_DEFERRED_ORPHAN_SECS: i64 = 60 * 60;
const MAX_COMMENT_CHARS: usize = 65_000;
const UPSTREAM_COMMENT_LIMIT: usize = 65_536;

pub struct EnqueueWrite<'a> {
    pub run_id: &'a str,
    pub kind: &'a str,
    pub target_node_id: &'a str,
    pub target_type: &'a str,
    pub payload: Value,
    pub idempotency_key: Option<String>,
}

pub struct EnqueueResult {
    pub github_write_id: String,
    pub is_new: bool,
    pub status: String,
}

/// `enqueueWrite`: computes `payloadHash` canonically, defaults the
/// idempotency key to `runId:kind:targetNodeId:payloadHash`, and inserts
/// (or returns the existing row, with `isNew=false`).
pub fn enqueue_write(conn: &Connection, input: EnqueueWrite<'_>) -> Result<EnqueueResult, StorageError> {
    let payload_hash = hash_value(&input.payload);
    let idempotency_key = input
        .idempotency_key
        .unwrap_or_else(|| format!("{}:{}:{}:{}", input.run_id, input.kind, input.target_node_id, payload_hash));

    let outcome = storage::insert_outbox_entry(
        conn,
        storage::NewOutboxEntry {
            run_id: input.run_id,
            kind: input.kind,
            target_node_id: input.target_node_id,
            target_type: input.target_type,
            payload: input.payload,
            payload_hash: &payload_hash,
            idempotency_key: &idempotency_key,
        },
    )?;

    Ok(EnqueueResult {
        github_write_id: outcome.entry.id,
        is_new: outcome.is_new,
        status: outcome.entry.status.as_str().to_string(),
    })
}

/// Drives the write worker's claim -> call upstream -> complete/fail cycle
/// for up to `batch_size` queued rows.
pub async fn process_outbox_batch(
    conn: &Connection,
    platform: &dyn PlatformClient,
    batch_size: i64,
) -> Result<usize, StorageError> {
    let claimed = storage::claim_outbox_entries(conn, batch_size)?;
    let mut processed = 0;
    for entry in claimed {
        match platform.write(&entry.kind, &entry.target_node_id, &entry.payload).await {
            Ok(result) => {
                storage::complete_outbox_entry(conn, &entry.id, &result.upstream_id, &result.upstream_url)?;
            }
            Err(err) => {
                storage::fail_outbox_entry(conn, &entry.id, &err.to_string())?;
            }
        }
        processed += 1;
    }
    Ok(processed)
}

pub fn reset_stalled_processing(conn: &Connection) -> Result<usize, StorageError> {
    storage::reset_stalled_processing(conn, STALLED_PROCESSING_THRESHOLD_SECS)
}

pub struct MirrorResult {
    pub enqueued: bool,
    pub deferred: bool,
    pub error: Option<String>,
}

/// Mirrors a structured comment for `run_id`. Never throws: any failure is
/// captured in the returned `MirrorResult` and logged.
pub fn mirror_comment(
    conn: &Connection,
    run_id: &str,
    target_node_id: &str,
    event_summary: &str,
) -> MirrorResult {
    match mirror_comment_inner(conn, run_id, target_node_id, event_summary) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(%err, run_id, "mirror comment failed");
            MirrorResult {
                enqueued: false,
                deferred: false,
                error: Some(err.to_string()),
            }
        }
    }
}

fn mirror_comment_inner(
    conn: &Connection,
    run_id: &str,
    target_node_id: &str,
    event_summary: &str,
) -> Result<MirrorResult, StorageError> {
    let redacted_summary = redact_string(event_summary);
    let idempotency_key = format!("mirror:{}:{}", run_id, hash_value(&Value::String(redacted_summary.clone())));

    let recent = storage::most_recent_comment_at(conn, run_id)?;
    let within_window = recent
        .map(|ts| Utc::now() - ts < Duration::seconds(MIRROR_RATE_LIMIT_SECS))
        .unwrap_or(false);

    if within_window {
        let is_new = storage::insert_deferred_event(
            conn,
            storage::NewDeferredEvent {
                run_id,
                idempotency_key: &idempotency_key,
                summary: &redacted_summary,
            },
        )?;
        return Ok(MirrorResult {
            enqueued: false,
            deferred: is_new,
            error: None,
        });
    }

    let deferred = storage::list_deferred_events(conn, run_id)?;
    let mut body = String::new();
    for d in &deferred {
        body.push_str(&d.summary);
        body.push_str("\n\n");
    }
    body.push_str(&redacted_summary);
    let body = truncate_comment(&body);

    let result = enqueue_write(
        conn,
        EnqueueWrite {
            run_id,
            kind: "comment",
            target_node_id,
            target_type: "issue",
            payload: serde_json::json!({ "body": body }),
            idempotency_key: None,
        },
    )?;

    if result.is_new && !deferred.is_empty() {
        let ids: Vec<String> = deferred.into_iter().map(|d| d.id).collect();
        storage::delete_deferred_events(conn, &ids)?;
    }

    Ok(MirrorResult {
        enqueued: result.is_new,
        deferred: false,
        error: None,
    })
}

pub fn flush_orphaned_deferred_events(conn: &Connection) -> Result<usize, StorageError> {
    storage::flush_orphaned_deferred_events(conn, MIRROR_DEFERRED_ORPHAN_SECS)
}

/// Truncates to [`MAX_COMMENT_CHARS`] (65 000, leaving a 536-char margin
/// below the upstream 65 536 limit), preferring to cut the collapsible
/// `<details>` section first and appending a notice.
fn truncate_comment(body: &str) -> String {
    debug_assert!(MAX_COMMENT_CHARS + 536 <= UPSTREAM_COMMENT_LIMIT);
    if body.chars().count() <= MAX_COMMENT_CHARS {
        return body.to_string();
    }

    const NOTICE: &str = "\n\n_[truncated: output exceeded the comment size limit]_";
    let budget = MAX_COMMENT_CHARS.saturating_sub(NOTICE.len());

    if let Some(details_start) = body.find("<details>")
        && let Some(details_end_rel) = body[details_start..].find("</details>")
    {
        let details_end = details_start + details_end_rel + "</details>".len();
        let prefix_len = body[..details_start].chars().count();
        if prefix_len < budget {
            let keep_in_details = budget - prefix_len;
            let truncated_details: String = body[details_start..details_end].chars().take(keep_in_details).collect();
            let mut out = String::new();
            out.push_str(&body[..details_start]);
            out.push_str(&truncated_details);
            out.push_str(NOTICE);
            out.push_str(&body[details_end..]);
            if out.chars().count() > MAX_COMMENT_CHARS {
                return out.chars().take(MAX_COMMENT_CHARS).collect();
            }
            return out;
        }
    }

    let mut truncated: String = body.chars().take(budget).collect();
    truncated.push_str(NOTICE);
    truncated
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
    fn enqueue_write_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        seed_run(&conn);

        let first = enqueue_write(
            &conn,
            EnqueueWrite {
                run_id: "run_1",
                kind: "pull_request",
                target_node_id: "R_1",
                target_type: "repo",
                payload: json!({ "title": "x" }),
                idempotency_key: None,
            },
        )
        .unwrap();
        assert!(first.is_new);

        let second = enqueue_write(
            &conn,
            EnqueueWrite {
                run_id: "run_1",
                kind: "pull_request",
                target_node_id: "R_1",
                target_type: "repo",
                payload: json!({ "title": "x" }),
                idempotency_key: None,
            },
        )
        .unwrap();
        assert!(!second.is_new);
        assert_eq!(first.github_write_id, second.github_write_id);
    }

    #[test]
    fn mirror_defers_within_rate_limit_window() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        seed_run(&conn);

        // Prime a "recent" completed comment so the next calls see the window.
        enqueue_write(
            &conn,
            EnqueueWrite {
                run_id: "run_1",
                kind: "comment",
                target_node_id: "I_1",
                target_type: "issue",
                payload: json!({ "body": "first" }),
                idempotency_key: Some("seed".to_string()),
            },
        )
        .unwrap();

        let r1 = mirror_comment(&conn, "run_1", "I_1", "event one");
        assert!(!r1.enqueued);
        assert!(r1.deferred);

        let r2 = mirror_comment(&conn, "run_1", "I_1", "event two");
        assert!(!r2.enqueued);
        assert!(r2.deferred);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM mirror_deferred_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn truncate_comment_cuts_details_section_first() {
        let prefix = "summary\n";
        let details = format!("<details>{}</details>", "x".repeat(70_000));
        let body = format!("{prefix}{details}");
        let truncated = truncate_comment(&body);
        assert!(truncated.len() <= MAX_COMMENT_CHARS + 64);
        assert!(truncated.contains("truncated"));
        assert!(truncated.starts_with(prefix));
    }
}

//! Stream bus: a persisted `stream_events` table plus a process-wide
//! pub/sub registry, one `broadcast::Sender` per project
//! (`conductor:events:<projectId>`), lazily created in a `DashMap` the
//! first time a project is published to or subscribed on.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::errors::StorageError;

const CHANNEL_CAPACITY: usize = 256;
const REPLAY_WINDOW: i64 = 101;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum StreamPayload {
    #[serde(rename = "run.phase_changed")]
    RunPhaseChanged { run_id: String, from: String, to: String },
    #[serde(rename = "gate.evaluated")]
    GateEvaluated { run_id: String, gate: String, passed: bool },
    #[serde(rename = "operator.action")]
    OperatorAction { run_id: String, action: String },
    #[serde(rename = "agent.invocation")]
    AgentInvocation { run_id: String, step: String, status: String },
    #[serde(rename = "run.updated")]
    RunUpdated { run_id: String, fields: Vec<String> },
    #[serde(rename = "project.updated")]
    ProjectUpdated { project_id: String },
    #[serde(rename = "refresh_required")]
    RefreshRequired,
}

impl StreamPayload {
    fn kind(&self) -> &'static str {
        match self {
            StreamPayload::RunPhaseChanged { .. } => "run.phase_changed",
            StreamPayload::GateEvaluated { .. } => "gate.evaluated",
            StreamPayload::OperatorAction { .. } => "operator.action",
            StreamPayload::AgentInvocation { .. } => "agent.invocation",
            StreamPayload::RunUpdated { .. } => "run.updated",
            StreamPayload::ProjectUpdated { .. } => "project.updated",
            StreamPayload::RefreshRequired => "refresh_required",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub id: Option<i64>,
    pub project_id: String,
    pub run_id: Option<String>,
    pub payload: StreamPayload,
    pub created_at: chrono::DateTime<Utc>,
}

struct Registry {
    channels: DashMap<String, broadcast::Sender<StreamEvent>>,
}

impl Registry {
    fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn channel_for(&self, project_id: &str) -> broadcast::Sender<StreamEvent> {
        self.channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

static REGISTRY: OnceCell<Arc<Registry>> = OnceCell::new();

/// Process-wide lazily-initialized singleton; double-init is a no-op.
fn registry() -> Arc<Registry> {
    REGISTRY.get_or_init(|| Arc::new(Registry::new())).clone()
}

/// Writes a `stream_events` row and emits on `conductor:events:<projectId>`.
/// Persistence failure is non-fatal: the pub/sub message is still attempted,
/// without an `id`, and the failure is logged.
pub fn publish(conn: &Connection, project_id: &str, run_id: Option<&str>, payload: StreamPayload) {
    let now = Utc::now();
    let id = persist(conn, project_id, run_id, &payload, now)
        .inspect_err(|err| tracing::warn!(%err, "failed to persist stream event"))
        .ok();

    let event = StreamEvent {
        id,
        project_id: project_id.to_string(),
        run_id: run_id.map(str::to_string),
        payload,
        created_at: now,
    };

    let sender = registry().channel_for(project_id);
    // Fire-and-forget: no subscribers is not an error.
    let _ = sender.send(event);
}

fn persist(
    conn: &Connection,
    project_id: &str,
    run_id: Option<&str>,
    payload: &StreamPayload,
    now: chrono::DateTime<Utc>,
) -> Result<i64, StorageError> {
    conn.execute(
        "INSERT INTO stream_events (kind, project_id, run_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            payload.kind(),
            project_id,
            run_id,
            serde_json::to_string(payload).unwrap_or_default(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn subscribe(project_id: &str) -> broadcast::Receiver<StreamEvent> {
    registry().channel_for(project_id).subscribe()
}

/// Replays rows with `id > lastEventId` across `project_ids`, capped at
/// [`REPLAY_WINDOW`] rows to let callers detect overflow (more rows existed
/// than the window could return).
pub fn replay(
    conn: &Connection,
    project_ids: &[String],
    last_event_id: i64,
) -> Result<Vec<StreamEvent>, StorageError> {
    if project_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = project_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT id, kind, project_id, run_id, payload, created_at
         FROM stream_events
         WHERE id > ? AND project_id IN ({placeholders})
         ORDER BY id ASC
         LIMIT {REPLAY_WINDOW}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut param_values: Vec<&dyn rusqlite::ToSql> = vec![&last_event_id];
    for p in project_ids {
        param_values.push(p);
    }
    let rows = stmt
        .query_map(param_values.as_slice(), |row| {
            let payload_raw: String = row.get(4)?;
            let created_at: String = row.get(5)?;
            let payload: StreamPayload = serde_json::from_str(&payload_raw)
                .unwrap_or(StreamPayload::RefreshRequired);
            Ok(StreamEvent {
                id: row.get(0)?,
                project_id: row.get(2)?,
                run_id: row.get(3)?,
                payload,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Scheduled by the cleanup queue; default 14 days.
pub fn prune_stream_events(conn: &Connection, max_age_days: i64) -> Result<usize, StorageError> {
    let cutoff = (Utc::now() - chrono::Duration::days(max_age_days)).to_rfc3339();
    let deleted = conn.execute("DELETE FROM stream_events WHERE created_at < ?1", [cutoff])?;
    Ok(deleted)
}

pub const DEFAULT_PRUNE_MAX_AGE_DAYS: i64 = 14;

//! Phase transitions: the single choke point every run passes through on
//! its way between phases. Every state change funnels through one function
//! before fanning out to the next step.

use rusqlite::Connection;
use serde_json::Value;

use crate::errors::{ConductorError, ValidationError};
use crate::outbox;
use crate::storage::events::{self, CreateEvent};
use crate::storage::models::{EventClass, EventSource, Phase, Run};
use crate::storage::runs;
use crate::stream::{self, StreamPayload};

/// Legal `(from, to)` edges. `blocked` may resolve to any non-terminal phase
/// or `cancelled`; `completed`/`cancelled` are terminal.
fn is_legal_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    match from {
        Pending => matches!(to, Planning | Cancelled | Blocked),
        Planning => matches!(to, AwaitingPlanApproval | Blocked | Cancelled),
        AwaitingPlanApproval => matches!(to, Executing | Planning | Cancelled | Blocked),
        Executing => matches!(to, AwaitingReview | Blocked | Cancelled),
        AwaitingReview => matches!(to, Executing | Completed | Blocked | Cancelled),
        Blocked => !matches!(to, Blocked | Completed),
        Completed | Cancelled => false,
    }
}

pub struct TransitionPhase<'a> {
    pub run_id: &'a str,
    pub to: Phase,
    pub triggered_by: &'a str,
    pub reason: Option<&'a str>,
    pub payload: Option<Value>,
    /// The step to resume on arrival in `to` (e.g. `implementer_apply_changes`
    /// when `approve_plan` moves a run into `executing`). Ignored when
    /// `to == Blocked` — blocked runs are parked, not stepped.
    pub next_step: Option<&'a str>,
    /// Set only when `to == Blocked`; becomes `runs.blocked_context`, normally
    /// `{"resumePhase": ..., "resumeStep": ...}` so `retry` knows where to
    /// land.
    pub blocked_context: Option<Value>,
}

/// Validates and applies a phase transition in one transaction: appends a
/// `phase.transitioned` event, updates `runs.phase`, and on a terminal phase
/// clears `tasks.active_run_id`. Illegal edges fail with
/// `ValidationError::InvalidTransition` without mutating anything.
///
/// After commit, publishes a `run.phase_changed` stream event and mirrors
/// the transition to the upstream issue/PR thread (best-effort, non-fatal).
pub fn transition_phase(conn: &mut Connection, input: TransitionPhase<'_>) -> Result<Run, ConductorError> {
    let tx = conn.transaction().map_err(crate::errors::StorageError::from)?;

    let run = runs::get_run_for_update(&tx, input.run_id)?.ok_or(crate::errors::StorageError::NotFound {
        kind: "run",
        id: input.run_id.to_string(),
    })?;

    if !is_legal_transition(run.phase, input.to) {
        return Err(ValidationError::InvalidTransition {
            from: run.phase.as_str().to_string(),
            to: input.to.as_str().to_string(),
        }
        .into());
    }

    let mut payload = input.payload.unwrap_or_else(|| serde_json::json!({}));
    if let Value::Object(ref mut map) = payload {
        map.insert("from".to_string(), Value::String(run.phase.as_str().to_string()));
        map.insert("to".to_string(), Value::String(input.to.as_str().to_string()));
        map.insert("triggeredBy".to_string(), Value::String(input.triggered_by.to_string()));
        if let Some(reason) = input.reason {
            map.insert("reason".to_string(), Value::String(reason.to_string()));
        }
    }

    let idempotency_key = format!(
        "orchestrator:{}:transition:{}:{}:{}",
        input.run_id,
        run.phase.as_str(),
        input.to.as_str(),
        run.next_sequence
    );

    events::create_event(
        &tx,
        CreateEvent {
            project_id: &run.project_id,
            run_id: Some(input.run_id),
            event_type: "phase.transitioned",
            class: EventClass::Decision,
            payload,
            idempotency_key: &idempotency_key,
            source: EventSource::Orchestrator,
        },
    )?;

    if input.to == Phase::Blocked {
        runs::set_blocked(
            &tx,
            input.run_id,
            input.reason.unwrap_or("blocked"),
            &input.blocked_context.clone().unwrap_or_else(|| serde_json::json!({})),
        )?;
    } else {
        runs::set_phase(&tx, input.run_id, input.to, input.next_step)?;
    }
    if input.to.is_terminal() {
        runs::clear_active_run_if_matches(&tx, &run.task_id, input.run_id)?;
    }

    tx.commit().map_err(crate::errors::StorageError::from)?;

    let updated = runs::get_run(conn, input.run_id)?.ok_or(crate::errors::StorageError::NotFound {
        kind: "run",
        id: input.run_id.to_string(),
    })?;

    stream::publish(
        conn,
        &run.project_id,
        Some(input.run_id),
        StreamPayload::RunPhaseChanged {
            run_id: input.run_id.to_string(),
            from: run.phase.as_str().to_string(),
            to: input.to.as_str().to_string(),
        },
    );

    let summary = format!(
        "Run transitioned from `{}` to `{}`{}",
        run.phase.as_str(),
        input.to.as_str(),
        input.reason.map(|r| format!(": {r}")).unwrap_or_default()
    );
    let mirror = outbox::mirror_comment(conn, input.run_id, &run.task_id, &summary);
    if let Some(err) = mirror.error {
        tracing::warn!(%err, run_id = input.run_id, "failed to mirror phase transition");
    }

    Ok(updated)
}

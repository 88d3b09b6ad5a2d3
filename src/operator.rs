//! Operator actions: the human-in-the-loop surface. Every action is
//! validated against the run's current phase before being recorded, so an
//! operator can never approve a plan on a run that has already moved on.

use rusqlite::Connection;

use crate::errors::{ConductorError, ValidationError};
use crate::orchestrator::{self, TransitionPhase};
use crate::storage::models::{OperatorActionKind, Phase, Run};
use crate::storage::operator_actions::{self, NewOperatorAction};
use crate::storage::runs;
use crate::stream::{self, StreamPayload};

pub struct RecordOperatorAction<'a> {
    pub run_id: &'a str,
    pub action: OperatorActionKind,
    pub actor_id: &'a str,
    pub actor_type: &'a str,
    pub actor_display_name: Option<&'a str>,
    pub comment: Option<&'a str>,
}

/// Whether `action` may be applied to a run currently in `phase`, and (for
/// `pause`/`resume`) whether `paused_at` must be set or clear.
fn is_valid_for_phase(action: OperatorActionKind, phase: Phase, paused_at_set: bool) -> bool {
    use OperatorActionKind::*;
    match action {
        StartRun => phase == Phase::Pending,
        ApprovePlan | RevisePlan | RejectRun => phase == Phase::AwaitingPlanApproval,
        Retry | GrantPolicyException | DenyPolicyException => phase == Phase::Blocked,
        Pause => {
            matches!(
                phase,
                Phase::Pending
                    | Phase::Planning
                    | Phase::AwaitingPlanApproval
                    | Phase::Executing
                    | Phase::AwaitingReview
            ) && !paused_at_set
        }
        Resume => paused_at_set,
        Cancel => !phase.is_terminal(),
    }
}

/// `recordOperatorAction`: validates the action against the run's current
/// phase, persists it, and emits an `operator.action` stream event.
/// `revise_plan` additionally transitions the run back to `planning` and
/// bumps `planRevisions`.
pub fn record_operator_action(conn: &mut Connection, input: RecordOperatorAction<'_>) -> Result<(), ConductorError> {
    let run = runs::get_run(conn, input.run_id)?.ok_or(crate::errors::StorageError::NotFound {
        kind: "run",
        id: input.run_id.to_string(),
    })?;

    if !is_valid_for_phase(input.action, run.phase, run.paused_at.is_some()) {
        return Err(ValidationError::ActionNotValidForPhase {
            action: input.action.as_str().to_string(),
            phase: run.phase.as_str().to_string(),
        }
        .into());
    }

    operator_actions::insert_operator_action(
        conn,
        NewOperatorAction {
            run_id: input.run_id,
            action: input.action,
            actor_id: input.actor_id,
            actor_type: input.actor_type,
            actor_display_name: input.actor_display_name,
            comment: input.comment,
            from_phase: Some(run.phase.as_str()),
            to_phase: None,
        },
    )?;

    match input.action {
        OperatorActionKind::Pause => runs::set_paused(conn, input.run_id, true)?,
        OperatorActionKind::Resume => runs::set_paused(conn, input.run_id, false)?,
        OperatorActionKind::RevisePlan => {
            runs::increment_plan_revisions(conn, input.run_id)?;
            transition(conn, &input, Phase::Planning, None)?;
        }
        OperatorActionKind::ApprovePlan => {
            transition(conn, &input, Phase::Executing, Some(crate::steps::STEP_IMPLEMENTER_APPLY_CHANGES))?;
        }
        OperatorActionKind::RejectRun | OperatorActionKind::Cancel | OperatorActionKind::DenyPolicyException => {
            transition(conn, &input, Phase::Cancelled, None)?;
        }
        OperatorActionKind::Retry | OperatorActionKind::GrantPolicyException => {
            let (resume_phase, resume_step) = resume_point(&run);
            transition(conn, &input, resume_phase, resume_step.as_deref())?;
        }
        OperatorActionKind::StartRun => {}
    }

    stream::publish(
        conn,
        &run.project_id,
        Some(input.run_id),
        StreamPayload::OperatorAction {
            run_id: input.run_id.to_string(),
            action: input.action.as_str().to_string(),
        },
    );

    Ok(())
}

fn transition(
    conn: &mut Connection,
    input: &RecordOperatorAction<'_>,
    to: Phase,
    next_step: Option<&str>,
) -> Result<(), ConductorError> {
    orchestrator::transition_phase(
        conn,
        TransitionPhase {
            run_id: input.run_id,
            to,
            triggered_by: input.actor_id,
            reason: input.comment,
            payload: None,
            next_step,
            blocked_context: None,
        },
    )?;
    Ok(())
}

/// Where a blocked run resumes: the phase/step recorded in `blockedContext`
/// when it was parked, falling back to `executing`/the implementer step if
/// the run was blocked before that context existed.
fn resume_point(run: &Run) -> (Phase, Option<String>) {
    let phase = run
        .blocked_context
        .as_ref()
        .and_then(|ctx| ctx.get("resumePhase"))
        .and_then(|v| v.as_str())
        .and_then(Phase::from_str)
        .unwrap_or(Phase::Executing);
    let step = run
        .blocked_context
        .as_ref()
        .and_then(|ctx| ctx.get("resumeStep"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| Some(crate::steps::STEP_IMPLEMENTER_APPLY_CHANGES.to_string()));
    (phase, step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use crate::storage::runs::CreateRun;

    fn seed(conn: &Connection) -> String {
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute("INSERT INTO users (id, email, created_at) VALUES ('usr_1','a@b.com', ?1)", [&now]).unwrap();
        conn.execute(
            "INSERT INTO projects (id, user_id, name, org_installation_id, port_range_start, port_range_end, created_at)
             VALUES ('proj_1','usr_1','p','inst', 3100, 3199, ?1)",
            [&now],
        ).unwrap();
        conn.execute("INSERT INTO repos (id, project_id, upstream_node_id, created_at) VALUES ('repo_1','proj_1','node', ?1)", [&now]).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, project_id, upstream_node_id, title, created_at, updated_at, last_activity_at)
             VALUES ('task_1','proj_1','issue-1','t', ?1, ?1, ?1)",
            [&now],
        ).unwrap();
        crate::storage::runs::create_run(
            conn,
            CreateRun { task_id: "task_1", project_id: "proj_1", repo_id: "repo_1", policy_set_id: "default", base_branch: "main" },
        )
        .unwrap()
        .id
    }

    #[test]
    fn start_run_is_valid_only_while_pending() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let run_id = seed(&conn);

        record_operator_action(
            &mut conn,
            RecordOperatorAction {
                run_id: &run_id,
                action: OperatorActionKind::StartRun,
                actor_id: "usr_1",
                actor_type: "user",
                actor_display_name: None,
                comment: None,
            },
        )
        .unwrap();

        let result = record_operator_action(
            &mut conn,
            RecordOperatorAction {
                run_id: &run_id,
                action: OperatorActionKind::StartRun,
                actor_id: "usr_1",
                actor_type: "user",
                actor_display_name: None,
                comment: None,
            },
        );
        assert!(result.is_ok(), "start_run has no phase side effect so it stays valid from pending");
    }

    #[test]
    fn approve_plan_rejected_outside_awaiting_plan_approval() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let run_id = seed(&conn);

        let result = record_operator_action(
            &mut conn,
            RecordOperatorAction {
                run_id: &run_id,
                action: OperatorActionKind::ApprovePlan,
                actor_id: "usr_1",
                actor_type: "user",
                actor_display_name: None,
                comment: None,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn revise_plan_transitions_back_to_planning() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let run_id = seed(&conn);

        orchestrator::transition_phase(&mut conn, TransitionPhase { run_id: &run_id, to: Phase::Planning, triggered_by: "s", reason: None, payload: None, next_step: None, blocked_context: None }).unwrap();
        orchestrator::transition_phase(&mut conn, TransitionPhase { run_id: &run_id, to: Phase::AwaitingPlanApproval, triggered_by: "s", reason: None, payload: None, next_step: None, blocked_context: None }).unwrap();

        record_operator_action(
            &mut conn,
            RecordOperatorAction {
                run_id: &run_id,
                action: OperatorActionKind::RevisePlan,
                actor_id: "usr_1",
                actor_type: "user",
                actor_display_name: None,
                comment: Some("needs another pass"),
            },
        )
        .unwrap();

        let run = runs::get_run(&conn, &run_id).unwrap().unwrap();
        assert_eq!(run.phase, Phase::Planning);
        assert_eq!(run.plan_revisions, 1);
    }

    #[test]
    fn pause_requires_not_already_paused() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let run_id = seed(&conn);

        record_operator_action(
            &mut conn,
            RecordOperatorAction {
                run_id: &run_id,
                action: OperatorActionKind::Pause,
                actor_id: "usr_1",
                actor_type: "user",
                actor_display_name: None,
                comment: None,
            },
        )
        .unwrap();

        let result = record_operator_action(
            &mut conn,
            RecordOperatorAction {
                run_id: &run_id,
                action: OperatorActionKind::Pause,
                actor_id: "usr_1",
                actor_type: "user",
                actor_display_name: None,
                comment: None,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn pause_rejected_while_blocked() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let run_id = seed(&conn);

        orchestrator::transition_phase(
            &mut conn,
            TransitionPhase {
                run_id: &run_id,
                to: Phase::Blocked,
                triggered_by: "s",
                reason: Some("policy exception needed"),
                payload: None,
                next_step: None,
                blocked_context: None,
            },
        )
        .unwrap();

        let result = record_operator_action(
            &mut conn,
            RecordOperatorAction {
                run_id: &run_id,
                action: OperatorActionKind::Pause,
                actor_id: "usr_1",
                actor_type: "user",
                actor_display_name: None,
                comment: None,
            },
        );
        assert!(result.is_err());
    }
}

//! `conductor run` — a convenience wrapper that starts a run for a task
//! against a given repo and immediately transitions it into `planning`.

use anyhow::{Context, Result};

use conductor::operator::{self, RecordOperatorAction};
use conductor::orchestrator::{self, TransitionPhase};
use conductor::storage::Db;
use conductor::storage::models::{OperatorActionKind, Phase};
use conductor::storage::jobs::{self, CreateJob};
use conductor::storage::projects;
use conductor::storage::runs::{self, CreateRun};

pub fn cmd_run(db_path: &std::path::Path, task_id: &str, repo_id: &str, base_branch: &str) -> Result<()> {
    let db = Db::open(db_path)?;
    let mut conn = db.conn()?;

    let repo = projects::get_repo(&conn, repo_id)?
        .with_context(|| format!("no such repo: {repo_id}"))?;
    let project = projects::get_project(&conn, &repo.project_id)?
        .with_context(|| format!("no such project: {}", repo.project_id))?;

    let run = runs::create_run(
        &conn,
        CreateRun {
            task_id,
            project_id: &project.id,
            repo_id: &repo.id,
            policy_set_id: &project.default_policy_set_id,
            base_branch,
        },
    )?;

    operator::record_operator_action(
        &mut conn,
        RecordOperatorAction {
            run_id: &run.id,
            action: OperatorActionKind::StartRun,
            actor_id: "cli",
            actor_type: "operator",
            actor_display_name: None,
            comment: None,
        },
    )?;

    let updated = orchestrator::transition_phase(
        &mut conn,
        TransitionPhase {
            run_id: &run.id,
            to: Phase::Planning,
            triggered_by: "cli",
            reason: Some("start_run"),
            payload: None,
            next_step: Some(conductor::steps::STEP_SETUP_WORKTREE),
            blocked_context: None,
        },
    )?;

    jobs::create_job(
        &conn,
        CreateJob {
            queue: "runs",
            job_type: "run_step",
            payload: serde_json::json!({ "runId": updated.id }),
            idempotency_key: &format!(
                "run_step:{}:{}:{}",
                updated.id,
                updated.phase.as_str(),
                conductor::steps::STEP_SETUP_WORKTREE
            ),
            priority: 0,
            max_attempts: None,
            run_id: Some(&updated.id),
            project_id: Some(&project.id),
        },
    )?;

    println!("run {} started on branch {} (phase={})", updated.id, updated.branch, updated.phase.as_str());
    Ok(())
}

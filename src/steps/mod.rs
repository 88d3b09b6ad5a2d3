//! Step handlers: the pipeline the orchestrator walks a run through, one
//! named step at a time. A flat set of handlers sharing one
//! `(ctx) -> StepOutcome` signature, matched on `run.step`.

use std::path::Path;

use rusqlite::Connection;
use serde_json::{Value, json};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::agent::policy::PolicyRule;
use crate::agent::{self, AgentProvider, LoopConfig, RunInvocationInput, ToolRegistry};
use crate::config::Config;
use crate::errors::ConductorError;
use crate::orchestrator::{self, TransitionPhase};
use crate::outbox;
use crate::platform::PlatformClient;
use crate::storage::models::{AgentInvocation, OutboxStatus, Phase, Project, Repo, Run};
use crate::storage::{artifacts, jobs, outbox as outbox_storage, projects, runs, worktrees};
use crate::worktree;

pub const STEP_SETUP_WORKTREE: &str = "setup_worktree";
pub const STEP_ROUTE: &str = "route";
pub const STEP_PLANNER_CREATE_PLAN: &str = "planner_create_plan";
pub const STEP_REVIEWER_REVIEW_PLAN: &str = "reviewer_review_plan";
pub const STEP_WAIT_PLAN_APPROVAL: &str = "wait_plan_approval";
pub const STEP_IMPLEMENTER_APPLY_CHANGES: &str = "implementer_apply_changes";
pub const STEP_TESTER_RUN_TESTS: &str = "tester_run_tests";
pub const STEP_REVIEWER_REVIEW_CODE: &str = "reviewer_review_code";
pub const STEP_CREATE_PR: &str = "create_pr";
pub const STEP_WAIT_PR_MERGE: &str = "wait_pr_merge";
pub const STEP_CLEANUP: &str = "cleanup";

/// The full step order, for anything that wants to display or validate it.
pub const PIPELINE: &[&str] = &[
    STEP_SETUP_WORKTREE,
    STEP_ROUTE,
    STEP_PLANNER_CREATE_PLAN,
    STEP_REVIEWER_REVIEW_PLAN,
    STEP_WAIT_PLAN_APPROVAL,
    STEP_IMPLEMENTER_APPLY_CHANGES,
    STEP_TESTER_RUN_TESTS,
    STEP_REVIEWER_REVIEW_CODE,
    STEP_CREATE_PR,
    STEP_WAIT_PR_MERGE,
    STEP_CLEANUP,
];

const MAX_TEST_FIX_ATTEMPTS: i64 = 3;
const MAX_REVIEW_ROUNDS: i64 = 3;

/// Per-agent timeouts.
const PLANNER_TIMEOUT_MS: u64 = 300_000;
const REVIEWER_TIMEOUT_MS: u64 = 180_000;
const IMPLEMENTER_TIMEOUT_MS: u64 = 600_000;

/// Everything a step handler needs: the loaded run/project/repo plus the
/// engine's shared collaborators. Borrowed, not owned — handlers run inside
/// the caller's connection and cancellation scope.
pub struct StepContext<'a> {
    pub conn: &'a Connection,
    pub config: &'a Config,
    pub provider: &'a dyn AgentProvider,
    pub tools: &'a ToolRegistry,
    pub policy_rules: &'a [Box<dyn PolicyRule>],
    pub platform: &'a dyn PlatformClient,
    pub cancel: &'a CancellationToken,
    pub run: Run,
    pub project: Project,
    pub repo: Repo,
}

/// What a step handler decided should happen next. The caller (the `runs`
/// queue worker) applies this via [`apply_outcome`].
pub enum StepOutcome {
    /// Stay in the current phase; arrive at `next_step`.
    Advance { next_step: &'static str },
    /// Move to a new phase, arriving at `next_step` (ignored if `to` is
    /// `Blocked` — use `Blocked` for that).
    Transition {
        to: Phase,
        next_step: Option<&'static str>,
    },
    /// Nothing to do right now; an external event (operator action, webhook,
    /// outbox completion) will bring the run back around to this step.
    AwaitExternal,
    /// A blocking gate or unrecoverable error parked the run. `context`
    /// should carry `resumePhase`/`resumeStep` so `retry` knows where to land.
    Blocked { reason: String, context: Value },
}

fn not_found(run_id: &str) -> ConductorError {
    crate::errors::StorageError::NotFound {
        kind: "run",
        id: run_id.to_string(),
    }
    .into()
}

/// Loads the run named by `run_id` along with its project and repo, ready to
/// hand to [`run_step`].
pub fn load_context<'a>(
    conn: &'a Connection,
    config: &'a Config,
    provider: &'a dyn AgentProvider,
    tools: &'a ToolRegistry,
    policy_rules: &'a [Box<dyn PolicyRule>],
    platform: &'a dyn PlatformClient,
    cancel: &'a CancellationToken,
    run_id: &str,
) -> Result<StepContext<'a>, ConductorError> {
    let run = runs::get_run(conn, run_id)?.ok_or_else(|| not_found(run_id))?;
    let project = projects::get_project(conn, &run.project_id)?.ok_or(crate::errors::StorageError::NotFound {
        kind: "project",
        id: run.project_id.clone(),
    })?;
    let repo = projects::get_repo(conn, &run.repo_id)?.ok_or(crate::errors::StorageError::NotFound {
        kind: "repo",
        id: run.repo_id.clone(),
    })?;
    Ok(StepContext {
        conn,
        config,
        provider,
        tools,
        policy_rules,
        platform,
        cancel,
        run,
        project,
        repo,
    })
}

/// Dispatches to the handler named by `ctx.run.step`, defaulting to
/// `setup_worktree` for a freshly created run (`step` is `NULL` in `pending`).
pub async fn run_step(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let step = ctx.run.step.as_deref().unwrap_or(STEP_SETUP_WORKTREE);
    match step {
        STEP_SETUP_WORKTREE => setup_worktree(ctx).await,
        STEP_ROUTE => route(ctx).await,
        STEP_PLANNER_CREATE_PLAN => planner_create_plan(ctx).await,
        STEP_REVIEWER_REVIEW_PLAN => reviewer_review_plan(ctx).await,
        STEP_WAIT_PLAN_APPROVAL => Ok(StepOutcome::AwaitExternal),
        STEP_IMPLEMENTER_APPLY_CHANGES => implementer_apply_changes(ctx).await,
        STEP_TESTER_RUN_TESTS => tester_run_tests(ctx).await,
        STEP_REVIEWER_REVIEW_CODE => reviewer_review_code(ctx).await,
        STEP_CREATE_PR => create_pr(ctx).await,
        STEP_WAIT_PR_MERGE => wait_pr_merge(ctx).await,
        STEP_CLEANUP => cleanup(ctx).await,
        other => Err(ConductorError::Programmer(format!("unknown step '{other}'"))),
    }
}

/// Applies a [`StepOutcome`] to storage: mutates `runs.phase`/`runs.step` (or
/// parks the run as `blocked`), and enqueues the follow-up `runs` queue job
/// so a worker picks the run back up. Returns the updated run.
pub fn apply_outcome(conn: &mut Connection, run: &Run, outcome: StepOutcome) -> Result<Run, ConductorError> {
    match outcome {
        StepOutcome::Advance { next_step } => {
            runs::set_phase(conn, &run.id, run.phase, Some(next_step))?;
            enqueue_follow_up(conn, run, run.phase, next_step)?;
            runs::get_run(conn, &run.id)?.ok_or_else(|| not_found(&run.id))
        }
        StepOutcome::Transition { to, next_step } => {
            let updated = orchestrator::transition_phase(
                conn,
                TransitionPhase {
                    run_id: &run.id,
                    to,
                    triggered_by: "system",
                    reason: None,
                    payload: None,
                    next_step,
                    blocked_context: None,
                },
            )?;
            if let Some(step) = next_step {
                enqueue_follow_up(conn, &updated, to, step)?;
            }
            Ok(updated)
        }
        StepOutcome::AwaitExternal => runs::get_run(conn, &run.id)?.ok_or_else(|| not_found(&run.id)),
        StepOutcome::Blocked { reason, context } => orchestrator::transition_phase(
            conn,
            TransitionPhase {
                run_id: &run.id,
                to: Phase::Blocked,
                triggered_by: "system",
                reason: Some(&reason),
                payload: None,
                next_step: None,
                blocked_context: Some(context),
            },
        ),
    }
}

/// Enqueues the `runs` queue job that drives the next step, idempotent per
/// `(run, phase, step)` so a run already queued for this step isn't
/// double-scheduled: jobs with the same idempotency key collapse.
fn enqueue_follow_up(conn: &Connection, run: &Run, phase: Phase, step: &str) -> Result<(), ConductorError> {
    jobs::create_job(
        conn,
        jobs::CreateJob {
            queue: "runs",
            job_type: "run_step",
            payload: json!({ "runId": run.id }),
            idempotency_key: &format!("run_step:{}:{}:{}", run.id, phase.as_str(), step),
            priority: 0,
            max_attempts: None,
            run_id: Some(&run.id),
            project_id: Some(&run.project_id),
        },
    )?;
    Ok(())
}

fn worktree_path(config: &Config, run_id: &str) -> std::path::PathBuf {
    config.worktrees_dir().join(run_id)
}

async fn invoke_agent(
    ctx: &StepContext<'_>,
    step: &'static str,
    system_prompt: &str,
    user_prompt: &str,
    path: &Path,
    timeout_ms: u64,
) -> Result<AgentInvocation, ConductorError> {
    agent::run_invocation(
        ctx.conn,
        ctx.provider,
        ctx.tools,
        ctx.policy_rules,
        ctx.cancel,
        &LoopConfig::default(),
        RunInvocationInput {
            run_id: &ctx.run.id,
            project_id: &ctx.project.id,
            step,
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            worktree_path: path.to_path_buf(),
            timeout_ms: Some(timeout_ms),
        },
    )
    .await
}

fn latest_assistant_content(conn: &Connection, invocation_id: &str) -> Result<String, ConductorError> {
    let messages = crate::storage::agent::list_messages(conn, invocation_id)?;
    Ok(messages
        .into_iter()
        .rev()
        .find(|m| m.role == "assistant")
        .map(|m| m.content)
        .unwrap_or_default())
}

async fn setup_worktree(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let cloned = worktree::clone_or_fetch_repo(ctx.config, &ctx.repo.id, &ctx.repo.clone_url)?;
    let mirror = git2::Repository::open_bare(&cloned.clone_path)
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to open mirror: {e}")))?;
    let configured_base = if ctx.run.base_branch.is_empty() {
        ctx.project.default_base_branch.as_deref()
    } else {
        Some(ctx.run.base_branch.as_str())
    };
    let base_branch = worktree::resolve_base_branch(&mirror, configured_base);

    worktree::create_worktree(
        ctx.conn,
        ctx.config,
        worktree::CreateWorktree {
            run_id: &ctx.run.id,
            project_id: &ctx.project.id,
            repo_id: &ctx.repo.id,
            mirror_path: &cloned.clone_path,
            branch: &ctx.run.branch,
            base_branch: &base_branch,
        },
    )?;

    Ok(StepOutcome::Transition {
        to: Phase::Planning,
        next_step: Some(STEP_ROUTE),
    })
}

/// Decides whether this task needs the full plan/review pipeline or could
/// skip ahead. Every task currently routes through the full pipeline; this
/// is the seam a future triage step would hook into.
async fn route(_ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    Ok(StepOutcome::Advance {
        next_step: STEP_PLANNER_CREATE_PLAN,
    })
}

async fn planner_create_plan(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let path = worktree_path(ctx.config, &ctx.run.id);
    let invocation = invoke_agent(
        ctx,
        STEP_PLANNER_CREATE_PLAN,
        "You are the planning agent for an autonomous code-change run. Produce a concrete, \
         reviewable implementation plan for the task, broken into discrete steps.",
        &format!("Plan the changes needed to complete run {}.", ctx.run.id),
        &path,
        PLANNER_TIMEOUT_MS,
    )
    .await?;

    let plan = latest_assistant_content(ctx.conn, &invocation.id)?;
    artifacts::create_artifact(ctx.conn, &ctx.run.id, "plan", &plan, "pending")?;

    Ok(StepOutcome::Advance {
        next_step: STEP_REVIEWER_REVIEW_PLAN,
    })
}

async fn reviewer_review_plan(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let plan = artifacts::latest_artifact(ctx.conn, &ctx.run.id, "plan")?
        .ok_or_else(|| ConductorError::Programmer("no plan artifact to review".to_string()))?;
    let path = worktree_path(ctx.config, &ctx.run.id);

    let invocation = invoke_agent(
        ctx,
        STEP_REVIEWER_REVIEW_PLAN,
        "You are the plan-review agent. Decide whether this plan is safe and complete enough to \
         execute. Reply starting with VALID or INVALID, followed by your reasoning.",
        &plan.content,
        &path,
        REVIEWER_TIMEOUT_MS,
    )
    .await?;

    let verdict = latest_assistant_content(ctx.conn, &invocation.id)?;
    let valid = verdict.trim_start().to_uppercase().starts_with("VALID");
    artifacts::create_artifact(
        ctx.conn,
        &ctx.run.id,
        "plan_review",
        &verdict,
        if valid { "pass" } else { "fail" },
    )?;

    if valid {
        return Ok(StepOutcome::Transition {
            to: Phase::AwaitingPlanApproval,
            next_step: Some(STEP_WAIT_PLAN_APPROVAL),
        });
    }

    Ok(StepOutcome::Blocked {
        reason: "plan_invalid".to_string(),
        context: json!({
            "gate": "plan_valid",
            "resumePhase": Phase::Planning.as_str(),
            "resumeStep": STEP_PLANNER_CREATE_PLAN,
        }),
    })
}

async fn implementer_apply_changes(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let plan = artifacts::latest_artifact(ctx.conn, &ctx.run.id, "plan")?
        .ok_or_else(|| ConductorError::Programmer("no plan artifact to implement".to_string()))?;
    let path = worktree_path(ctx.config, &ctx.run.id);

    let invocation = invoke_agent(
        ctx,
        STEP_IMPLEMENTER_APPLY_CHANGES,
        "You are the implementer agent. Apply the approved plan to the working tree using the \
         tools available to you, then summarize the changes you made.",
        &plan.content,
        &path,
        IMPLEMENTER_TIMEOUT_MS,
    )
    .await?;

    let summary = latest_assistant_content(ctx.conn, &invocation.id)?;
    artifacts::create_artifact(ctx.conn, &ctx.run.id, "change_summary", &summary, "pending")?;

    Ok(StepOutcome::Advance {
        next_step: STEP_TESTER_RUN_TESTS,
    })
}

async fn tester_run_tests(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let Some(test_command) = ctx.project.test_command.as_deref().filter(|c| !c.trim().is_empty()) else {
        artifacts::create_artifact(ctx.conn, &ctx.run.id, "test_report", "no test_command configured", "pass")?;
        return Ok(StepOutcome::Transition {
            to: Phase::AwaitingReview,
            next_step: Some(STEP_REVIEWER_REVIEW_CODE),
        });
    };

    let path = worktree_path(ctx.config, &ctx.run.id);
    let mut parts = test_command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| ConductorError::Other(anyhow::anyhow!("empty test_command")))?;

    let output = Command::new(program)
        .args(parts)
        .current_dir(&path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ConductorError::Other(anyhow::anyhow!("failed to run test_command: {e}")))?;

    let passed = output.status.success();
    let report = format!(
        "exit status: {}\n\nstdout:\n{}\n\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
    artifacts::create_artifact(ctx.conn, &ctx.run.id, "test_report", &report, if passed { "pass" } else { "fail" })?;

    if passed {
        return Ok(StepOutcome::Transition {
            to: Phase::AwaitingReview,
            next_step: Some(STEP_REVIEWER_REVIEW_CODE),
        });
    }

    if ctx.run.test_fix_attempts < MAX_TEST_FIX_ATTEMPTS {
        runs::increment_test_fix_attempts(ctx.conn, &ctx.run.id)?;
        return Ok(StepOutcome::Advance {
            next_step: STEP_IMPLEMENTER_APPLY_CHANGES,
        });
    }

    Ok(StepOutcome::Blocked {
        reason: "tests_failed".to_string(),
        context: json!({
            "gate": "tests_pass",
            "testFixAttempts": ctx.run.test_fix_attempts,
            "resumePhase": Phase::Executing.as_str(),
            "resumeStep": STEP_IMPLEMENTER_APPLY_CHANGES,
        }),
    })
}

async fn reviewer_review_code(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let change_summary = artifacts::latest_artifact(ctx.conn, &ctx.run.id, "change_summary")?
        .ok_or_else(|| ConductorError::Programmer("no change summary to review".to_string()))?;
    let path = worktree_path(ctx.config, &ctx.run.id);

    let invocation = invoke_agent(
        ctx,
        STEP_REVIEWER_REVIEW_CODE,
        "You are the code-review agent. Decide whether these changes are ready to ship. Reply \
         starting with APPROVE or REQUEST_CHANGES, followed by your reasoning.",
        &change_summary.content,
        &path,
        REVIEWER_TIMEOUT_MS,
    )
    .await?;

    let verdict = latest_assistant_content(ctx.conn, &invocation.id)?;
    let approved = verdict.trim_start().to_uppercase().starts_with("APPROVE");
    artifacts::create_artifact(
        ctx.conn,
        &ctx.run.id,
        "code_review",
        &verdict,
        if approved { "pass" } else { "fail" },
    )?;

    if approved {
        return Ok(StepOutcome::Advance {
            next_step: STEP_CREATE_PR,
        });
    }

    if ctx.run.review_rounds < MAX_REVIEW_ROUNDS {
        runs::increment_review_rounds(ctx.conn, &ctx.run.id)?;
        return Ok(StepOutcome::Transition {
            to: Phase::Executing,
            next_step: Some(STEP_IMPLEMENTER_APPLY_CHANGES),
        });
    }

    Ok(StepOutcome::Blocked {
        reason: "review_rejected".to_string(),
        context: json!({
            "gate": "review_pass",
            "reviewRounds": ctx.run.review_rounds,
            "resumePhase": Phase::AwaitingReview.as_str(),
            "resumeStep": STEP_REVIEWER_REVIEW_CODE,
        }),
    })
}

async fn create_pr(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    let change_summary = artifacts::latest_artifact(ctx.conn, &ctx.run.id, "change_summary")?
        .map(|a| a.content)
        .unwrap_or_default();

    let result = outbox::enqueue_write(
        ctx.conn,
        outbox::EnqueueWrite {
            run_id: &ctx.run.id,
            kind: "pull_request",
            target_node_id: &ctx.repo.upstream_node_id,
            target_type: "repo",
            payload: json!({
                "title": format!("conductor: run #{}", ctx.run.run_number),
                "head": ctx.run.branch,
                "base": ctx.run.base_branch,
                "body": change_summary,
            }),
            idempotency_key: None,
        },
    )?;

    let entry = outbox_storage::get_outbox_entry(ctx.conn, &result.github_write_id)?;
    if let Some(entry) = entry
        && entry.status == OutboxStatus::Completed
        && let (Some(url), Some(upstream_id)) = (entry.upstream_url.clone(), entry.upstream_id.clone())
    {
        let number = upstream_id.rsplit('/').next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
        runs::set_pr_info(ctx.conn, &ctx.run.id, &url, number, "open")?;
        return Ok(StepOutcome::Advance {
            next_step: STEP_WAIT_PR_MERGE,
        });
    }

    Ok(StepOutcome::AwaitExternal)
}

/// No work here: the run sits until an inbound webhook flips `pr_state`.
async fn wait_pr_merge(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    if ctx.run.pr_state.as_deref() == Some("merged") {
        return Ok(StepOutcome::Advance {
            next_step: STEP_CLEANUP,
        });
    }
    Ok(StepOutcome::AwaitExternal)
}

async fn cleanup(ctx: &StepContext<'_>) -> Result<StepOutcome, ConductorError> {
    if let Some(wt) = worktrees::get_worktree_for_run(ctx.conn, &ctx.run.id)? {
        let mirror_path = ctx.config.repos_dir().join(&ctx.repo.id);
        worktree::destroy_worktree(ctx.conn, &mirror_path, &wt)?;
    }

    Ok(StepOutcome::Transition {
        to: Phase::Completed,
        next_step: None,
    })
}

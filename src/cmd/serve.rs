//! `conductor serve` — boots the HTTP surface (operator API, stream API,
//! webhook ingress), the run-step worker loop, the outbox writer, and the
//! janitor sweeps, then runs until SIGINT/SIGTERM.
//!
//! The HTTP surface is an axum `Router` over `Arc<AppState>`, bound with
//! `tokio::net::TcpListener` and shut down via `with_graceful_shutdown`.
//! The worker loop drives `storage::jobs`' claim/complete/fail lease
//! protocol instead of running phases in-process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use futures::stream::Stream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use conductor::agent::policy::PolicyRule;
use conductor::agent::{AgentProvider, FakeAgentProvider, ToolRegistry};
use conductor::config::Config;
use conductor::errors::ConductorError;
use conductor::operator::{self, RecordOperatorAction};
use conductor::platform::{FakePlatformClient, PlatformClient};
use conductor::storage::models::OperatorActionKind;
use conductor::storage::{Db, jobs};
use conductor::stream::{self, StreamEvent};
use conductor::webhook::{self, IngestWebhook};
use conductor::{janitor, outbox, steps};

const WORKER_QUEUE: &str = "runs";
const WORKER_ID: &str = "conductor-serve";
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(500);
const OUTBOX_WRITE_INTERVAL: Duration = Duration::from_secs(2);
const OUTBOX_BATCH_SIZE: i64 = 10;

struct AppState {
    db: Db,
}

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl From<ConductorError> for ApiError {
    fn from(err: ConductorError) -> Self {
        match err {
            ConductorError::Validation(_) => ApiError::BadRequest(err.to_string()),
            ConductorError::Storage(conductor::errors::StorageError::NotFound { kind, id }) => {
                ApiError::NotFound(format!("{kind} {id} not found"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<conductor::errors::StorageError> for ApiError {
    fn from(err: conductor::errors::StorageError) -> Self {
        match err {
            conductor::errors::StorageError::NotFound { kind, id } => {
                ApiError::NotFound(format!("{kind} {id} not found"))
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/github", post(ingest_webhook))
        .route("/runs/{run_id}/operator-actions", post(record_operator_action))
        .route("/projects/{project_id}/stream", get(project_stream))
        .route("/users/{user_id}/analytics", get(analytics))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ingest_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let delivery_id = headers
        .get("x-github-delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing X-GitHub-Event header".to_string()))?
        .to_string();
    let action = body.get("action").and_then(Value::as_str).map(str::to_string);

    let mut conn = state.db.conn()?;
    webhook::ingest(
        &mut conn,
        IngestWebhook {
            delivery_id: &delivery_id,
            event_type: &event_type,
            action: action.as_deref(),
            body: &body,
        },
    )?;

    Ok(StatusCode::ACCEPTED)
}

#[derive(serde::Deserialize)]
struct OperatorActionRequest {
    action: String,
    actor_id: String,
    actor_display_name: Option<String>,
    comment: Option<String>,
}

async fn record_operator_action(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    Json(input): Json<OperatorActionRequest>,
) -> Result<StatusCode, ApiError> {
    let action = OperatorActionKind::from_str(&input.action)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown action: {}", input.action)))?;

    let mut conn = state.db.conn()?;
    operator::record_operator_action(
        &mut conn,
        RecordOperatorAction {
            run_id: &run_id,
            action,
            actor_id: &input.actor_id,
            actor_type: "operator",
            actor_display_name: input.actor_display_name.as_deref(),
            comment: input.comment.as_deref(),
        },
    )?;

    Ok(StatusCode::ACCEPTED)
}

async fn project_stream(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>>, ApiError> {
    let backlog = {
        let conn = state.db.conn()?;
        stream::replay(&conn, std::slice::from_ref(&project_id), 0)?
    };
    let rx = stream::subscribe(&project_id);

    let backlog_stream = futures::stream::iter(backlog.into_iter().map(to_sse_event));
    let live_stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((to_sse_event(event), rx)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(backlog_stream.chain(live_stream)))
}

fn to_sse_event(event: StreamEvent) -> Result<Event, std::convert::Infallible> {
    Ok(Event::default().json_data(&event).unwrap_or_else(|_| Event::default().data("{}")))
}

async fn analytics(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    use conductor::storage::analytics;

    let conn = state.db.conn()?;
    let totals = analytics::totals(&conn, &user_id)?;
    let avg_cycle_time_seconds = analytics::average_cycle_time_seconds(&conn, &user_id)?;
    let avg_time_in_plan_approval_seconds = analytics::average_time_in_plan_approval_seconds(&conn, &user_id)?;
    let runs_by_phase = analytics::runs_by_phase(&conn, &user_id)?;
    let top_projects = analytics::top_projects_by_run_count(&conn, &user_id)?;
    let completion_histogram_7d = analytics::completion_histogram_7d(&conn, &user_id)?;

    Ok(Json(serde_json::json!({
        "totals": totals,
        "avgCycleTimeSeconds": avg_cycle_time_seconds,
        "avgTimeInPlanApprovalSeconds": avg_time_in_plan_approval_seconds,
        "runsByPhase": runs_by_phase,
        "topProjects": top_projects,
        "completionHistogram7d": completion_histogram_7d,
    })))
}

pub async fn cmd_serve(config: Config, bind: &str) -> Result<()> {
    let db = Db::open(&config.db_path).context("failed to open database")?;
    let cancel = CancellationToken::new();

    let janitor_handle = tokio::spawn(janitor::run(db.clone(), cancel.clone()));
    let worker_handle = tokio::spawn(run_workers(db.clone(), config.clone(), cancel.clone()));
    let outbox_handle = tokio::spawn(run_outbox_writer(db.clone(), cancel.clone()));

    let state = Arc::new(AppState { db: db.clone() });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "conductor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    cancel.cancel();
    let _ = tokio::join!(janitor_handle, worker_handle, outbox_handle);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

/// Claims and drives `run_step` jobs off the `runs` queue until cancelled.
/// Providers/tools/policy are fakes, since real API clients are out of
/// scope (see `agent::provider`/`platform`'s own doc comments), until a
/// real implementation is wired in.
async fn run_workers(db: Db, config: Config, cancel: CancellationToken) {
    let provider: Box<dyn AgentProvider> = Box::new(FakeAgentProvider::repeating("APPROVE\n\nlooks good."));
    let tools = ToolRegistry::new();
    let policy_rules: Vec<Box<dyn PolicyRule>> = conductor::agent::policy::built_in_rules();
    let platform: Box<dyn PlatformClient> = Box::new(FakePlatformClient::new());

    let mut interval = tokio::time::interval(WORKER_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                if let Err(err) = claim_and_run_one(&db, &config, provider.as_ref(), &tools, &policy_rules, platform.as_ref(), &cancel).await {
                    tracing::warn!(%err, "worker tick failed");
                }
            }
        }
    }
}

async fn claim_and_run_one(
    db: &Db,
    config: &Config,
    provider: &dyn AgentProvider,
    tools: &ToolRegistry,
    policy_rules: &[Box<dyn PolicyRule>],
    platform: &dyn PlatformClient,
    cancel: &CancellationToken,
) -> Result<(), ConductorError> {
    let job = {
        let conn = db.conn()?;
        jobs::claim_job(&conn, WORKER_QUEUE, WORKER_ID, jobs::DEFAULT_LEASE_SECS)?
    };
    let Some(job) = job else { return Ok(()) };

    let run_id = job
        .payload
        .get("runId")
        .and_then(Value::as_str)
        .ok_or_else(|| ConductorError::Programmer("run_step job missing runId".to_string()))?
        .to_string();

    let outcome = {
        let conn = db.conn()?;
        let ctx = steps::load_context(&conn, config, provider, tools, policy_rules, platform, cancel, &run_id)?;
        steps::run_step(&ctx).await
    };

    let mut conn = db.conn()?;
    match outcome {
        Ok(outcome) => {
            let run = conductor::storage::runs::get_run(&conn, &run_id)?
                .ok_or_else(|| ConductorError::Storage(conductor::errors::StorageError::NotFound { kind: "run", id: run_id.clone() }))?;
            steps::apply_outcome(&mut conn, &run, outcome)?;
            jobs::complete_job(&conn, &job.id)?;
        }
        Err(err) => {
            tracing::warn!(run_id = %run_id, %err, "run step failed");
            let retry_delay_ms = if err.is_retryable() { 5_000 } else { 0 };
            jobs::fail_job(&conn, &job.id, &err.to_string(), retry_delay_ms)?;
            if !err.is_retryable()
                && let Some(reason) = err.blocked_reason()
                && let Some(run) = conductor::storage::runs::get_run(&conn, &run_id)?
            {
                let _ = steps::apply_outcome(&mut conn, &run, steps::StepOutcome::Blocked {
                    reason,
                    context: serde_json::json!({}),
                });
            }
        }
    }
    Ok(())
}

async fn run_outbox_writer(db: Db, cancel: CancellationToken) {
    let platform = FakePlatformClient::new();
    let mut interval = tokio::time::interval(OUTBOX_WRITE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let conn = match db.conn() {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(%err, "outbox writer failed to check out connection");
                        continue;
                    }
                };
                match outbox::process_outbox_batch(&conn, &platform, OUTBOX_BATCH_SIZE).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(count = n, "outbox batch processed"),
                    Err(err) => tracing::warn!(%err, "outbox batch failed"),
                }
            }
        }
    }
}

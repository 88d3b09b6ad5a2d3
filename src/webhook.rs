//! Webhook ingestion: takes a normalized inbound delivery,
//! records it as an event (idempotent on delivery), and applies the one
//! side effect the pipeline actually depends on — a merged PR waking up
//! a run parked in `wait_pr_merge`. Everything else is logged as a fact
//! for the stream/audit trail and otherwise left alone.

use rusqlite::Connection;
use serde_json::Value;

use crate::errors::StorageError;
use crate::storage::events::{self, CreateEvent};
use crate::storage::webhook::{self, InboundWebhook};
use crate::storage::{jobs, projects, runs};
use crate::steps;
use crate::stream::{self, StreamPayload};

pub struct IngestWebhook<'a> {
    pub delivery_id: &'a str,
    pub event_type: &'a str,
    pub action: Option<&'a str>,
    pub body: &'a Value,
}

/// `true` if the delivery mapped to a recognized event type and was recorded
/// (or already had been, on a retried delivery); `false` if the event type
/// is one we don't track.
pub fn ingest(conn: &mut Connection, input: IngestWebhook<'_>) -> Result<bool, StorageError> {
    let Some(normalized) = webhook::normalize(InboundWebhook {
        delivery_id: input.delivery_id,
        event_type: input.event_type,
        action: input.action,
        body: input.body,
    }) else {
        return Ok(false);
    };

    let repo = normalized
        .repo_node_id
        .as_deref()
        .map(|node_id| projects::get_repo_by_upstream_node_id(conn, node_id))
        .transpose()?
        .flatten();

    let project_id = repo.as_ref().map(|r| r.project_id.clone()).unwrap_or_default();

    events::create_event(
        conn,
        CreateEvent {
            project_id: &project_id,
            run_id: None,
            event_type: &normalized.event_type,
            class: normalized.class,
            payload: normalized.payload.clone(),
            idempotency_key: &normalized.idempotency_key,
            source: webhook::SOURCE,
        },
    )?;

    if normalized.event_type == "pull_request.closed.merged_true"
        && let Some(repo) = repo
        && let Some(number) = normalized.payload.pointer("/pull_request/number").and_then(Value::as_i64)
        && let Some(run) = runs::find_run_by_pr_number(conn, &repo.id, number)?
    {
        apply_pr_merged(conn, &project_id, &run.id)?;
    }

    Ok(true)
}

fn apply_pr_merged(conn: &Connection, project_id: &str, run_id: &str) -> Result<(), StorageError> {
    let run = runs::get_run(conn, run_id)?.ok_or(StorageError::NotFound {
        kind: "run",
        id: run_id.to_string(),
    })?;
    let pr_url = run.pr_url.clone().unwrap_or_default();
    let pr_number = run.pr_number.unwrap_or(0);
    runs::set_pr_info(conn, run_id, &pr_url, pr_number, "merged")?;

    if let Some(step) = run.step.as_deref()
        && step == steps::STEP_WAIT_PR_MERGE
    {
        jobs::create_job(
            conn,
            jobs::CreateJob {
                queue: "runs",
                job_type: "run_step",
                payload: serde_json::json!({ "runId": run_id }),
                idempotency_key: &format!("run_step:{}:{}:{}:pr_merged", run_id, run.phase.as_str(), step),
                priority: 0,
                max_attempts: None,
                run_id: Some(run_id),
                project_id: Some(project_id),
            },
        )?;
    }

    stream::publish(
        conn,
        project_id,
        Some(run_id),
        StreamPayload::RunUpdated {
            run_id: run_id.to_string(),
            fields: vec!["prState".to_string()],
        },
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use crate::storage::runs::CreateRun;
    use serde_json::json;

    fn seed(conn: &Connection) -> (String, String) {
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute("INSERT INTO users (id, email, created_at) VALUES ('usr_1','a@b.com', ?1)", [&now]).unwrap();
        conn.execute(
            "INSERT INTO projects (id, user_id, name, org_installation_id, port_range_start, port_range_end, created_at)
             VALUES ('proj_1','usr_1','p','inst', 3100, 3199, ?1)",
            [&now],
        ).unwrap();
        conn.execute(
            "INSERT INTO repos (id, project_id, upstream_node_id, created_at) VALUES ('repo_1','proj_1','R_node', ?1)",
            [&now],
        ).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, project_id, upstream_node_id, title, created_at, updated_at, last_activity_at)
             VALUES ('task_1','proj_1','issue-1','t', ?1, ?1, ?1)",
            [&now],
        ).unwrap();
        let run = crate::storage::runs::create_run(
            conn,
            CreateRun { task_id: "task_1", project_id: "proj_1", repo_id: "repo_1", policy_set_id: "default", base_branch: "main" },
        )
        .unwrap();
        conn.execute(
            "UPDATE runs SET phase = 'awaiting_review', step = ?1, pr_number = 7 WHERE id = ?2",
            rusqlite::params![steps::STEP_WAIT_PR_MERGE, run.id],
        )
        .unwrap();
        ("proj_1".to_string(), run.id)
    }

    #[test]
    fn unrecognized_event_is_not_ingested() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let ingested = ingest(
            &mut conn,
            IngestWebhook {
                delivery_id: "d1",
                event_type: "star",
                action: Some("created"),
                body: &json!({}),
            },
        )
        .unwrap();
        assert!(!ingested);
    }

    #[test]
    fn merged_pr_wakes_the_waiting_run() {
        let db = Db::open_in_memory().unwrap();
        let mut conn = db.conn().unwrap();
        let (_project_id, run_id) = seed(&conn);

        let body = json!({
            "repository": { "node_id": "R_node" },
            "pull_request": { "node_id": "PR_1", "number": 7, "merged": true },
        });
        let ingested = ingest(
            &mut conn,
            IngestWebhook {
                delivery_id: "d1",
                event_type: "pull_request",
                action: Some("closed"),
                body: &body,
            },
        )
        .unwrap();
        assert!(ingested);

        let run = runs::get_run(&conn, &run_id).unwrap().unwrap();
        assert_eq!(run.pr_state.as_deref(), Some("merged"));

        let job = jobs::get_job_by_idempotency_key(
            &conn,
            &format!("run_step:{}:awaiting_review:{}:pr_merged", run_id, steps::STEP_WAIT_PR_MERGE),
        )
        .unwrap();
        assert!(job.is_some());
    }
}

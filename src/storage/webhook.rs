//! Webhook normalization. Pure: maps an upstream delivery into a
//! canonical event tuple, or reports it as unhandled. Unknown events are
//! never an error — the caller simply skips them.

use serde_json::Value;

use super::models::{EventClass, EventSource};

pub struct InboundWebhook<'a> {
    pub delivery_id: &'a str,
    pub event_type: &'a str,
    pub action: Option<&'a str>,
    pub body: &'a Value,
}

pub struct NormalizedEvent {
    pub event_type: String,
    pub class: EventClass,
    pub idempotency_key: String,
    pub payload: Value,
    pub repo_node_id: Option<String>,
    pub issue_node_id: Option<String>,
    pub pr_node_id: Option<String>,
}

pub const SOURCE: EventSource = EventSource::Webhook;

pub fn normalize(webhook: InboundWebhook<'_>) -> Option<NormalizedEvent> {
    let body = webhook.body;
    let repo_node_id = body
        .pointer("/repository/node_id")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    match (webhook.event_type, webhook.action) {
        ("issues", Some(action @ ("opened" | "closed" | "reopened" | "edited" | "labeled"))) => {
            let issue_node_id = body.pointer("/issue/node_id").and_then(|v| v.as_str())?;
            Some(NormalizedEvent {
                event_type: format!("issue.{}", normalize_action(action)),
                class: EventClass::Fact,
                idempotency_key: format!(
                    "webhook:{}:issue:{}:{}",
                    webhook.delivery_id, issue_node_id, action
                ),
                payload: body.clone(),
                repo_node_id,
                issue_node_id: Some(issue_node_id.to_string()),
                pr_node_id: None,
            })
        }
        ("issue_comment", Some("created")) => {
            let comment_id = body.pointer("/comment/id").and_then(|v| v.as_i64())?;
            let issue_node_id = body.pointer("/issue/node_id").and_then(|v| v.as_str());
            Some(NormalizedEvent {
                event_type: "issue_comment.created".to_string(),
                class: EventClass::Fact,
                idempotency_key: format!(
                    "webhook:{}:comment:{}",
                    webhook.delivery_id, comment_id
                ),
                payload: body.clone(),
                repo_node_id,
                issue_node_id: issue_node_id.map(str::to_string),
                pr_node_id: None,
            })
        }
        ("pull_request", Some(action @ ("opened" | "closed" | "edited"))) => {
            let pr_node_id = body.pointer("/pull_request/node_id").and_then(|v| v.as_str())?;
            let merged = body
                .pointer("/pull_request/merged")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let event_type = if action == "closed" {
                format!("pull_request.closed.merged_{merged}")
            } else {
                format!("pull_request.{action}")
            };
            Some(NormalizedEvent {
                event_type,
                class: EventClass::Signal,
                idempotency_key: format!(
                    "webhook:{}:pr:{}:{}",
                    webhook.delivery_id, pr_node_id, action
                ),
                payload: body.clone(),
                repo_node_id,
                issue_node_id: None,
                pr_node_id: Some(pr_node_id.to_string()),
            })
        }
        ("pull_request_review", _) => {
            let pr_node_id = body.pointer("/pull_request/node_id").and_then(|v| v.as_str())?;
            Some(NormalizedEvent {
                event_type: "pull_request.review".to_string(),
                class: EventClass::Signal,
                idempotency_key: format!("webhook:{}:review:{}", webhook.delivery_id, pr_node_id),
                payload: body.clone(),
                repo_node_id,
                issue_node_id: None,
                pr_node_id: Some(pr_node_id.to_string()),
            })
        }
        ("push", _) => Some(NormalizedEvent {
            event_type: "push".to_string(),
            class: EventClass::Signal,
            idempotency_key: format!("webhook:{}:push", webhook.delivery_id),
            payload: body.clone(),
            repo_node_id,
            issue_node_id: None,
            pr_node_id: None,
        }),
        ("check_run", Some("completed")) => {
            let check_run_id = body.pointer("/check_run/id").and_then(|v| v.as_i64())?;
            Some(NormalizedEvent {
                event_type: "check_run.completed".to_string(),
                class: EventClass::Signal,
                idempotency_key: format!(
                    "webhook:{}:check_run:{}",
                    webhook.delivery_id, check_run_id
                ),
                payload: body.clone(),
                repo_node_id,
                issue_node_id: None,
                pr_node_id: None,
            })
        }
        ("installation", Some(action @ ("created" | "deleted"))) => {
            let installation_id = body.pointer("/installation/id").and_then(|v| v.as_i64())?;
            Some(NormalizedEvent {
                event_type: format!("installation.{action}"),
                class: EventClass::Fact,
                idempotency_key: format!(
                    "webhook:{}:installation:{}:{}",
                    webhook.delivery_id, installation_id, action
                ),
                payload: body.clone(),
                repo_node_id,
                issue_node_id: None,
                pr_node_id: None,
            })
        }
        ("installation_repositories", Some(action @ ("added" | "removed"))) => {
            let installation_id = body.pointer("/installation/id").and_then(|v| v.as_i64())?;
            Some(NormalizedEvent {
                event_type: format!("installation_repositories.{action}"),
                class: EventClass::Fact,
                idempotency_key: format!(
                    "webhook:{}:installation:{}:{}",
                    webhook.delivery_id, installation_id, action
                ),
                payload: body.clone(),
                repo_node_id,
                issue_node_id: None,
                pr_node_id: None,
            })
        }
        _ => None,
    }
}

fn normalize_action(action: &str) -> &str {
    action
}

//! The agent tool loop: drives one invocation through
//! prompt -> response -> tool calls -> next prompt, persisting every turn.

use std::path::PathBuf;

use rusqlite::Connection;
use tokio_util::sync::CancellationToken;

use crate::errors::ConductorError;
use crate::redact::redact_value;
use crate::storage::agent as storage;
use crate::storage::models::{AgentInvocation, ToolInvocationStatus};
use crate::storage::runs;
use crate::stream::{self, StreamPayload};

use super::policy::{self, PolicyRule};
use super::provider::{AgentError, AgentProvider, InvokeRequest, StopReason};
use super::tool::ToolRegistry;

pub const MESSAGE_SIZE_GUARD_BYTES: usize = 512 * 1024;
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

pub struct LoopConfig {
    pub max_iterations: u32,
    pub message_size_guard_bytes: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            message_size_guard_bytes: MESSAGE_SIZE_GUARD_BYTES,
        }
    }
}

pub struct RunInvocationInput<'a> {
    pub run_id: &'a str,
    pub project_id: &'a str,
    pub step: &'a str,
    pub system_prompt: String,
    pub user_prompt: String,
    pub worktree_path: PathBuf,
    /// Per-agent provider call timeout: planner 300s, reviewer 180s,
    /// implementer 600s. `None` lets the provider use its own default.
    pub timeout_ms: Option<u64>,
}

/// Guards oversized message content: content past the limit is replaced
/// with a stub shaped the way the provider expects for `role` (a plain
/// string for `system`/`user`, a `text` content block for `assistant`, a
/// `tool_result` content block for `tool`). The returned byte count is the
/// size of what actually gets persisted, stub included.
fn guard_content(role: &str, content: &str, limit: usize) -> (String, i64) {
    let size = content.len();
    if size <= limit {
        return (content.to_string(), size as i64);
    }

    let omitted = format!("[message body omitted: {size} bytes exceeds the {limit} byte guard]");
    let stub = match role {
        "assistant" => serde_json::to_string(&serde_json::json!([
            { "type": "text", "text": omitted }
        ]))
        .unwrap_or(omitted),
        "tool" => serde_json::to_string(&serde_json::json!([
            { "type": "tool_result", "tool_use_id": "truncated", "content": omitted }
        ]))
        .unwrap_or(omitted),
        _ => omitted,
    };
    let stub_size = stub.len() as i64;
    (stub, stub_size)
}

fn map_agent_error(err: AgentError) -> ConductorError {
    use crate::errors::TransientError;
    match err {
        AgentError::RateLimit { retry_after_ms } => TransientError::RateLimit { retry_after_ms }.into(),
        AgentError::Timeout { agent, action, timeout_ms } => {
            TransientError::Timeout { agent, action, timeout_ms }.into()
        }
        AgentError::Cancelled => ConductorError::Other(anyhow::anyhow!("cancelled")),
        other => ConductorError::Other(anyhow::anyhow!(other.to_string())),
    }
}

fn check_cancelled(conn: &Connection, run_id: &str, cancel: &CancellationToken) -> Result<(), ConductorError> {
    if cancel.is_cancelled() {
        return Err(ConductorError::Other(anyhow::anyhow!("cancelled")));
    }
    if let Some(run) = runs::get_run(conn, run_id)?
        && (run.phase.is_terminal() || run.phase == crate::storage::models::Phase::Blocked)
    {
        return Err(ConductorError::Other(anyhow::anyhow!(
            "run {run_id} left phase mid-invocation (now {})",
            run.phase.as_str()
        )));
    }
    Ok(())
}

/// Drives a single agent invocation end to end, persisting every message
/// and tool call. Returns the completed (or failed) invocation row; a
/// terminal provider/policy/cancellation error is both recorded on the
/// invocation and returned to the caller.
pub async fn run_invocation(
    conn: &Connection,
    provider: &dyn AgentProvider,
    tools: &ToolRegistry,
    policy_rules: &[Box<dyn PolicyRule>],
    cancel: &CancellationToken,
    config: &LoopConfig,
    input: RunInvocationInput<'_>,
) -> Result<AgentInvocation, ConductorError> {
    let invocation = storage::create_invocation(conn, input.run_id, input.step)?;

    let (sys_content, sys_size) = guard_content("system", &input.system_prompt, config.message_size_guard_bytes);
    storage::append_message_with_size(conn, &invocation.id, "system", &sys_content, sys_size)?;
    let (user_content, user_size) = guard_content("user", &input.user_prompt, config.message_size_guard_bytes);
    storage::append_message_with_size(conn, &invocation.id, "user", &user_content, user_size)?;

    let mut tokens_input_total = 0i64;
    let mut tokens_output_total = 0i64;
    let mut duration_total = 0i64;

    for iteration in 0..config.max_iterations {
        if let Err(err) = check_cancelled(conn, input.run_id, cancel) {
            storage::fail_invocation(conn, &invocation.id, &err.to_string())?;
            return Err(err);
        }

        let history = storage::list_messages(conn, &invocation.id)?
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect::<Vec<_>>();

        let request = InvokeRequest {
            system_prompt: input.system_prompt.clone(),
            user_prompt: input.user_prompt.clone(),
            messages: history,
            tools: tools.names(),
            max_tokens: None,
            temperature: None,
            timeout_ms: input.timeout_ms,
        };

        let response = match provider.invoke(request).await {
            Ok(r) => r,
            Err(err) => {
                let mapped = map_agent_error(err);
                storage::fail_invocation(conn, &invocation.id, &mapped.to_string())?;
                stream::publish(
                    conn,
                    input.project_id,
                    Some(input.run_id),
                    StreamPayload::AgentInvocation {
                        run_id: input.run_id.to_string(),
                        step: input.step.to_string(),
                        status: "failed".to_string(),
                    },
                );
                return Err(mapped);
            }
        };

        tokens_input_total += response.tokens_input;
        tokens_output_total += response.tokens_output;
        duration_total += response.duration_ms as i64;

        let (assistant_content, assistant_size) =
            guard_content("assistant", &response.content, config.message_size_guard_bytes);
        storage::append_message_with_size(conn, &invocation.id, "assistant", &assistant_content, assistant_size)?;

        if response.stop_reason != StopReason::ToolUse || response.tool_calls.is_empty() {
            storage::complete_invocation(conn, &invocation.id, tokens_input_total, tokens_output_total, duration_total)?;
            stream::publish(
                conn,
                input.project_id,
                Some(input.run_id),
                StreamPayload::AgentInvocation {
                    run_id: input.run_id.to_string(),
                    step: input.step.to_string(),
                    status: "completed".to_string(),
                },
            );
            return storage::get_invocation(conn, &invocation.id)?.ok_or(crate::errors::StorageError::NotFound {
                kind: "agent invocation",
                id: invocation.id,
            }.into());
        }

        for call in &response.tool_calls {
            check_cancelled(conn, input.run_id, cancel).inspect_err(|e| {
                let _ = storage::fail_invocation(conn, &invocation.id, &e.to_string());
            })?;

            let redacted = redact_value(&call.arguments, &[], &[], None);
            let verdict = policy::evaluate(policy_rules, &call.name, &call.arguments, &input.worktree_path);

            let tool_invocation = storage::create_tool_invocation(
                conn,
                storage::NewToolInvocation {
                    invocation_id: &invocation.id,
                    tool_name: &call.name,
                    args_redacted: serde_json::from_str(&redacted.canonical_json).unwrap_or_default(),
                    payload_hash: &redacted.hash,
                    policy_id: verdict.policy_id,
                    status: if verdict.blocked {
                        ToolInvocationStatus::Blocked
                    } else {
                        ToolInvocationStatus::Started
                    },
                },
            )?;

            if verdict.blocked {
                let reason = verdict.reason.clone().unwrap_or_default();
                let (content, size) = guard_content(
                    "tool",
                    &format!("error: tool call blocked by policy: {reason}"),
                    config.message_size_guard_bytes,
                );
                storage::append_message_with_size(conn, &invocation.id, "tool", &content, size)?;
                continue;
            }

            let started = std::time::Instant::now();
            let result = match tools.get(&call.name) {
                Some(tool) => tool.execute(&input.worktree_path, &call.arguments).await,
                None => Err(super::tool::ToolError::Failed(format!("unknown tool '{}'", call.name))),
            };
            let duration_ms = started.elapsed().as_millis() as i64;

            let message_content = match &result {
                Ok(value) => value.to_string(),
                Err(err) => format!("error: {err}"),
            };
            let (tool_result_content, size) =
                guard_content("tool", &message_content, config.message_size_guard_bytes);
            storage::append_message_with_size(conn, &invocation.id, "tool", &tool_result_content, size)?;

            match result {
                Ok(_) => storage::complete_tool_invocation(conn, &tool_invocation.id, duration_ms)?,
                Err(err) => storage::fail_tool_invocation(conn, &tool_invocation.id, &err.to_string())?,
            }
        }

        if iteration + 1 == config.max_iterations {
            storage::fail_invocation(conn, &invocation.id, "max_iterations exceeded")?;
            return Err(map_agent_error(AgentError::MaxIterations));
        }
    }

    storage::fail_invocation(conn, &invocation.id, "max_iterations exceeded")?;
    Err(map_agent_error(AgentError::MaxIterations))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undersized_content_passes_through_unchanged() {
        let (content, size) = guard_content("user", "hello", 1024);
        assert_eq!(content, "hello");
        assert_eq!(size, 5);
    }

    #[test]
    fn oversized_system_content_is_a_plain_string_stub() {
        let (content, size) = guard_content("system", &"a".repeat(100), 10);
        assert!(content.starts_with("[message body omitted:"));
        assert_eq!(size, content.len() as i64);
    }

    #[test]
    fn oversized_assistant_content_is_a_text_block() {
        let (content, size) = guard_content("assistant", &"a".repeat(100), 10);
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed[0]["type"], "text");
        assert!(parsed[0]["text"].as_str().unwrap().starts_with("[message body omitted:"));
        assert_eq!(size, content.len() as i64);
    }

    #[test]
    fn oversized_tool_content_is_a_tool_result_block() {
        let (content, size) = guard_content("tool", &"a".repeat(100), 10);
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed[0]["type"], "tool_result");
        assert_eq!(parsed[0]["tool_use_id"], "truncated");
        assert!(parsed[0]["content"].as_str().unwrap().starts_with("[message body omitted:"));
        assert_eq!(size, content.len() as i64);
    }
}

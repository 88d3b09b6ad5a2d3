//! A tool call blocked by policy doesn't fail the invocation: the agent
//! sees an error tool result, the blocked call is recorded, and the loop
//! runs to completion.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use conductor::agent::{
    FakeAgentProvider, InvokeResponse, LoopConfig, RunInvocationInput, StopReason, Tool, ToolCall,
    ToolError, ToolRegistry, run_invocation,
};
use conductor::agent::policy::{self, PolicyRule};
use conductor::storage::Db;

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn execute(&self, _worktree_path: &Path, args: &Value) -> Result<Value, ToolError> {
        Ok(args.clone())
    }
}

struct AlwaysBlock;

impl PolicyRule for AlwaysBlock {
    fn id(&self) -> &'static str {
        "always_block"
    }

    fn evaluate(&self, _tool_name: &str, _arguments: &Value, _worktree_path: &Path) -> Option<String> {
        Some("blocked for testing".to_string())
    }
}

fn seed_run(conn: &rusqlite::Connection) {
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO runs (id, task_id, project_id, repo_id, policy_set_id, run_number, phase, base_branch, branch, created_at)
         VALUES ('run_1','task_1','proj_1','repo_1','default',1,'executing','main','b', ?1)",
        [&now],
    )
    .unwrap();
}

#[tokio::test]
async fn blocked_call_is_recorded_and_the_loop_reaches_end_turn() {
    let db = Db::open_in_memory().unwrap();
    let conn = db.conn().unwrap();
    seed_run(&conn);

    let provider = FakeAgentProvider::new(vec![
        InvokeResponse {
            content: "calling echo".to_string(),
            tokens_input: 5,
            tokens_output: 5,
            stop_reason: StopReason::ToolUse,
            duration_ms: 1,
            tool_calls: vec![ToolCall {
                id: "call_1".to_string(),
                name: "echo".to_string(),
                arguments: json!({ "path": "src/lib.rs" }),
            }],
        },
        InvokeResponse {
            content: "done".to_string(),
            tokens_input: 2,
            tokens_output: 2,
            stop_reason: StopReason::EndTurn,
            duration_ms: 1,
            tool_calls: vec![],
        },
    ]);
    let mut tools = ToolRegistry::new();
    tools.register(Box::new(EchoTool));
    let rules: Vec<Box<dyn PolicyRule>> = vec![Box::new(AlwaysBlock)];
    let cancel = CancellationToken::new();

    let invocation = run_invocation(
        &conn,
        &provider,
        &tools,
        &rules,
        &cancel,
        &LoopConfig::default(),
        RunInvocationInput {
            run_id: "run_1",
            project_id: "proj_1",
            step: "implementer_apply_changes",
            system_prompt: "be careful".to_string(),
            user_prompt: "implement the feature".to_string(),
            worktree_path: std::env::temp_dir(),
            timeout_ms: None,
        },
    )
    .await
    .unwrap();

    assert_eq!(invocation.status, conductor::storage::models::InvocationStatus::Completed);

    let (status, policy_id): (String, Option<String>) = conn
        .query_row(
            "SELECT status, policy_id FROM tool_invocations WHERE invocation_id = ?1",
            [&invocation.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(status, "blocked");
    assert_eq!(policy_id.as_deref(), Some("always_block"));

    let tool_message: String = conn
        .query_row(
            "SELECT content FROM agent_messages WHERE invocation_id = ?1 AND role = 'tool'",
            [&invocation.id],
            |row| row.get(0),
        )
        .unwrap();
    assert!(tool_message.to_lowercase().contains("error"));
}

#[test]
fn built_in_rules_are_non_empty() {
    assert!(!policy::built_in_rules().is_empty());
}

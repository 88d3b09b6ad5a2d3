//! Agent runtime: the model-provider boundary, the tool registry and policy
//! engine that gate tool calls, and the loop that drives a single
//! invocation through to completion. The provider is a pluggable
//! `AgentProvider` trait rather than a fixed subprocess call, so the loop
//! can be driven by a `FakeAgentProvider` in tests.

pub mod credentials;
pub mod fake_provider;
pub mod loop_;
pub mod policy;
pub mod provider;
pub mod tool;

pub use fake_provider::FakeAgentProvider;
pub use loop_::{LoopConfig, RunInvocationInput, run_invocation};
pub use provider::{AgentError, AgentProvider, InvokeRequest, InvokeResponse, StopReason, ToolCall};
pub use tool::{Tool, ToolError, ToolRegistry};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Db;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

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

    fn seed_run(conn: &rusqlite::Connection) {
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO runs (id, task_id, project_id, repo_id, policy_set_id, run_number, phase, base_branch, branch, created_at)
             VALUES ('run_1','task_1','proj_1','repo_1','default',1,'executing','main','b', ?1)",
            [&now],
        ).unwrap();
    }

    #[tokio::test]
    async fn invocation_completes_without_tool_calls() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        seed_run(&conn);

        let provider = FakeAgentProvider::single_response("done");
        let tools = ToolRegistry::new();
        let rules = policy::built_in_rules();
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

        assert_eq!(invocation.status, crate::storage::models::InvocationStatus::Completed);
    }

    #[tokio::test]
    async fn blocked_tool_call_does_not_fail_the_invocation() {
        let db = Db::open_in_memory().unwrap();
        let conn = db.conn().unwrap();
        seed_run(&conn);

        let provider = FakeAgentProvider::new(vec![
            InvokeResponse {
                content: "writing a secret file".to_string(),
                tokens_input: 5,
                tokens_output: 5,
                stop_reason: StopReason::ToolUse,
                duration_ms: 1,
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "write_file".to_string(),
                    arguments: json!({ "path": ".env" }),
                }],
            },
            InvokeResponse {
                content: "understood, stopping here".to_string(),
                tokens_input: 2,
                tokens_output: 2,
                stop_reason: StopReason::EndTurn,
                duration_ms: 1,
                tool_calls: vec![],
            },
        ]);
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(EchoTool));
        let rules = policy::built_in_rules();
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

        assert_eq!(invocation.status, crate::storage::models::InvocationStatus::Completed);

        let (status, policy_id): (String, Option<String>) = conn
            .query_row(
                "SELECT status, policy_id FROM tool_invocations WHERE invocation_id = ?1",
                [&invocation.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(status, "blocked");
        assert!(policy_id.is_some());

        let tool_message: String = conn
            .query_row(
                "SELECT content FROM agent_messages WHERE invocation_id = ?1 AND role = 'tool'",
                [&invocation.id],
                |row| row.get(0),
            )
            .unwrap();
        assert!(tool_message.starts_with("error:"));
    }

    #[tokio::test]
    async fn allowed_tool_call_executes_and_loop_continues() {
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
        let rules = policy::built_in_rules();
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

        assert_eq!(invocation.status, crate::storage::models::InvocationStatus::Completed);
        assert_eq!(invocation.tokens_input, 7);
    }
}

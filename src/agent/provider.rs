//! The model-provider boundary. Real API clients are out of scope; this
//! trait is the seam `loop_::run_invocation` depends on.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub messages: Vec<(String, String)>,
    pub tools: Vec<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

#[derive(Debug, Clone)]
pub struct InvokeResponse {
    pub content: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub stop_reason: StopReason,
    pub duration_ms: u64,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("auth_error")]
    AuthError,
    #[error("rate_limit, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },
    #[error("context_length exceeded")]
    ContextLength,
    #[error("unsupported_provider: {0}")]
    UnsupportedProvider(String),
    #[error("timeout after {timeout_ms}ms during {action} for agent {agent}")]
    Timeout {
        agent: String,
        action: String,
        timeout_ms: u64,
    },
    #[error("cancelled")]
    Cancelled,
    #[error("max_iterations exceeded")]
    MaxIterations,
    #[error("agent_error: {0}")]
    AgentError(String),
}

#[async_trait]
pub trait AgentProvider: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse, AgentError>;
}

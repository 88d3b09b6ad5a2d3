//! Deterministic scripted provider used by tests and by `conductor serve`
//! until a real model-backed provider is wired in.

use std::sync::Mutex;

use async_trait::async_trait;

use super::provider::{AgentError, AgentProvider, InvokeRequest, InvokeResponse, StopReason};

pub struct FakeAgentProvider {
    scripted: Mutex<Vec<InvokeResponse>>,
    /// When set, replayed forever once `scripted` runs dry instead of erroring.
    repeat: Option<InvokeResponse>,
}

impl FakeAgentProvider {
    pub fn new(scripted: Vec<InvokeResponse>) -> Self {
        Self {
            scripted: Mutex::new(scripted),
            repeat: None,
        }
    }

    pub fn single_response(content: &str) -> Self {
        Self::new(vec![response(content)])
    }

    /// Returns the same response to every invocation, used by `cmd::serve`
    /// to stand in for a real provider until one is wired in.
    pub fn repeating(content: &str) -> Self {
        Self {
            scripted: Mutex::new(Vec::new()),
            repeat: Some(response(content)),
        }
    }
}

fn response(content: &str) -> InvokeResponse {
    InvokeResponse {
        content: content.to_string(),
        tokens_input: 10,
        tokens_output: 10,
        stop_reason: StopReason::EndTurn,
        duration_ms: 1,
        tool_calls: Vec::new(),
    }
}

#[async_trait]
impl AgentProvider for FakeAgentProvider {
    async fn invoke(&self, _request: InvokeRequest) -> Result<InvokeResponse, AgentError> {
        let mut scripted = self.scripted.lock().unwrap();
        if !scripted.is_empty() {
            return Ok(scripted.remove(0));
        }
        if let Some(repeat) = &self.repeat {
            return Ok(repeat.clone());
        }
        Err(AgentError::AgentError("fake provider script exhausted".to_string()))
    }
}

//! The upstream platform client interface: a small trait, with real API
//! calls out of scope. The outbox write worker depends only on this
//! trait; `FakePlatformClient` is used by tests and by `cmd::serve`
//! until a real implementation is wired in.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("upstream rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("upstream auth error")]
    Auth,
    #[error("upstream server error: {0}")]
    Server(String),
}

pub struct WriteResult {
    pub upstream_id: String,
    pub upstream_url: String,
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    async fn write(&self, kind: &str, target_node_id: &str, payload: &Value) -> Result<WriteResult, PlatformError>;
}

/// Deterministic in-memory stand-in. Records every write it sees and
/// manufactures a stable fake `upstream_id`/`upstream_url` pair.
pub struct FakePlatformClient {
    writes: Mutex<Vec<(String, String, Value)>>,
}

impl FakePlatformClient {
    pub fn new() -> Self {
        Self {
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<(String, String, Value)> {
        self.writes.lock().unwrap().clone()
    }
}

impl Default for FakePlatformClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformClient for FakePlatformClient {
    async fn write(&self, kind: &str, target_node_id: &str, payload: &Value) -> Result<WriteResult, PlatformError> {
        self.writes
            .lock()
            .unwrap()
            .push((kind.to_string(), target_node_id.to_string(), payload.clone()));
        Ok(WriteResult {
            upstream_id: format!("fake_{kind}_{target_node_id}"),
            upstream_url: format!("https://example.invalid/{kind}/{target_node_id}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fake_client_records_writes() {
        let client = FakePlatformClient::new();
        client.write("comment", "I_1", &json!({ "body": "hi" })).await.unwrap();
        assert_eq!(client.writes().len(), 1);
    }
}

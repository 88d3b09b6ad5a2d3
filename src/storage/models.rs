//! Domain entities. Plain serde structs with hand-rolled `as_str`/`from_str`
//! enum conversions for their DB-stored string columns, rather than pulling
//! in `strum`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Planning,
    AwaitingPlanApproval,
    Executing,
    AwaitingReview,
    Blocked,
    Completed,
    Cancelled,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Planning => "planning",
            Phase::AwaitingPlanApproval => "awaiting_plan_approval",
            Phase::Executing => "executing",
            Phase::AwaitingReview => "awaiting_review",
            Phase::Blocked => "blocked",
            Phase::Completed => "completed",
            Phase::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Phase::Pending,
            "planning" => Phase::Planning,
            "awaiting_plan_approval" => Phase::AwaitingPlanApproval,
            "executing" => Phase::Executing,
            "awaiting_review" => Phase::AwaitingReview,
            "blocked" => Phase::Blocked,
            "completed" => Phase::Completed,
            "cancelled" => Phase::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Active,
    Paused,
    Blocked,
    Finished,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Paused => "paused",
            RunStatus::Blocked => "blocked",
            RunStatus::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub task_id: String,
    pub project_id: String,
    pub repo_id: String,
    pub policy_set_id: String,
    pub run_number: i64,
    pub phase: Phase,
    pub step: Option<String>,
    pub base_branch: String,
    pub branch: String,
    pub next_sequence: i64,
    pub last_event_sequence: i64,
    pub paused_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<String>,
    pub blocked_context: Option<Value>,
    pub plan_revisions: i64,
    pub test_fix_attempts: i64,
    pub review_rounds: i64,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_state: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Derived status: `pausedAt` overrides to `paused`; `blocked` phase
    /// yields `blocked`; terminal phases yield `finished`; otherwise
    /// `active`.
    pub fn status(&self) -> RunStatus {
        if self.paused_at.is_some() {
            RunStatus::Paused
        } else if self.phase == Phase::Blocked {
            RunStatus::Blocked
        } else if self.phase.is_terminal() {
            RunStatus::Finished
        } else {
            RunStatus::Active
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventClass {
    Fact,
    Decision,
    Signal,
}

impl EventClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventClass::Fact => "fact",
            EventClass::Decision => "decision",
            EventClass::Signal => "signal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "fact" => EventClass::Fact,
            "decision" => EventClass::Decision,
            "signal" => EventClass::Signal,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Webhook,
    ToolLayer,
    Orchestrator,
    Operator,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Webhook => "webhook",
            EventSource::ToolLayer => "tool_layer",
            EventSource::Orchestrator => "orchestrator",
            EventSource::Operator => "operator",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "webhook" => EventSource::Webhook,
            "tool_layer" => EventSource::ToolLayer,
            "orchestrator" => EventSource::Orchestrator,
            "operator" => EventSource::Operator,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub project_id: String,
    pub run_id: Option<String>,
    pub event_type: String,
    pub class: EventClass,
    pub payload: Value,
    pub sequence: Option<i64>,
    pub idempotency_key: String,
    pub source: EventSource,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "dead" => JobStatus::Dead,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub idempotency_key: String,
    pub status: JobStatus,
    pub priority: i64,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
    pub project_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactKind {
    Plan,
    Review,
    TestReport,
    Other,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Plan => "plan",
            ArtifactKind::Review => "review",
            ArtifactKind::TestReport => "test_report",
            ArtifactKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub kind: String,
    pub version: i64,
    pub content: String,
    pub checksum: String,
    pub validation_status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Queued => "queued",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Completed => "completed",
            OutboxStatus::Failed => "failed",
            OutboxStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => OutboxStatus::Queued,
            "processing" => OutboxStatus::Processing,
            "completed" => OutboxStatus::Completed,
            "failed" => OutboxStatus::Failed,
            "cancelled" => OutboxStatus::Cancelled,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: String,
    pub run_id: String,
    pub kind: String,
    pub target_node_id: String,
    pub target_type: String,
    pub payload: Value,
    pub payload_hash: String,
    pub idempotency_key: String,
    pub status: OutboxStatus,
    pub retry_count: i64,
    pub sent_at: Option<DateTime<Utc>>,
    pub upstream_id: Option<String>,
    pub upstream_url: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorktreeStatus {
    Active,
    Destroyed,
}

impl WorktreeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorktreeStatus::Active => "active",
            WorktreeStatus::Destroyed => "destroyed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "active" => WorktreeStatus::Active,
            "destroyed" => WorktreeStatus::Destroyed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worktree {
    pub id: String,
    pub run_id: String,
    pub project_id: String,
    pub repo_id: String,
    pub path: String,
    pub branch: String,
    pub base_commit: String,
    pub status: WorktreeStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortLease {
    pub id: String,
    pub project_id: String,
    pub worktree_id: String,
    pub port: i64,
    pub purpose: String,
    pub is_active: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorActionKind {
    ApprovePlan,
    RevisePlan,
    RejectRun,
    Retry,
    Pause,
    Resume,
    Cancel,
    GrantPolicyException,
    DenyPolicyException,
    StartRun,
}

impl OperatorActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorActionKind::ApprovePlan => "approve_plan",
            OperatorActionKind::RevisePlan => "revise_plan",
            OperatorActionKind::RejectRun => "reject_run",
            OperatorActionKind::Retry => "retry",
            OperatorActionKind::Pause => "pause",
            OperatorActionKind::Resume => "resume",
            OperatorActionKind::Cancel => "cancel",
            OperatorActionKind::GrantPolicyException => "grant_policy_exception",
            OperatorActionKind::DenyPolicyException => "deny_policy_exception",
            OperatorActionKind::StartRun => "start_run",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "approve_plan" => OperatorActionKind::ApprovePlan,
            "revise_plan" => OperatorActionKind::RevisePlan,
            "reject_run" => OperatorActionKind::RejectRun,
            "retry" => OperatorActionKind::Retry,
            "pause" => OperatorActionKind::Pause,
            "resume" => OperatorActionKind::Resume,
            "cancel" => OperatorActionKind::Cancel,
            "grant_policy_exception" => OperatorActionKind::GrantPolicyException,
            "deny_policy_exception" => OperatorActionKind::DenyPolicyException,
            "start_run" => OperatorActionKind::StartRun,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Running => "running",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "running" => InvocationStatus::Running,
            "completed" => InvocationStatus::Completed,
            "failed" => InvocationStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInvocation {
    pub id: String,
    pub run_id: String,
    pub step: String,
    pub status: InvocationStatus,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub invocation_id: String,
    pub turn_index: i64,
    pub role: String,
    pub content: String,
    pub content_size_bytes: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolInvocationStatus {
    Started,
    Blocked,
    Completed,
    Failed,
}

impl ToolInvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolInvocationStatus::Started => "started",
            ToolInvocationStatus::Blocked => "blocked",
            ToolInvocationStatus::Completed => "completed",
            ToolInvocationStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "started" => ToolInvocationStatus::Started,
            "blocked" => ToolInvocationStatus::Blocked,
            "completed" => ToolInvocationStatus::Completed,
            "failed" => ToolInvocationStatus::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub invocation_id: String,
    pub tool_name: String,
    pub args_redacted: Value,
    pub payload_hash: String,
    pub policy_id: Option<String>,
    pub status: ToolInvocationStatus,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub org_installation_id: String,
    pub port_range_start: i64,
    pub port_range_end: i64,
    pub default_base_branch: Option<String>,
    pub default_policy_set_id: String,
    pub test_command: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: String,
    pub project_id: String,
    pub upstream_node_id: String,
    pub clone_url: String,
    pub clone_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn row_to_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or(Value::Null)
}

pub(crate) fn parse_json_column(raw: &str) -> Value {
    row_to_value(raw)
}

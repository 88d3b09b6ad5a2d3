//! Error taxonomy.
//!
//! `thiserror`-derived enums with `#[source]`/`#[from]`, collapsed to the
//! five classes the engine actually needs to distinguish at runtime:
//! transient (retryable by the queue), validation, configuration, policy, and
//! programmer errors (duplicate idempotency keys surfaced, never swallowed).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("transient error: {0}")]
    Transient(#[from] TransientError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("programmer error: {0}")]
    Programmer(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConductorError {
    /// Whether the queue should retry the job that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConductorError::Transient(_))
    }

    /// The machine-readable reason recorded on a run transitioned to `blocked`,
    /// if this error should block rather than retry.
    pub fn blocked_reason(&self) -> Option<String> {
        match self {
            ConductorError::Configuration(e) => Some(e.reason_code().to_string()),
            ConductorError::Validation(e) => Some(e.reason_code().to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransientError {
    #[error("lease expired")]
    LeaseExpired,
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimit { retry_after_ms: u64 },
    #[error("agent '{agent}' timed out during {action} after {timeout_ms}ms")]
    Timeout {
        agent: String,
        action: String,
        timeout_ms: u64,
    },
    #[error("upstream returned a 5xx error: {0}")]
    UpstreamServerError(String),
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("unknown operator action: {0}")]
    UnknownAction(String),
    #[error("invalid git ref name: {0}")]
    InvalidRefName(String),
    #[error("payload exceeds the {limit_bytes} byte guard")]
    PayloadTooLarge { limit_bytes: usize },
    #[error("operator action '{action}' is not valid while phase is '{phase}'")]
    ActionNotValidForPhase { action: String, phase: String },
}

impl ValidationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ValidationError::InvalidTransition { .. } => "invalid_transition",
            ValidationError::UnknownAction(_) => "unknown_action",
            ValidationError::InvalidRefName(_) => "invalid_ref_name",
            ValidationError::PayloadTooLarge { .. } => "payload_too_large",
            ValidationError::ActionNotValidForPhase { .. } => "action_not_valid_for_phase",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("no credentials configured for this step")]
    MissingCredentials,
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
}

impl ConfigurationError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigurationError::MissingCredentials => "missing_credentials",
            ConfigurationError::UnsupportedProvider(_) => "unsupported_provider",
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("blocked by policy '{policy_id}': {reason}")]
    Blocked { policy_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error("no such {kind} with id {id}")]
    NotFound { kind: &'static str, id: String },
}

pub type Result<T> = std::result::Result<T, ConductorError>;

//! Credential resolution for agent invocations. Real GitHub App / OAuth
//! flows are out of scope; this exists so the tool loop fails fast with a
//! clear configuration error when no credentials are present.

use crate::errors::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    None,
    AiProvider { provider: String, api_key: String },
    GithubInstallation { token: String },
}

/// Resolves from environment variables, preferring an AI provider key over
/// a GitHub installation token when both happen to be configured (agent
/// invocations need the former; GitHub writes need the latter).
pub fn resolve_ai_provider_credentials() -> Result<Credentials, ConfigurationError> {
    if let Ok(api_key) = std::env::var("CONDUCTOR_AI_API_KEY") {
        let provider = std::env::var("CONDUCTOR_AI_PROVIDER").unwrap_or_else(|_| "anthropic".to_string());
        return Ok(Credentials::AiProvider { provider, api_key });
    }
    Err(ConfigurationError::MissingCredentials)
}

pub fn resolve_github_credentials() -> Result<Credentials, ConfigurationError> {
    if let Ok(token) = std::env::var("CONDUCTOR_GITHUB_TOKEN") {
        return Ok(Credentials::GithubInstallation { token });
    }
    Err(ConfigurationError::MissingCredentials)
}

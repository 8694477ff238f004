//! GitHub App authentication seam.
//!
//! GitHub App JWT minting and installation-token exchange are explicitly
//! out of scope for the core pipeline; this crate defines only the
//! [`AuthProvider`] collaborator trait the executor calls against, plus two
//! lightweight implementations in the spirit of `shipper_auth::resolve_token`'s
//! layered, environment-first resolution — without the credentials-file
//! fallback, since there is no cargo-style `credentials.toml` in this
//! domain.

use chrono::{DateTime, Utc};

/// Executor collaborator resolving an installation token scoped to a repo.
///
/// Implementations should return a [`agentrelay_retry::non_retryable`]
/// error when the rejection is authorization-related (per the design's
/// §4.5 step 1: "Failures are non-retryable if authorization was rejected,
/// retryable on transport errors").
pub trait AuthProvider: Send + Sync {
    fn installation_token(&self, owner: &str, repo: &str) -> anyhow::Result<(String, DateTime<Utc>)>;
}

/// Returns a fixed token with a fixed lifetime. The default choice for
/// tests and for deployments that front agentrelay with an externally
/// managed token (e.g. a sidecar that handles JWT exchange out of process).
pub struct StaticTokenAuth {
    token: String,
    ttl: chrono::Duration,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>, ttl: chrono::Duration) -> Self {
        Self {
            token: token.into(),
            ttl,
        }
    }
}

impl AuthProvider for StaticTokenAuth {
    fn installation_token(&self, _owner: &str, _repo: &str) -> anyhow::Result<(String, DateTime<Utc>)> {
        Ok((self.token.clone(), Utc::now() + self.ttl))
    }
}

/// Reads the installation token from `GITHUB_INSTALLATION_TOKEN`. A stand-in
/// for the real JWT-minting flow, which this crate does not implement.
pub struct EnvTokenAuth {
    pub env_var: String,
    pub ttl: chrono::Duration,
}

impl Default for EnvTokenAuth {
    fn default() -> Self {
        Self {
            env_var: "GITHUB_INSTALLATION_TOKEN".to_string(),
            ttl: chrono::Duration::hours(1),
        }
    }
}

impl AuthProvider for EnvTokenAuth {
    fn installation_token(&self, owner: &str, repo: &str) -> anyhow::Result<(String, DateTime<Utc>)> {
        match std::env::var(&self.env_var) {
            Ok(token) if !token.is_empty() => Ok((token, Utc::now() + self.ttl)),
            _ => Err(agentrelay_retry::non_retryable(anyhow::anyhow!(
                "no installation token available for {owner}/{repo}: {} is unset",
                self.env_var
            ))),
        }
    }
}

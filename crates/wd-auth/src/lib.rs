//! Agent credential validation for the WatchDog hub.
//!
//! Validates `<agent_uuid>:<hex_secret>` API keys in constant time and
//! issues fresh keys. The plaintext secret exists only on the wire and in
//! the issuance response; storage holds the AEAD-sealed form.

#![forbid(unsafe_code)]

use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use wd_crypto::{CryptoError, DUMMY_SECRET, SecretBox, constant_time_eq, generate_api_secret};
use wd_proto::{API_SECRET_HEX_LEN, Agent, split_api_key};
use wd_store::{AgentRepo, StoreError};

#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed key, unknown agent, or secret mismatch. Deliberately
    /// carries no detail.
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("api key expired")]
    Expired,

    #[error("store error during auth: {0}")]
    Store(#[from] StoreError),

    #[error("secret handling error during auth: {0}")]
    Crypto(#[from] CryptoError),
}

/// Validates agent credentials against the agent table.
pub struct AgentAuth {
    agents: Arc<dyn AgentRepo>,
    secrets: SecretBox,
}

impl AgentAuth {
    pub fn new(agents: Arc<dyn AgentRepo>, secrets: SecretBox) -> Self {
        Self { agents, secrets }
    }

    /// Validate a presented API key and return the authenticated agent.
    ///
    /// Unknown ids and malformed secrets still run a fixed-length
    /// constant-time compare so rejection timing does not reveal whether
    /// the agent id exists.
    pub async fn validate(&self, api_key: &str) -> Result<Agent, AuthError> {
        let Some((agent_id, secret_hex)) = split_api_key(api_key) else {
            let _ = constant_time_eq(&DUMMY_SECRET, &DUMMY_SECRET);
            return Err(AuthError::Unauthenticated);
        };

        let presented = match hex::decode(secret_hex) {
            Ok(bytes) if secret_hex.len() == API_SECRET_HEX_LEN => bytes,
            _ => {
                let _ = constant_time_eq(&DUMMY_SECRET, &DUMMY_SECRET);
                return Err(AuthError::Unauthenticated);
            }
        };

        let Some(agent) = self.agents.get_agent(agent_id).await? else {
            let _ = constant_time_eq(&presented, &DUMMY_SECRET);
            debug!(agent = %agent_id, "auth attempt for unknown agent");
            return Err(AuthError::Unauthenticated);
        };

        let stored = self.secrets.open(&agent.api_key_encrypted)?;
        if !constant_time_eq(&stored, &presented) {
            warn!(agent = %agent_id, "agent auth failed: secret mismatch");
            return Err(AuthError::Unauthenticated);
        }

        if let Some(expires_at) = agent.api_key_expires_at
            && expires_at < Utc::now()
        {
            warn!(agent = %agent_id, "agent auth failed: key expired");
            return Err(AuthError::Expired);
        }

        self.agents
            .set_agent_status(agent.id, agent.status, Some(Utc::now()))
            .await?;
        Ok(agent)
    }
}

/// Generate and store a fresh API key for an agent, returning the composed
/// `<agent_id>:<hex_secret>` form. The plaintext secret is not retrievable
/// afterwards.
pub async fn issue_api_key(
    agents: &dyn AgentRepo,
    secrets: &SecretBox,
    agent_id: Uuid,
) -> Result<String, AuthError> {
    let mut agent = agents
        .get_agent(agent_id)
        .await?
        .ok_or(AuthError::Unauthenticated)?;

    let secret_hex = generate_api_secret();
    let raw = hex::decode(&secret_hex).map_err(|_| AuthError::Unauthenticated)?;
    agent.api_key_encrypted = secrets.seal(&raw)?;
    agents.update_agent(agent).await?;

    debug!(agent = %agent_id, "issued new api key");
    Ok(format!("{agent_id}:{secret_hex}"))
}

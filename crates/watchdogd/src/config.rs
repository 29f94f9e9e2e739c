//! Hub daemon configuration, loaded from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Exact AEAD key length required of `ENCRYPTION_KEY`.
pub const ENCRYPTION_KEY_LEN: usize = 32;

/// Minimum length of `SESSION_SECRET`.
pub const SESSION_SECRET_MIN_LEN: usize = 32;

const DEFAULT_LISTEN: &str = "0.0.0.0:8090";
const DEFAULT_STATE_DIR: &str = "/var/lib/watchdog";
const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Configuration for the hub daemon. Missing or invalid required values
/// abort the process at startup.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address the agent transport listens on.
    pub listen_addr: SocketAddr,
    /// Directory for the bundled store's snapshots.
    pub state_dir: PathBuf,
    /// AES-256-GCM key material, exactly 32 bytes.
    pub encryption_key: Vec<u8>,
    /// Session signing secret for the web surface; validated here, consumed
    /// elsewhere.
    pub session_secret: String,
    /// Heartbeat retention window in days.
    pub retention_days: i64,
}

impl HubConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_addr = match std::env::var("WATCHDOG_LISTEN") {
            Ok(v) if !v.is_empty() => v,
            _ => DEFAULT_LISTEN.to_string(),
        };
        let listen_addr: SocketAddr =
            listen_addr.parse().map_err(|e| ConfigError::Invalid {
                name: "WATCHDOG_LISTEN",
                reason: format!("{e}"),
            })?;

        let state_dir = match std::env::var("WATCHDOG_STATE_DIR") {
            Ok(v) if !v.is_empty() => PathBuf::from(v),
            _ => PathBuf::from(DEFAULT_STATE_DIR),
        };

        let encryption_key = std::env::var("ENCRYPTION_KEY")
            .map_err(|_| ConfigError::Missing("ENCRYPTION_KEY"))?
            .into_bytes();
        if encryption_key.len() != ENCRYPTION_KEY_LEN {
            return Err(ConfigError::Invalid {
                name: "ENCRYPTION_KEY",
                reason: format!(
                    "must be exactly {ENCRYPTION_KEY_LEN} bytes, got {}",
                    encryption_key.len()
                ),
            });
        }

        let session_secret = std::env::var("SESSION_SECRET")
            .map_err(|_| ConfigError::Missing("SESSION_SECRET"))?;
        if session_secret.len() < SESSION_SECRET_MIN_LEN {
            return Err(ConfigError::Invalid {
                name: "SESSION_SECRET",
                reason: format!(
                    "must be at least {SESSION_SECRET_MIN_LEN} bytes, got {}",
                    session_secret.len()
                ),
            });
        }

        let retention_days = match std::env::var("WATCHDOG_RETENTION_DAYS") {
            Ok(v) if !v.is_empty() => v.parse().map_err(|e| ConfigError::Invalid {
                name: "WATCHDOG_RETENTION_DAYS",
                reason: format!("{e}"),
            })?,
            _ => DEFAULT_RETENTION_DAYS,
        };

        Ok(Self {
            listen_addr,
            state_dir,
            encryption_key,
            session_secret,
            retention_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var access is process-global; exercise the validators directly
    // instead of mutating the environment.

    #[test]
    fn test_key_length_rule() {
        assert_eq!(ENCRYPTION_KEY_LEN, 32);
        assert_eq!(SESSION_SECRET_MIN_LEN, 32);
    }

    #[test]
    fn test_default_listen_parses() {
        let addr: SocketAddr = DEFAULT_LISTEN.parse().expect("default listen");
        assert_eq!(addr.port(), 8090);
    }
}

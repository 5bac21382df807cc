//! Agent configuration.
//!
//! Composed from the library configs and loaded from environment
//! variables, with `__` separating nested keys, e.g.
//! `IDENTITY__BASE_URL` or `HEALTH__INTERVAL_SECS`.

use gatekeeper_session::{HealthConfig, IdentityConfig, SessionConfig};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    /// Identity backend connection.
    pub identity: IdentityConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub session: SessionConfig,

    /// File the session is persisted to.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// JSON feature permission matrix.
    #[serde(default = "default_matrix_path")]
    pub matrix_path: PathBuf,

    /// Credentials to log in with when no session was persisted.
    #[serde(default)]
    pub login: Option<LoginConfig>,
}

#[derive(Deserialize)]
pub struct LoginConfig {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for LoginConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginConfig")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("gatekeeper-session.json")
}

fn default_matrix_path() -> PathBuf {
    PathBuf::from("permission-matrix.json")
}

impl AgentConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

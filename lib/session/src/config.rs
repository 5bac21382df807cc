//! Configuration for the session core.
//!
//! These structs deserialize from any `config` source; the agent binary
//! loads them from environment variables.

use serde::Deserialize;
use std::time::Duration;

/// Identity backend connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Base URL of the auth service, e.g. `https://auth.example.com`.
    pub base_url: String,

    /// Time budget for every backend call, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Endpoint paths relative to `base_url`.
    #[serde(default)]
    pub endpoints: EndpointPaths,
}

/// Paths of the auth service endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointPaths {
    #[serde(default = "default_login_path")]
    pub login: String,
    #[serde(default = "default_register_path")]
    pub register: String,
    #[serde(default = "default_profile_path")]
    pub profile: String,
    #[serde(default = "default_refresh_path")]
    pub refresh: String,
    #[serde(default = "default_logout_path")]
    pub logout: String,
    #[serde(default = "default_forgot_password_path")]
    pub forgot_password: String,
    #[serde(default = "default_reset_password_path")]
    pub reset_password: String,
}

fn default_request_timeout_secs() -> u64 {
    5
}

fn default_login_path() -> String {
    "/api/v1/auth/login".to_string()
}

fn default_register_path() -> String {
    "/api/v1/auth/register".to_string()
}

fn default_profile_path() -> String {
    "/api/v1/auth/profile".to_string()
}

fn default_refresh_path() -> String {
    "/auth/refresh".to_string()
}

fn default_logout_path() -> String {
    "/auth/logout".to_string()
}

fn default_forgot_password_path() -> String {
    "/auth/forgot-password".to_string()
}

fn default_reset_password_path() -> String {
    "/auth/reset-password".to_string()
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            login: default_login_path(),
            register: default_register_path(),
            profile: default_profile_path(),
            refresh: default_refresh_path(),
            logout: default_logout_path(),
            forgot_password: default_forgot_password_path(),
            reset_password: default_reset_password_path(),
        }
    }
}

impl IdentityConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout_secs: default_request_timeout_secs(),
            endpoints: EndpointPaths::default(),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Joins `base_url` and an endpoint path.
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Refresh the access token this many seconds before its estimated
    /// expiry.
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: i64,

    /// Time budget for backend calls made by the controller, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_refresh_margin_secs() -> i64 {
    60
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: default_refresh_margin_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.refresh_margin_secs).unwrap_or_else(chrono::Duration::zero)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Seconds between scheduled checks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Seconds to wait after start before the first check.
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,

    /// Consecutive failures that end the session.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_interval_secs() -> u64 {
    30
}

fn default_initial_delay_secs() -> u64 {
    2
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            initial_delay_secs: default_initial_delay_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }
}

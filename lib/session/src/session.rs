//! The session value and its status.
//!
//! Exactly one `Session` exists at a time and it lives inside
//! [`SessionStore`](crate::SessionStore). Everything else sees immutable
//! snapshots.

use chrono::{DateTime, Duration, Utc};
use gatekeeper_access::Principal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session, or the user logged out.
    Anonymous,
    /// Tokens and principal are present and were last confirmed valid.
    Authenticated,
    /// Rehydrated from storage and not yet confirmed by the backend.
    Validating,
    /// A recent health check failed; the session is kept until the retry
    /// budget runs out.
    Suspect,
    /// The session was ended by policy rather than by the user.
    Unauthenticated,
}

impl SessionStatus {
    /// Returns true for statuses that carry tokens and a principal.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Validating | Self::Suspect)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
            Self::Validating => "validating",
            Self::Suspect => "suspect",
            Self::Unauthenticated => "unauthenticated",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutReason {
    UserRequested,
    /// The backend rejected the token as malformed or forged.
    SessionInvalid,
    /// The backend stayed unreachable for the whole retry budget.
    RetryBudgetExhausted,
    /// The token expired and could not be refreshed.
    RefreshRejected,
}

impl LogoutReason {
    /// Returns true for logouts the user did not ask for.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        !matches!(self, Self::UserRequested)
    }

    /// User-facing explanation.
    #[must_use]
    pub fn message(&self) -> &'static str {
        match self {
            Self::UserRequested => "You have been signed out.",
            Self::SessionInvalid => "Your session is no longer valid. Please sign in again.",
            Self::RetryBudgetExhausted => {
                "The server could not be reached to confirm your session. Please sign in again."
            }
            Self::RefreshRejected => "Your session has expired. Please sign in again.",
        }
    }
}

/// Access and refresh tokens issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    /// `None` when the backend did not rotate the refresh token.
    pub refresh_token: Option<String>,
    /// Lifetime of the access token, if the backend reported one.
    pub expires_in: Option<Duration>,
}

impl TokenPair {
    #[must_use]
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
            expires_in: None,
        }
    }

    #[must_use]
    pub fn expires_in(mut self, lifetime: Duration) -> Self {
        self.expires_in = Some(lifetime);
        self
    }
}

/// Snapshot of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub(crate) status: SessionStatus,
    pub(crate) generation: u64,
    pub(crate) access_token: Option<String>,
    pub(crate) refresh_token: Option<String>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
    pub(crate) principal: Option<Principal>,
    pub(crate) logout_reason: Option<LogoutReason>,
}

impl Session {
    /// An empty session at the given generation.
    #[must_use]
    pub fn anonymous(generation: u64) -> Self {
        Self {
            status: SessionStatus::Anonymous,
            generation,
            access_token: None,
            refresh_token: None,
            expires_at: None,
            principal: None,
            logout_reason: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Tag identifying this session instance. Bumped on every login and
    /// clear; results tagged with an older generation are discarded.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Estimated access token expiry, if known.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Why the previous session ended, if it did.
    #[must_use]
    pub fn logout_reason(&self) -> Option<LogoutReason> {
        self.logout_reason
    }

    /// Returns true if the session carries usable credentials.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.status.is_live() && self.access_token.is_some() && self.principal.is_some()
    }

    /// Returns true if the access token expires within `margin` of `now`.
    /// An unknown expiry never needs a refresh.
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.is_live()
            && self
                .expires_at
                .is_some_and(|expires_at| expires_at - margin <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatekeeper_access::Role;

    fn live(expires_at: Option<DateTime<Utc>>) -> Session {
        Session {
            status: SessionStatus::Authenticated,
            generation: 1,
            access_token: Some("tok".to_string()),
            refresh_token: Some("ref".to_string()),
            expires_at,
            principal: Some(Principal::builder("u-1", Role::TenantUser).build()),
            logout_reason: None,
        }
    }

    #[test]
    fn anonymous_session_is_not_live() {
        let session = Session::anonymous(0);
        assert!(!session.is_live());
        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert!(session.principal().is_none());
    }

    #[test]
    fn live_statuses() {
        assert!(SessionStatus::Authenticated.is_live());
        assert!(SessionStatus::Validating.is_live());
        assert!(SessionStatus::Suspect.is_live());
        assert!(!SessionStatus::Anonymous.is_live());
        assert!(!SessionStatus::Unauthenticated.is_live());
    }

    #[test]
    fn needs_refresh_within_margin() {
        let now = Utc::now();
        let margin = Duration::seconds(60);

        assert!(live(Some(now + Duration::seconds(30))).needs_refresh(now, margin));
        assert!(live(Some(now - Duration::seconds(5))).needs_refresh(now, margin));
        assert!(!live(Some(now + Duration::minutes(10))).needs_refresh(now, margin));
        assert!(!live(None).needs_refresh(now, margin));
    }

    #[test]
    fn only_user_logout_is_unforced() {
        assert!(!LogoutReason::UserRequested.is_forced());
        assert!(LogoutReason::SessionInvalid.is_forced());
        assert!(LogoutReason::RetryBudgetExhausted.is_forced());
        assert!(LogoutReason::RefreshRejected.message().contains("expired"));
    }
}

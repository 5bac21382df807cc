//! Token validation against the identity backend.

use crate::error::{IdentityError, SessionError};
use crate::identity::{IdentityProvider, bounded};
use gatekeeper_access::Principal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Verdict on an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and belongs to this principal.
    Valid(Principal),
    /// The token is past its validity.
    Expired,
    /// The token is malformed, forged or revoked.
    Invalid { reason: String },
    /// The backend is throttling us; nothing is known about the token.
    RateLimited,
    /// The backend could not be reached; nothing is known about the token.
    Unreachable { reason: String },
}

impl TokenStatus {
    /// Classifies a failed validation call.
    ///
    /// Any failure other than expiry, throttling or unavailability is
    /// treated as an invalid token.
    #[must_use]
    pub fn from_failure(error: &IdentityError) -> Self {
        match error.classify() {
            SessionError::AuthExpired => Self::Expired,
            SessionError::RateLimited => Self::RateLimited,
            SessionError::Unreachable { reason } => Self::Unreachable { reason },
            SessionError::AuthInvalid { reason } => Self::Invalid { reason },
            other => Self::Invalid {
                reason: other.to_string(),
            },
        }
    }

    /// Short name of the verdict, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Valid(_) => "valid",
            Self::Expired => "expired",
            Self::Invalid { .. } => "invalid",
            Self::RateLimited => "rate_limited",
            Self::Unreachable { .. } => "unreachable",
        }
    }

    /// Returns true if the verdict says nothing about the token itself.
    #[must_use]
    pub fn is_inconclusive(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Unreachable { .. })
    }
}

/// Classifies access tokens by asking the identity backend.
///
/// The validator never touches session state; callers decide what a
/// verdict means.
#[derive(Clone)]
pub struct TokenValidator {
    identity: Arc<dyn IdentityProvider>,
    timeout: Duration,
}

impl TokenValidator {
    #[must_use]
    pub fn new(identity: Arc<dyn IdentityProvider>, timeout: Duration) -> Self {
        Self { identity, timeout }
    }

    /// Validates a token. Exceeding the timeout is `Unreachable`.
    #[instrument(skip_all)]
    pub async fn validate(&self, access_token: &str) -> TokenStatus {
        let status = match bounded(self.timeout, self.identity.validate(access_token)).await {
            Ok(principal) => TokenStatus::Valid(principal),
            Err(e) => TokenStatus::from_failure(&e),
        };
        debug!(status = status.kind(), "Token validated");
        status
    }
}

//! Error types for the session crate.
//!
//! - `StorageError`: the durable key-value store failed
//! - `IdentityError`: a raw failure from the identity backend
//! - `SessionError`: a lifecycle operation failed, classified for policy

use gatekeeper_access::Role;
use std::fmt;

/// Errors from the persistence port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Reading or writing the backing medium failed.
    Io { reason: String },
    /// Stored data could not be encoded or decoded.
    Serialization { reason: String },
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { reason } => write!(f, "storage I/O failed: {reason}"),
            Self::Serialization { reason } => write!(f, "storage serialization failed: {reason}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Raw failure reported by an identity backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The request never produced a response.
    Network { reason: String },
    /// The request exceeded its time budget.
    Timeout,
    /// The backend answered with a non-success status.
    Status {
        code: u16,
        error: Option<String>,
        message: Option<String>,
    },
    /// The backend answered with a body we could not understand.
    InvalidResponse { reason: String },
}

impl IdentityError {
    /// Maps a raw failure onto the session error taxonomy.
    ///
    /// Network failures, timeouts, 5xx and unreadable bodies are
    /// `Unreachable`; 429 is `RateLimited`; 401 is `AuthExpired` when the
    /// backend says the token expired and `AuthInvalid` otherwise. Other
    /// client errors are `Rejected`.
    #[must_use]
    pub fn classify(&self) -> SessionError {
        match self {
            Self::Network { reason } | Self::InvalidResponse { reason } => {
                SessionError::Unreachable {
                    reason: reason.clone(),
                }
            }
            Self::Timeout => SessionError::Unreachable {
                reason: "request timed out".to_string(),
            },
            Self::Status { code: 429, .. } => SessionError::RateLimited,
            Self::Status { code, .. } if *code >= 500 => SessionError::Unreachable {
                reason: format!("server error {code}"),
            },
            Self::Status {
                code: 401,
                error,
                message,
            } => {
                let mentions_expiry = [error, message]
                    .into_iter()
                    .flatten()
                    .any(|text| text.to_ascii_lowercase().contains("expired"));
                if mentions_expiry {
                    SessionError::AuthExpired
                } else {
                    SessionError::AuthInvalid {
                        reason: self.detail(),
                    }
                }
            }
            Self::Status { code, .. } => SessionError::Rejected {
                status: *code,
                message: self.detail(),
            },
        }
    }

    fn detail(&self) -> String {
        match self {
            Self::Status {
                message: Some(message),
                ..
            } => message.clone(),
            Self::Status {
                error: Some(error), ..
            } => error.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { reason } => write!(f, "identity backend unreachable: {reason}"),
            Self::Timeout => write!(f, "identity backend timed out"),
            Self::Status {
                code,
                error,
                message,
            } => {
                write!(f, "identity backend returned {code}")?;
                if let Some(error) = error {
                    write!(f, " ({error})")?;
                }
                if let Some(message) = message {
                    write!(f, ": {message}")?;
                }
                Ok(())
            }
            Self::InvalidResponse { reason } => {
                write!(f, "invalid identity backend response: {reason}")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

/// Errors from session lifecycle operations.
///
/// `Unreachable` and `RateLimited` are transient and never end a session on
/// their own. `AuthInvalid` and `AuthExpired` end it once policy says so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The token is malformed, forged or revoked.
    AuthInvalid { reason: String },
    /// The token is past its validity; the refresh token may still work.
    AuthExpired,
    /// Network failure, timeout or server error.
    Unreachable { reason: String },
    /// The backend is up but throttling us.
    RateLimited,
    /// The backend refused the request for another reason.
    Rejected { status: u16, message: String },
    /// The operation needs a live session and there is none.
    NotAuthenticated,
    /// A role switch named a role the principal does not hold.
    RoleNotHeld { role: Role },
    /// Login input failed local validation.
    InvalidCredentials { reason: String },
    /// Registration input failed local validation.
    RegistrationRejected { reason: String },
    /// A refresh was needed but the session has no refresh token.
    NoRefreshToken,
    /// The session changed while the operation was in flight; its result
    /// was discarded.
    Superseded,
}

impl SessionError {
    /// Returns true for failures that say nothing about the session's
    /// validity.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::RateLimited)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthInvalid { reason } => write!(f, "authentication invalid: {reason}"),
            Self::AuthExpired => write!(f, "authentication expired"),
            Self::Unreachable { reason } => write!(f, "identity backend unreachable: {reason}"),
            Self::RateLimited => write!(f, "identity backend is rate limiting requests"),
            Self::Rejected { status, message } => {
                write!(f, "request rejected ({status}): {message}")
            }
            Self::NotAuthenticated => write!(f, "no authenticated session"),
            Self::RoleNotHeld { role } => write!(f, "role {role} is not held by the principal"),
            Self::InvalidCredentials { reason } => write!(f, "invalid credentials: {reason}"),
            Self::RegistrationRejected { reason } => write!(f, "registration rejected: {reason}"),
            Self::NoRefreshToken => write!(f, "session has no refresh token"),
            Self::Superseded => write!(f, "session changed while the request was in flight"),
        }
    }
}

impl std::error::Error for SessionError {}

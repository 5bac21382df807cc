//! Error types for the access crate.
//!
//! - `AuthorizationError`: a permission or role check denied access
//! - `MatrixError`: the feature permission matrix could not be loaded
//! - `ParseFeatureError`: a feature id is not one this build knows

use crate::permission::{AccessLevel, Feature};
use crate::role::Role;
use std::fmt;

/// Errors from authorization checks.
///
/// Neither variant ever changes session state; they are surfaced at the
/// decision site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationError {
    /// The principal's access to the feature is below the required level.
    PermissionDenied {
        feature: Feature,
        required: AccessLevel,
        actual: AccessLevel,
    },
    /// None of the principal's roles is in the required set.
    RoleMismatch { held: Vec<Role>, required: Vec<Role> },
}

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PermissionDenied {
                feature,
                required,
                actual,
            } => {
                write!(
                    f,
                    "permission denied for {feature}: requires {required} access, have {actual}"
                )
            }
            Self::RoleMismatch { held, required } => {
                write!(
                    f,
                    "role mismatch: holds [{}], requires one of [{}]",
                    join(held),
                    join(required)
                )
            }
        }
    }
}

impl std::error::Error for AuthorizationError {}

fn join(roles: &[Role]) -> String {
    roles
        .iter()
        .map(Role::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from loading a feature permission matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixError {
    /// The document is not valid matrix JSON.
    Parse { reason: String },
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse { reason } => write!(f, "invalid permission matrix: {reason}"),
        }
    }
}

impl std::error::Error for MatrixError {}

/// Error returned when a feature id does not name a known feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFeatureError {
    pub id: String,
}

impl fmt::Display for ParseFeatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown feature: {}", self.id)
    }
}

impl std::error::Error for ParseFeatureError {}

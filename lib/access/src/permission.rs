//! Feature permission resolution.
//!
//! Access to each feature area is decided from two inputs: a static matrix
//! mapping `feature -> role -> level`, supplied as configuration, and the
//! principal's custom grants. Resolution fails closed: unknown features and
//! inactive principals never get access.

use crate::error::{AuthorizationError, MatrixError, ParseFeatureError};
use crate::principal::Principal;
use crate::role::Role;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Level of access to a single feature, ordered `None < Limited < Full`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    None,
    Limited,
    Full,
}

impl AccessLevel {
    /// Returns true for any level other than `None`.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        *self != Self::None
    }

    /// Returns true if this level satisfies a requirement of `required`.
    ///
    /// "Limited" requirements are satisfied by Limited or Full.
    #[must_use]
    pub fn satisfies(&self, required: AccessLevel) -> bool {
        *self >= required
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Limited => "limited",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A feature area gated independently of routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    Dashboard,
    Users,
    Customers,
    Tenants,
    Api,
    Analytics,
    Security,
    Settings,
    Backup,
    Teams,
    Content,
    Ecommerce,
    Support,
    Chat,
}

impl Feature {
    /// Every known feature, in navigation order.
    pub const ALL: [Feature; 14] = [
        Self::Dashboard,
        Self::Users,
        Self::Customers,
        Self::Tenants,
        Self::Api,
        Self::Analytics,
        Self::Security,
        Self::Settings,
        Self::Backup,
        Self::Teams,
        Self::Content,
        Self::Ecommerce,
        Self::Support,
        Self::Chat,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Users => "users",
            Self::Customers => "customers",
            Self::Tenants => "tenants",
            Self::Api => "api",
            Self::Analytics => "analytics",
            Self::Security => "security",
            Self::Settings => "settings",
            Self::Backup => "backup",
            Self::Teams => "teams",
            Self::Content => "content",
            Self::Ecommerce => "ecommerce",
            Self::Support => "support",
            Self::Chat => "chat",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = ParseFeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|feature| feature.as_str() == id)
            .ok_or(ParseFeatureError { id })
    }
}

/// A custom grant attached to a principal, parsed from its string form.
///
/// Accepted forms are `feature`, `feature:level` and `feature.action`. A bare
/// feature or any action grants Limited; `full`, `manage` and `*` grant Full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomGrant {
    pub feature: Feature,
    pub level: AccessLevel,
}

impl CustomGrant {
    /// Parses a grant string. Returns `None` for grants naming an unknown
    /// feature.
    #[must_use]
    pub fn parse(grant: &str) -> Option<Self> {
        let grant = grant.trim();
        let (feature, qualifier) = match grant.find([':', '.']) {
            Some(idx) => (&grant[..idx], Some(grant[idx + 1..].trim())),
            None => (grant, None),
        };
        let feature = feature.parse::<Feature>().ok()?;
        let level = match qualifier.map(str::to_ascii_lowercase).as_deref() {
            Some("full" | "manage" | "*") => AccessLevel::Full,
            Some("none") => AccessLevel::None,
            _ => AccessLevel::Limited,
        };
        Some(Self { feature, level })
    }
}

/// Static `feature -> role -> level` table.
///
/// Loaded from configuration and never mutated by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeaturePermissionMatrix {
    entries: HashMap<Feature, HashMap<Role, AccessLevel>>,
}

impl FeaturePermissionMatrix {
    /// Creates an empty matrix (no feature is accessible).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, returning the updated matrix.
    #[must_use]
    pub fn with_entry(mut self, feature: Feature, role: Role, level: AccessLevel) -> Self {
        self.entries.entry(feature).or_default().insert(role, level);
        self
    }

    /// Registers a feature with no role entries.
    ///
    /// The feature then exists, so custom grants for it take effect.
    #[must_use]
    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.entries.entry(feature).or_default();
        self
    }

    /// Parses a matrix from JSON of the form
    /// `{"users": {"TENANT_ADMIN": "full", "TENANT_USER": "limited"}}`.
    ///
    /// Feature ids this build does not know are skipped with a warning.
    pub fn from_json(json: &str) -> gatekeeper_core::Result<Self, MatrixError> {
        let raw: HashMap<String, HashMap<Role, AccessLevel>> =
            serde_json::from_str(json).map_err(|e| MatrixError::Parse {
                reason: e.to_string(),
            })?;

        let mut entries = HashMap::with_capacity(raw.len());
        for (id, roles) in raw {
            match id.parse::<Feature>() {
                Ok(feature) => {
                    entries.insert(feature, roles);
                }
                Err(e) => warn!(feature = %e.id, "Skipping unknown feature in permission matrix"),
            }
        }
        Ok(Self { entries })
    }

    /// Returns true if the matrix has an entry for the feature.
    #[must_use]
    pub fn contains(&self, feature: Feature) -> bool {
        self.entries.contains_key(&feature)
    }

    /// Returns the configured level for a role, or `None` if the feature is
    /// absent from the matrix.
    #[must_use]
    pub fn level(&self, feature: Feature, role: &Role) -> Option<AccessLevel> {
        self.entries
            .get(&feature)
            .map(|roles| roles.get(role).copied().unwrap_or_default())
    }

    /// Returns the number of features in the matrix.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Computes access levels for principals against a shared matrix.
#[derive(Debug, Clone, Default)]
pub struct PermissionResolver {
    matrix: Arc<FeaturePermissionMatrix>,
}

impl PermissionResolver {
    #[must_use]
    pub fn new(matrix: FeaturePermissionMatrix) -> Self {
        Self {
            matrix: Arc::new(matrix),
        }
    }

    #[must_use]
    pub fn matrix(&self) -> &FeaturePermissionMatrix {
        &self.matrix
    }

    /// Resolves the principal's access level for a feature.
    ///
    /// Inactive principals and features missing from the matrix resolve to
    /// `None`. Otherwise the level is the maximum of the primary role's
    /// matrix entry and any custom grant for the feature; grants only raise.
    #[must_use]
    pub fn resolve_access(&self, principal: &Principal, feature: Feature) -> AccessLevel {
        if !principal.is_active() {
            return AccessLevel::None;
        }
        let Some(base) = self.matrix.level(feature, principal.primary_role()) else {
            return AccessLevel::None;
        };

        principal
            .custom_grants()
            .filter_map(|grant| {
                let parsed = CustomGrant::parse(grant);
                if parsed.is_none() {
                    debug!(grant, "Ignoring unrecognised custom grant");
                }
                parsed
            })
            .filter(|grant| grant.feature == feature)
            .map(|grant| grant.level)
            .fold(base, AccessLevel::max)
    }

    /// Resolves access for a feature given by id. Unknown ids resolve to
    /// `None`.
    #[must_use]
    pub fn resolve_access_by_id(&self, principal: &Principal, feature_id: &str) -> AccessLevel {
        feature_id
            .parse::<Feature>()
            .map(|feature| self.resolve_access(principal, feature))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn can_access(&self, principal: &Principal, feature: Feature) -> bool {
        self.resolve_access(principal, feature).is_granted()
    }

    #[must_use]
    pub fn can_access_full(&self, principal: &Principal, feature: Feature) -> bool {
        self.resolve_access(principal, feature) == AccessLevel::Full
    }

    /// True for Limited or Full access.
    #[must_use]
    pub fn can_access_limited(&self, principal: &Principal, feature: Feature) -> bool {
        self.resolve_access(principal, feature)
            .satisfies(AccessLevel::Limited)
    }

    /// Checks that the principal meets `required` on a feature.
    ///
    /// # Errors
    ///
    /// Returns `AuthorizationError::PermissionDenied` with the resolved level
    /// when the requirement is not met.
    pub fn check(
        &self,
        principal: &Principal,
        feature: Feature,
        required: AccessLevel,
    ) -> Result<AccessLevel, AuthorizationError> {
        let actual = self.resolve_access(principal, feature);
        if actual.satisfies(required) {
            Ok(actual)
        } else {
            Err(AuthorizationError::PermissionDenied {
                feature,
                required,
                actual,
            })
        }
    }

    /// Returns every feature the principal can access, with its level.
    #[must_use]
    pub fn accessible_features(&self, principal: &Principal) -> Vec<(Feature, AccessLevel)> {
        Feature::ALL
            .into_iter()
            .map(|feature| (feature, self.resolve_access(principal, feature)))
            .filter(|(_, level)| level.is_granted())
            .collect()
    }
}

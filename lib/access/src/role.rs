//! Role identifiers and their coarse classification.
//!
//! The identity backend tags every principal with a role string such as
//! `TENANT_ADMIN`. Known roles are closed variants so permission code can
//! match on them exhaustively; anything else is carried verbatim in
//! [`Role::Other`] and classified by prefix.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role held by a principal.
///
/// Serialized as the upper snake case tag used by the identity backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    PlatformAdmin,
    PlatformUser,
    ManagementAdmin,
    ManagementUser,
    MarketplaceDeveloper,
    TenantAdmin,
    TenantUser,
    TenantCustomer,
    EndCustomer,
    /// A role tag this build does not know about, normalised to upper case.
    Other(String),
}

impl Role {
    /// Parses a role tag. Case and surrounding whitespace are ignored.
    #[must_use]
    pub fn parse(tag: &str) -> Self {
        let normalized = tag.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "PLATFORM_ADMIN" => Self::PlatformAdmin,
            "PLATFORM_USER" => Self::PlatformUser,
            "MANAGEMENT_ADMIN" => Self::ManagementAdmin,
            "MANAGEMENT_USER" => Self::ManagementUser,
            "MARKETPLACE_DEVELOPER" => Self::MarketplaceDeveloper,
            "TENANT_ADMIN" => Self::TenantAdmin,
            "TENANT_USER" => Self::TenantUser,
            "TENANT_CUSTOMER" => Self::TenantCustomer,
            "END_CUSTOMER" => Self::EndCustomer,
            _ => Self::Other(normalized),
        }
    }

    /// Returns the wire tag for this role.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PlatformAdmin => "PLATFORM_ADMIN",
            Self::PlatformUser => "PLATFORM_USER",
            Self::ManagementAdmin => "MANAGEMENT_ADMIN",
            Self::ManagementUser => "MANAGEMENT_USER",
            Self::MarketplaceDeveloper => "MARKETPLACE_DEVELOPER",
            Self::TenantAdmin => "TENANT_ADMIN",
            Self::TenantUser => "TENANT_USER",
            Self::TenantCustomer => "TENANT_CUSTOMER",
            Self::EndCustomer => "END_CUSTOMER",
            Self::Other(tag) => tag,
        }
    }

    /// Returns the coarse class of this role.
    #[must_use]
    pub fn class(&self) -> RoleClass {
        classify(self)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

/// Coarse grouping of roles, used to pick a dashboard and tenant handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleClass {
    Platform,
    Tenant,
    Developer,
    Customer,
    Unknown,
}

impl RoleClass {
    /// Returns true if principals of this class must be bound to a tenant.
    #[must_use]
    pub fn requires_tenant(&self) -> bool {
        matches!(self, Self::Tenant)
    }
}

/// Classifies a role into its coarse class.
///
/// Rules are applied in order: the developer role, `TENANT_*`,
/// `PLATFORM_*` and `MANAGEMENT_*`, then the customer roles. Total; anything
/// else is [`RoleClass::Unknown`].
#[must_use]
pub fn classify(role: &Role) -> RoleClass {
    match role {
        Role::MarketplaceDeveloper => RoleClass::Developer,
        Role::TenantAdmin | Role::TenantUser | Role::TenantCustomer => RoleClass::Tenant,
        Role::PlatformAdmin
        | Role::PlatformUser
        | Role::ManagementAdmin
        | Role::ManagementUser => RoleClass::Platform,
        Role::EndCustomer => RoleClass::Customer,
        Role::Other(tag) => classify_tag(tag),
    }
}

fn classify_tag(tag: &str) -> RoleClass {
    if tag.ends_with("_DEVELOPER") {
        RoleClass::Developer
    } else if tag.starts_with("TENANT_") {
        RoleClass::Tenant
    } else if tag.starts_with("PLATFORM_") || tag.starts_with("MANAGEMENT_") {
        RoleClass::Platform
    } else if tag == "CUSTOMER" || tag.ends_with("_CUSTOMER") {
        RoleClass::Customer
    } else {
        RoleClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Role::parse("tenant_admin"), Role::TenantAdmin);
        assert_eq!(Role::parse("  End_Customer "), Role::EndCustomer);
    }

    #[test]
    fn unknown_tags_are_preserved_upper_case() {
        let role = Role::parse("billing_clerk");
        assert_eq!(role, Role::Other("BILLING_CLERK".to_string()));
        assert_eq!(role.to_string(), "BILLING_CLERK");
    }

    #[test]
    fn classify_known_roles() {
        assert_eq!(classify(&Role::PlatformAdmin), RoleClass::Platform);
        assert_eq!(classify(&Role::ManagementUser), RoleClass::Platform);
        assert_eq!(classify(&Role::MarketplaceDeveloper), RoleClass::Developer);
        assert_eq!(classify(&Role::TenantUser), RoleClass::Tenant);
        assert_eq!(classify(&Role::TenantCustomer), RoleClass::Tenant);
        assert_eq!(classify(&Role::EndCustomer), RoleClass::Customer);
    }

    #[test]
    fn classify_unknown_tags_by_prefix() {
        assert_eq!(Role::parse("TENANT_AUDITOR").class(), RoleClass::Tenant);
        assert_eq!(Role::parse("PLATFORM_SUPPORT").class(), RoleClass::Platform);
        assert_eq!(Role::parse("PLUGIN_DEVELOPER").class(), RoleClass::Developer);
        assert_eq!(Role::parse("customer").class(), RoleClass::Customer);
    }

    #[test]
    fn classify_never_fails() {
        assert_eq!(Role::parse("").class(), RoleClass::Unknown);
        assert_eq!(Role::parse("admin").class(), RoleClass::Unknown);
    }

    #[test]
    fn only_tenant_class_requires_tenant() {
        assert!(RoleClass::Tenant.requires_tenant());
        assert!(!RoleClass::Platform.requires_tenant());
        assert!(!RoleClass::Customer.requires_tenant());
    }

    #[test]
    fn role_serialization_format() {
        let json = serde_json::to_string(&Role::TenantAdmin).expect("serialize");
        assert_eq!(json, "\"TENANT_ADMIN\"");

        let parsed: Role = serde_json::from_str("\"platform_user\"").expect("deserialize");
        assert_eq!(parsed, Role::PlatformUser);
    }
}

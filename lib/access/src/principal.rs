//! The authenticated principal and its role and permission attributes.
//!
//! A `Principal` is an immutable snapshot handed out by the identity
//! backend. Role switches produce a new snapshot rather than mutating the
//! current one.

use crate::role::{Role, RoleClass};
use gatekeeper_core::{PrincipalId, TenantId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Authenticated identity with its roles and custom grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    id: PrincipalId,
    primary_role: Role,
    #[serde(default)]
    additional_roles: BTreeSet<Role>,
    #[serde(default)]
    tenant: Option<TenantId>,
    #[serde(default)]
    custom_grants: BTreeSet<String>,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

fn default_active() -> bool {
    true
}

impl Principal {
    /// Starts building a principal with the given id and primary role.
    #[must_use]
    pub fn builder(id: impl Into<PrincipalId>, primary_role: Role) -> PrincipalBuilder {
        PrincipalBuilder::new(id.into(), primary_role)
    }

    #[must_use]
    pub fn id(&self) -> &PrincipalId {
        &self.id
    }

    /// Returns the role permission resolution is based on.
    #[must_use]
    pub fn primary_role(&self) -> &Role {
        &self.primary_role
    }

    /// Returns the roles held besides the primary one.
    #[must_use]
    pub fn additional_roles(&self) -> &BTreeSet<Role> {
        &self.additional_roles
    }

    /// Returns every role held, primary first.
    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        std::iter::once(&self.primary_role).chain(
            self.additional_roles
                .iter()
                .filter(move |role| **role != self.primary_role),
        )
    }

    /// Returns true if the principal holds the role as primary or additional.
    #[must_use]
    pub fn holds_role(&self, role: &Role) -> bool {
        self.primary_role == *role || self.additional_roles.contains(role)
    }

    #[must_use]
    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    /// Returns the raw custom grant strings.
    pub fn custom_grants(&self) -> impl Iterator<Item = &str> {
        self.custom_grants.iter().map(String::as_str)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Returns the coarse class of the primary role.
    #[must_use]
    pub fn role_class(&self) -> RoleClass {
        self.primary_role.class()
    }

    /// Returns true if the primary role needs a tenant and none is set.
    #[must_use]
    pub fn is_missing_tenant(&self) -> bool {
        self.role_class().requires_tenant() && self.tenant.is_none()
    }

    /// Returns a snapshot with `role` as the primary role.
    ///
    /// The previous primary role moves into the additional roles so it can
    /// be switched back to. Returns `None` if the role is not held.
    #[must_use]
    pub fn with_primary_role(&self, role: &Role) -> Option<Self> {
        if !self.holds_role(role) {
            return None;
        }
        let mut next = self.clone();
        next.additional_roles.insert(self.primary_role.clone());
        next.additional_roles.remove(role);
        next.primary_role = role.clone();
        Some(next)
    }
}

/// Builder for `Principal`.
#[derive(Debug, Clone)]
pub struct PrincipalBuilder {
    id: PrincipalId,
    primary_role: Role,
    additional_roles: BTreeSet<Role>,
    tenant: Option<TenantId>,
    custom_grants: BTreeSet<String>,
    active: bool,
    email: Option<String>,
    display_name: Option<String>,
}

impl PrincipalBuilder {
    #[must_use]
    pub fn new(id: PrincipalId, primary_role: Role) -> Self {
        Self {
            id,
            primary_role,
            additional_roles: BTreeSet::new(),
            tenant: None,
            custom_grants: BTreeSet::new(),
            active: true,
            email: None,
            display_name: None,
        }
    }

    /// Adds a role besides the primary one.
    #[must_use]
    pub fn role(mut self, role: Role) -> Self {
        if role != self.primary_role {
            self.additional_roles.insert(role);
        }
        self
    }

    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Adds a custom grant such as `analytics:limited`.
    #[must_use]
    pub fn grant(mut self, grant: impl Into<String>) -> Self {
        self.custom_grants.insert(grant.into());
        self
    }

    #[must_use]
    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn build(self) -> Principal {
        Principal {
            id: self.id,
            primary_role: self.primary_role,
            additional_roles: self.additional_roles,
            tenant: self.tenant,
            custom_grants: self.custom_grants,
            active: self.active,
            email: self.email,
            display_name: self.display_name,
        }
    }
}

//! Route and component access decisions.
//!
//! [`evaluate`] is the pure decision function; [`AccessGuard`] binds it to
//! the live session so UI code only ever sees a [`Decision`] or an
//! [`AccessLevel`], never tokens or network calls.

use crate::session::Session;
use crate::store::SessionStore;
use gatekeeper_access::{
    AccessLevel, AuthorizationError, Feature, PermissionResolver, Role, RoleClass,
};
use std::sync::Arc;
use tracing::debug;

/// What a route or component needs from the session.
///
/// The default requirement only asks for an authenticated session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirement {
    roles: Vec<Role>,
    feature: Option<(Feature, AccessLevel)>,
}

impl Requirement {
    #[must_use]
    pub fn authenticated() -> Self {
        Self::default()
    }

    /// Requires the principal to hold at least one of `roles`.
    #[must_use]
    pub fn any_role(roles: impl IntoIterator<Item = Role>) -> Self {
        Self::default().with_roles(roles)
    }

    /// Requires at least `min_level` access to `feature`.
    #[must_use]
    pub fn feature(feature: Feature, min_level: AccessLevel) -> Self {
        Self::default().with_feature(feature, min_level)
    }

    #[must_use]
    pub fn with_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles.extend(roles);
        self
    }

    /// A `min_level` of `None` is raised to `Limited`; a feature
    /// requirement always needs some access.
    #[must_use]
    pub fn with_feature(mut self, feature: Feature, min_level: AccessLevel) -> Self {
        self.feature = Some((feature, min_level.max(AccessLevel::Limited)));
        self
    }

    #[must_use]
    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    #[must_use]
    pub fn required_feature(&self) -> Option<(Feature, AccessLevel)> {
        self.feature
    }
}

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RedirectToLogin,
    Deny(AuthorizationError),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Decides whether `session` meets `requirement`.
///
/// Checks run in order: a live session with a principal, then the role
/// set, then the feature level. Suspect and validating sessions count as
/// live. A tenant-scoped principal with no tenant is sent back to login.
#[must_use]
pub fn evaluate(
    resolver: &PermissionResolver,
    session: &Session,
    requirement: &Requirement,
) -> Decision {
    let Some(principal) = session.principal().filter(|_| session.is_live()) else {
        return Decision::RedirectToLogin;
    };
    if principal.is_missing_tenant() {
        debug!(principal = %principal.id(), "Tenant principal has no tenant");
        return Decision::RedirectToLogin;
    }

    if !requirement.roles.is_empty()
        && !requirement.roles.iter().any(|role| principal.holds_role(role))
    {
        return Decision::Deny(AuthorizationError::RoleMismatch {
            held: principal.roles().cloned().collect(),
            required: requirement.roles.clone(),
        });
    }

    if let Some((feature, min_level)) = requirement.feature {
        if let Err(e) = resolver.check(principal, feature, min_level) {
            return Decision::Deny(e);
        }
    }

    Decision::Allow
}

/// Access decisions against the current session.
#[derive(Clone)]
pub struct AccessGuard {
    store: Arc<SessionStore>,
    resolver: PermissionResolver,
}

impl AccessGuard {
    #[must_use]
    pub fn new(store: Arc<SessionStore>, resolver: PermissionResolver) -> Self {
        Self { store, resolver }
    }

    #[must_use]
    pub fn resolver(&self) -> &PermissionResolver {
        &self.resolver
    }

    #[must_use]
    pub fn decide(&self, requirement: &Requirement) -> Decision {
        let session = self.store.snapshot();
        let decision = evaluate(&self.resolver, &session, requirement);
        if let Decision::Deny(reason) = &decision {
            debug!(generation = session.generation(), %reason, "Access denied");
        }
        decision
    }

    /// Access level for one feature, for nav filtering and badges.
    /// `None` without a live session.
    #[must_use]
    pub fn feature_access(&self, feature: Feature) -> AccessLevel {
        let session = self.store.snapshot();
        session
            .principal()
            .filter(|_| session.is_live())
            .map(|principal| self.resolver.resolve_access(principal, feature))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn accessible_features(&self) -> Vec<(Feature, AccessLevel)> {
        let session = self.store.snapshot();
        session
            .principal()
            .filter(|_| session.is_live())
            .map(|principal| self.resolver.accessible_features(principal))
            .unwrap_or_default()
    }

    /// Coarse class of the current principal, used to pick a dashboard.
    #[must_use]
    pub fn role_class(&self) -> Option<RoleClass> {
        let session = self.store.snapshot();
        session
            .principal()
            .filter(|_| session.is_live())
            .map(|principal| principal.role_class())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::{LogoutReason, SessionStatus, TokenPair};
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use gatekeeper_access::{FeaturePermissionMatrix, Principal};

    fn resolver() -> PermissionResolver {
        PermissionResolver::new(
            FeaturePermissionMatrix::new()
                .with_entry(Feature::Users, Role::TenantAdmin, AccessLevel::Full)
                .with_entry(Feature::Users, Role::TenantUser, AccessLevel::Limited)
                .with_entry(Feature::Analytics, Role::TenantUser, AccessLevel::None)
                .with_entry(Feature::Tenants, Role::PlatformAdmin, AccessLevel::Full),
        )
    }

    fn guard_for(principal: Principal) -> (AccessGuard, Arc<SessionStore>) {
        let store = Arc::new(SessionStore::open(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        store
            .login(TokenPair::new("access", "refresh"), principal)
            .expect("login");
        (AccessGuard::new(store.clone(), resolver()), store)
    }

    fn tenant_user() -> Principal {
        Principal::builder("u-1", Role::TenantUser)
            .tenant("acme")
            .build()
    }

    #[test]
    fn anonymous_session_redirects() {
        let session = Session::anonymous(0);
        assert_eq!(
            evaluate(&resolver(), &session, &Requirement::authenticated()),
            Decision::RedirectToLogin
        );
    }

    #[test]
    fn forced_logout_redirects() {
        let (guard, store) = guard_for(tenant_user());
        store.clear(LogoutReason::SessionInvalid);
        assert_eq!(
            guard.decide(&Requirement::authenticated()),
            Decision::RedirectToLogin
        );
        assert_eq!(guard.feature_access(Feature::Users), AccessLevel::None);
        assert!(guard.accessible_features().is_empty());
        assert_eq!(guard.role_class(), None);
    }

    #[test]
    fn suspect_session_still_passes() {
        let (guard, store) = guard_for(tenant_user());
        store
            .mark(store.generation(), SessionStatus::Suspect)
            .expect("mark");
        assert!(guard.decide(&Requirement::authenticated()).is_allowed());
    }

    #[test]
    fn tenant_principal_without_tenant_redirects() {
        let (guard, _store) = guard_for(Principal::builder("u-2", Role::TenantAdmin).build());
        assert_eq!(
            guard.decide(&Requirement::authenticated()),
            Decision::RedirectToLogin
        );
    }

    #[test]
    fn role_set_must_intersect() {
        let (guard, _store) = guard_for(tenant_user());
        let decision = guard.decide(&Requirement::any_role([
            Role::PlatformAdmin,
            Role::ManagementAdmin,
        ]));
        let Decision::Deny(AuthorizationError::RoleMismatch { held, required }) = decision else {
            panic!("expected role mismatch, got {decision:?}");
        };
        assert_eq!(held, vec![Role::TenantUser]);
        assert_eq!(required.len(), 2);

        assert!(
            guard
                .decide(&Requirement::any_role([Role::TenantAdmin, Role::TenantUser]))
                .is_allowed()
        );
    }

    #[test]
    fn additional_roles_count() {
        let principal = Principal::builder("u-3", Role::TenantUser)
            .tenant("acme")
            .role(Role::MarketplaceDeveloper)
            .build();
        let (guard, _store) = guard_for(principal);
        assert!(
            guard
                .decide(&Requirement::any_role([Role::MarketplaceDeveloper]))
                .is_allowed()
        );
    }

    #[test]
    fn role_check_runs_before_feature_check() {
        let (guard, _store) = guard_for(tenant_user());
        let requirement = Requirement::any_role([Role::PlatformAdmin])
            .with_feature(Feature::Analytics, AccessLevel::Limited);
        assert!(matches!(
            guard.decide(&requirement),
            Decision::Deny(AuthorizationError::RoleMismatch { .. })
        ));
    }

    #[test]
    fn limited_requirement_accepts_full() {
        let admin = Principal::builder("u-4", Role::TenantAdmin)
            .tenant("acme")
            .build();
        let (guard, _store) = guard_for(admin);
        assert!(
            guard
                .decide(&Requirement::feature(Feature::Users, AccessLevel::Limited))
                .is_allowed()
        );
    }

    #[test]
    fn full_requirement_rejects_limited() {
        let (guard, _store) = guard_for(tenant_user());
        assert_eq!(
            guard.decide(&Requirement::feature(Feature::Users, AccessLevel::Full)),
            Decision::Deny(AuthorizationError::PermissionDenied {
                feature: Feature::Users,
                required: AccessLevel::Full,
                actual: AccessLevel::Limited,
            })
        );
    }

    #[test]
    fn none_requirement_is_raised_to_limited() {
        let requirement = Requirement::feature(Feature::Analytics, AccessLevel::None);
        assert_eq!(
            requirement.required_feature(),
            Some((Feature::Analytics, AccessLevel::Limited))
        );

        let (guard, _store) = guard_for(tenant_user());
        assert!(matches!(
            guard.decide(&requirement),
            Decision::Deny(AuthorizationError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn unknown_feature_fails_closed() {
        let (guard, _store) = guard_for(tenant_user());
        assert!(!guard
            .decide(&Requirement::feature(Feature::Backup, AccessLevel::Limited))
            .is_allowed());
    }

    #[test]
    fn navigation_surface_reflects_principal() {
        let principal = Principal::builder("u-5", Role::TenantUser)
            .tenant("acme")
            .grant("analytics:limited")
            .build();
        let (guard, _store) = guard_for(principal);

        assert_eq!(guard.feature_access(Feature::Users), AccessLevel::Limited);
        assert_eq!(guard.feature_access(Feature::Analytics), AccessLevel::Limited);
        assert_eq!(
            guard.accessible_features(),
            vec![
                (Feature::Users, AccessLevel::Limited),
                (Feature::Analytics, AccessLevel::Limited),
            ]
        );
        assert_eq!(guard.role_class(), Some(RoleClass::Tenant));
    }

    #[test]
    fn inactive_principal_is_denied_features_but_stays_signed_in() {
        let principal = Principal::builder("u-6", Role::TenantAdmin)
            .tenant("acme")
            .active(false)
            .build();
        let (guard, _store) = guard_for(principal);

        assert!(guard.decide(&Requirement::authenticated()).is_allowed());
        assert!(!guard
            .decide(&Requirement::feature(Feature::Users, AccessLevel::Limited))
            .is_allowed());
    }
}

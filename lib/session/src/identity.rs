//! Port to the identity backend.
//!
//! The session core calls the backend only through [`IdentityProvider`].
//! [`HttpIdentityClient`](crate::HttpIdentityClient) is the production
//! adapter; tests use scripted doubles.

use crate::error::IdentityError;
use crate::session::TokenPair;
use async_trait::async_trait;
use gatekeeper_access::Principal;
use std::future::Future;
use std::time::Duration;

/// Email and password as entered by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Sign-up form data.
#[derive(Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    pub agree_to_terms: bool,
}

impl Registration {
    /// Splits the display name into first and last name on the first
    /// space.
    #[must_use]
    pub fn name_parts(&self) -> (&str, &str) {
        let name = self.name.trim();
        match name.split_once(' ') {
            Some((first, last)) => (first, last.trim()),
            None => (name, ""),
        }
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("agree_to_terms", &self.agree_to_terms)
            .finish_non_exhaustive()
    }
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub tokens: TokenPair,
    pub principal: Principal,
}

/// Operations the identity backend offers.
///
/// Implementations report raw failures; classification into the session
/// taxonomy happens in the caller.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, IdentityError>;

    async fn register(&self, registration: &Registration) -> Result<(), IdentityError>;

    /// Returns the principal the access token belongs to.
    async fn validate(&self, access_token: &str) -> Result<Principal, IdentityError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, IdentityError>;

    async fn logout(&self, access_token: &str) -> Result<(), IdentityError>;

    async fn forgot_password(&self, email: &str) -> Result<(), IdentityError>;

    async fn reset_password(
        &self,
        reset_token: &str,
        new_password: &str,
    ) -> Result<(), IdentityError>;
}

/// Runs a backend call with a time budget. Exceeding it is a
/// [`IdentityError::Timeout`].
pub(crate) async fn bounded<T>(
    budget: Duration,
    call: impl Future<Output = Result<T, IdentityError>>,
) -> Result<T, IdentityError> {
    tokio::time::timeout(budget, call)
        .await
        .unwrap_or(Err(IdentityError::Timeout))
}

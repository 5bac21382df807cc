//! Scripted identity backend for tests.
//!
//! `ScriptedIdentity` behaves like a small in-memory auth service: accounts
//! log in, tokens validate until logged out, refresh tokens mint new pairs.
//! Tests can queue specific outcomes for `validate` and `refresh`, hold
//! refreshes open with a gate, and count calls.

use crate::error::IdentityError;
use crate::identity::{Credentials, IdentityProvider, LoginGrant, Registration};
use crate::session::TokenPair;
use async_trait::async_trait;
use chrono::Duration;
use gatekeeper_access::{Principal, Role};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;

#[derive(Default)]
struct Script {
    accounts: HashMap<String, (String, Principal)>,
    access_tokens: HashMap<String, Principal>,
    refresh_tokens: HashMap<String, Principal>,
    validate_results: VecDeque<Result<Principal, IdentityError>>,
    refresh_results: VecDeque<Result<TokenPair, IdentityError>>,
    logout_error: Option<IdentityError>,
    issued: u64,
    token_lifetime: Option<Duration>,
}

impl Script {
    fn mint(&mut self, principal: &Principal) -> TokenPair {
        self.issued += 1;
        let pair = TokenPair {
            access_token: format!("access-{}", self.issued),
            refresh_token: Some(format!("refresh-{}", self.issued)),
            expires_in: self.token_lifetime,
        };
        self.access_tokens
            .insert(pair.access_token.clone(), principal.clone());
        if let Some(refresh_token) = &pair.refresh_token {
            self.refresh_tokens
                .insert(refresh_token.clone(), principal.clone());
        }
        pair
    }
}

/// In-memory identity backend with scripted failures.
#[derive(Default)]
pub struct ScriptedIdentity {
    script: Mutex<Script>,
    refresh_gate: Mutex<Option<Arc<Semaphore>>>,
    login_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    register_calls: AtomicUsize,
    password_calls: AtomicUsize,
}

pub(crate) fn unauthorized(message: &str) -> IdentityError {
    IdentityError::Status {
        code: 401,
        error: Some("unauthorized".to_string()),
        message: Some(message.to_string()),
    }
}

impl ScriptedIdentity {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account that can log in.
    #[must_use]
    pub fn with_account(self, email: &str, password: &str, principal: Principal) -> Self {
        self.lock()
            .accounts
            .insert(email.to_string(), (password.to_string(), principal));
        self
    }

    /// Sets the lifetime reported for minted access tokens.
    #[must_use]
    pub fn with_token_lifetime(self, lifetime: Duration) -> Self {
        self.lock().token_lifetime = Some(lifetime);
        self
    }

    /// Registers an access token as valid for `principal`.
    pub fn accept_token(&self, access_token: &str, principal: Principal) {
        self.lock()
            .access_tokens
            .insert(access_token.to_string(), principal);
    }

    /// Registers a refresh token as usable for `principal`.
    pub fn accept_refresh_token(&self, refresh_token: &str, principal: Principal) {
        self.lock()
            .refresh_tokens
            .insert(refresh_token.to_string(), principal);
    }

    /// Queues the outcome of the next `validate` call.
    pub fn push_validate(&self, result: Result<Principal, IdentityError>) {
        self.lock().validate_results.push_back(result);
    }

    /// Queues the same validate failure `times` times.
    pub fn fail_validate(&self, error: IdentityError, times: usize) {
        let mut script = self.lock();
        for _ in 0..times {
            script.validate_results.push_back(Err(error.clone()));
        }
    }

    /// Queues the outcome of the next `refresh` call.
    pub fn push_refresh(&self, result: Result<TokenPair, IdentityError>) {
        self.lock().refresh_results.push_back(result);
    }

    /// Makes `logout` fail with `error`.
    pub fn fail_logout(&self, error: IdentityError) {
        self.lock().logout_error = Some(error);
    }

    /// Holds every refresh until the returned semaphore gets a permit.
    #[must_use]
    pub fn hold_refresh(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self
            .refresh_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(gate.clone());
        gate
    }

    #[must_use]
    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn validate_calls(&self) -> usize {
        self.validate_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn register_calls(&self) -> usize {
        self.register_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn password_calls(&self) -> usize {
        self.password_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IdentityProvider for ScriptedIdentity {
    async fn login(&self, credentials: &Credentials) -> Result<LoginGrant, IdentityError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.lock();
        let principal = match script.accounts.get(&credentials.email) {
            Some((password, principal)) if *password == credentials.password => principal.clone(),
            _ => return Err(unauthorized("Invalid credentials")),
        };
        let tokens = script.mint(&principal);
        Ok(LoginGrant { tokens, principal })
    }

    async fn register(&self, registration: &Registration) -> Result<(), IdentityError> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.lock();
        if script.accounts.contains_key(&registration.email) {
            return Err(IdentityError::Status {
                code: 409,
                error: Some("conflict".to_string()),
                message: Some("Email already registered".to_string()),
            });
        }
        let id = format!("u-{}", script.accounts.len() + 1);
        let principal = Principal::builder(id, Role::EndCustomer)
            .email(registration.email.clone())
            .display_name(registration.name.trim())
            .build();
        script.accounts.insert(
            registration.email.clone(),
            (registration.password.clone(), principal),
        );
        Ok(())
    }

    async fn validate(&self, access_token: &str) -> Result<Principal, IdentityError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.lock();
        if let Some(result) = script.validate_results.pop_front() {
            return result;
        }
        script
            .access_tokens
            .get(access_token)
            .cloned()
            .ok_or_else(|| unauthorized("Invalid token"))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, IdentityError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self
            .refresh_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let mut script = self.lock();
        if let Some(result) = script.refresh_results.pop_front() {
            return result;
        }
        let principal = script
            .refresh_tokens
            .remove(refresh_token)
            .ok_or_else(|| unauthorized("Invalid refresh token"))?;
        Ok(script.mint(&principal))
    }

    async fn logout(&self, access_token: &str) -> Result<(), IdentityError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.lock();
        if let Some(error) = script.logout_error.clone() {
            return Err(error);
        }
        script.access_tokens.remove(access_token);
        Ok(())
    }

    async fn forgot_password(&self, _email: &str) -> Result<(), IdentityError> {
        self.password_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reset_password(
        &self,
        reset_token: &str,
        _new_password: &str,
    ) -> Result<(), IdentityError> {
        self.password_calls.fetch_add(1, Ordering::SeqCst);
        if reset_token.is_empty() {
            return Err(IdentityError::Status {
                code: 400,
                error: Some("bad_request".to_string()),
                message: Some("Invalid reset token".to_string()),
            });
        }
        Ok(())
    }
}

//! Session lifecycle orchestration.
//!
//! [`SessionController`] is the only component that talks to the identity
//! backend on behalf of the session and then mutates [`SessionStore`]. Every
//! asynchronous result is tagged with the session generation it was started
//! for and dropped if the session has moved on by the time it arrives.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::identity::{Credentials, IdentityProvider, Registration, bounded};
use crate::session::{LogoutReason, Session, SessionStatus, TokenPair};
use crate::store::SessionStore;
use crate::validator::{TokenStatus, TokenValidator};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use gatekeeper_access::{Principal, Role};
use rootcause::prelude::Report;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, instrument, warn};

/// Minimum password length accepted at registration.
pub const MIN_PASSWORD_LEN: usize = 6;

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenPair, SessionError>>>;

struct InFlight {
    generation: u64,
    flight: u64,
    future: RefreshFuture,
}

/// Outcome of validating the current session's token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Generation of the session the token belonged to.
    pub generation: u64,
    pub status: TokenStatus,
}

/// Orchestrates login, registration, logout, role switching and refresh.
pub struct SessionController {
    store: Arc<SessionStore>,
    identity: Arc<dyn IdentityProvider>,
    validator: TokenValidator,
    config: SessionConfig,
    refresh_slot: Mutex<Option<InFlight>>,
    flights: AtomicU64,
}

impl SessionController {
    #[must_use]
    pub fn new(
        store: Arc<SessionStore>,
        identity: Arc<dyn IdentityProvider>,
        config: SessionConfig,
    ) -> Self {
        let validator = TokenValidator::new(Arc::clone(&identity), config.request_timeout());
        Self {
            store,
            identity,
            validator,
            config,
            refresh_slot: Mutex::new(None),
            flights: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.store.snapshot()
    }

    /// Returns true if `generation` still identifies the live session.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        let session = self.store.snapshot();
        session.generation() == generation && session.is_live()
    }

    /// Logs in with email and password.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` without calling the backend if either
    /// field is blank, otherwise the classified backend failure.
    #[instrument(skip_all)]
    pub async fn login(&self, credentials: Credentials) -> Result<Session, Report<SessionError>> {
        let credentials = Credentials::new(credentials.email.trim(), credentials.password);
        if credentials.email.is_empty() || credentials.password.trim().is_empty() {
            return Err(SessionError::InvalidCredentials {
                reason: "email and password are required".to_string(),
            }
            .into());
        }

        let grant = bounded(self.config.request_timeout(), self.identity.login(&credentials))
            .await
            .map_err(|e| e.classify())?;
        Ok(self.store.login(grant.tokens, grant.principal)?)
    }

    /// Registers an account and then logs in with it.
    ///
    /// # Errors
    ///
    /// Returns `RegistrationRejected` without calling the backend if the
    /// form is incomplete, otherwise the classified backend failure.
    #[instrument(skip_all)]
    pub async fn register(
        &self,
        registration: Registration,
    ) -> Result<Session, Report<SessionError>> {
        check_registration(&registration)?;

        bounded(
            self.config.request_timeout(),
            self.identity.register(&registration),
        )
        .await
        .map_err(|e| e.classify())?;
        info!("Account registered");

        self.login(Credentials::new(registration.email, registration.password))
            .await
    }

    /// Logs out.
    ///
    /// The local session is cleared first, so any refresh or validation
    /// still in flight is discarded. The backend is told afterwards and its
    /// answer does not matter.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> Session {
        let previous = self.store.snapshot();
        let cleared = self.store.clear(LogoutReason::UserRequested);
        self.abandon_refresh();

        if let Some(token) = previous.access_token() {
            let result = bounded(self.config.request_timeout(), self.identity.logout(token)).await;
            if let Err(e) = result {
                warn!(error = %e, "Backend logout failed; local session already cleared");
            }
        }
        cleared
    }

    /// Ends the session without asking the backend.
    pub fn force_logout(&self, reason: LogoutReason) -> Session {
        let cleared = self.store.clear(reason);
        self.abandon_refresh();
        cleared
    }

    /// Ends the session only if it is still the one issued at `generation`.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session has changed.
    pub fn force_logout_for(
        &self,
        generation: u64,
        reason: LogoutReason,
    ) -> Result<Session, SessionError> {
        let cleared = self.store.clear_if(generation, reason)?;
        self.abandon_refresh();
        Ok(cleared)
    }

    /// Makes another held role the primary role. No backend call.
    ///
    /// # Errors
    ///
    /// Returns `NotAuthenticated` without a live session and `RoleNotHeld`
    /// if the principal does not hold `role`.
    pub fn switch_role(&self, role: Role) -> Result<Session, Report<SessionError>> {
        let session = self.store.snapshot();
        let principal = session
            .principal()
            .filter(|_| session.is_live())
            .ok_or(SessionError::NotAuthenticated)?;
        let switched = principal
            .with_primary_role(&role)
            .ok_or_else(|| SessionError::RoleNotHeld { role: role.clone() })?;

        info!(role = %role, "Switching primary role");
        Ok(self.store.set_principal(session.generation(), switched)?)
    }

    /// Refreshes the token pair.
    ///
    /// Single flight: while a refresh for the current session is running,
    /// callers share its result instead of issuing another request.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed while the refresh was in
    /// flight, `NoRefreshToken` if there is nothing to refresh with, or the
    /// classified backend failure.
    pub async fn refresh(&self) -> Result<TokenPair, Report<SessionError>> {
        Ok(self.refresh_shared().await?)
    }

    /// Refreshes if the access token is within the configured margin of its
    /// estimated expiry, or joins a refresh that is already running.
    ///
    /// Returns `None` when no refresh was needed.
    ///
    /// # Errors
    ///
    /// Same as [`refresh`](Self::refresh).
    pub async fn refresh_if_needed(&self) -> Result<Option<TokenPair>, Report<SessionError>> {
        let session = self.store.snapshot();
        if !session.is_live() {
            return Ok(None);
        }
        let joining = self
            .lock_slot()
            .as_ref()
            .is_some_and(|in_flight| in_flight.generation == session.generation());
        if !joining && !session.needs_refresh(self.store.now(), self.config.refresh_margin()) {
            return Ok(None);
        }
        Ok(Some(self.refresh_shared().await?))
    }

    /// Validates the current access token without changing any state.
    ///
    /// Returns `None` if there is no live session.
    pub async fn probe(&self) -> Option<Probe> {
        let session = self.store.snapshot();
        if !session.is_live() {
            return None;
        }
        let token = session.access_token()?;
        let status = self.validator.validate(token).await;
        Some(Probe {
            generation: session.generation(),
            status,
        })
    }

    /// Applies a successful validation: stores the fresh principal and
    /// marks the session authenticated.
    ///
    /// A primary role picked with [`switch_role`](Self::switch_role) is kept
    /// as long as the fresh principal still holds it.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed since `generation`.
    pub fn confirm(&self, generation: u64, principal: Principal) -> Result<Session, SessionError> {
        let current = self.store.snapshot();
        let principal = match current.principal() {
            Some(local)
                if local.id() == principal.id()
                    && local.primary_role() != principal.primary_role() =>
            {
                principal
                    .with_primary_role(local.primary_role())
                    .unwrap_or(principal)
            }
            _ => principal,
        };
        if current.principal() != Some(&principal) {
            self.store.set_principal(generation, principal)?;
        }
        self.store.mark(generation, SessionStatus::Authenticated)
    }

    /// Marks the session authenticated after a successful check.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed since `generation`.
    pub fn mark_authenticated(&self, generation: u64) -> Result<Session, SessionError> {
        self.store.mark(generation, SessionStatus::Authenticated)
    }

    /// Marks the session suspect after a failed check.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed since `generation`.
    pub fn mark_suspect(&self, generation: u64) -> Result<Session, SessionError> {
        self.store.mark(generation, SessionStatus::Suspect)
    }

    /// Asks the backend to send a password reset email.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` for a blank email, otherwise the
    /// classified backend failure.
    #[instrument(skip_all)]
    pub async fn forgot_password(&self, email: &str) -> Result<(), Report<SessionError>> {
        let email = email.trim();
        if email.is_empty() {
            return Err(SessionError::InvalidCredentials {
                reason: "email is required".to_string(),
            }
            .into());
        }
        bounded(
            self.config.request_timeout(),
            self.identity.forgot_password(email),
        )
        .await
        .map_err(|e| e.classify())?;
        Ok(())
    }

    /// Sets a new password using a reset token.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` for blank input, otherwise the
    /// classified backend failure.
    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        reset_token: &str,
        new_password: &str,
    ) -> Result<(), Report<SessionError>> {
        if reset_token.trim().is_empty() || new_password.len() < MIN_PASSWORD_LEN {
            return Err(SessionError::InvalidCredentials {
                reason: format!(
                    "a reset token and a password of at least {MIN_PASSWORD_LEN} characters are required"
                ),
            }
            .into());
        }
        bounded(
            self.config.request_timeout(),
            self.identity.reset_password(reset_token, new_password),
        )
        .await
        .map_err(|e| e.classify())?;
        Ok(())
    }

    pub(crate) async fn refresh_shared(&self) -> Result<TokenPair, SessionError> {
        let (generation, flight, future) = self.join_or_start_refresh()?;
        let result = future.await;
        let owner = self.finish_flight(flight);

        match result {
            Ok(tokens) if owner => {
                self.store.refresh(generation, tokens.clone())?;
                Ok(tokens)
            }
            Ok(tokens) => {
                if self.store.generation() != generation {
                    return Err(SessionError::Superseded);
                }
                Ok(tokens)
            }
            Err(_) if self.store.generation() != generation => {
                debug!(generation, "Discarding failed refresh for superseded session");
                Err(SessionError::Superseded)
            }
            Err(e) => {
                warn!(error = %e, generation, "Token refresh failed");
                Err(e)
            }
        }
    }

    fn join_or_start_refresh(&self) -> Result<(u64, u64, RefreshFuture), SessionError> {
        let mut slot = self.lock_slot();
        let session = self.store.snapshot();
        if !session.is_live() {
            return Err(SessionError::NotAuthenticated);
        }

        if let Some(in_flight) = slot
            .as_ref()
            .filter(|in_flight| in_flight.generation == session.generation())
        {
            debug!(generation = in_flight.generation, "Joining in-flight refresh");
            return Ok((
                in_flight.generation,
                in_flight.flight,
                in_flight.future.clone(),
            ));
        }

        let refresh_token = session
            .refresh_token()
            .ok_or(SessionError::NoRefreshToken)?
            .to_string();
        let identity = Arc::clone(&self.identity);
        let budget = self.config.request_timeout();
        let future = async move {
            bounded(budget, identity.refresh(&refresh_token))
                .await
                .map_err(|e| e.classify())
        }
        .boxed()
        .shared();

        let flight = self.flights.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(generation = session.generation(), flight, "Starting token refresh");
        *slot = Some(InFlight {
            generation: session.generation(),
            flight,
            future: future.clone(),
        });
        Ok((session.generation(), flight, future))
    }

    /// Clears the slot if it still holds `flight`. Returns true for the one
    /// caller that did so.
    fn finish_flight(&self, flight: u64) -> bool {
        let mut slot = self.lock_slot();
        if slot
            .as_ref()
            .is_some_and(|in_flight| in_flight.flight == flight)
        {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn abandon_refresh(&self) {
        self.lock_slot().take();
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.refresh_slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn check_registration(registration: &Registration) -> Result<(), SessionError> {
    let reject = |reason: &str| {
        Err(SessionError::RegistrationRejected {
            reason: reason.to_string(),
        })
    };

    if registration.name.trim().is_empty() {
        return reject("name is required");
    }
    if !registration.email.contains('@') {
        return reject("a valid email is required");
    }
    if registration.password.len() < MIN_PASSWORD_LEN {
        return reject("password is too short");
    }
    if registration.password != registration.confirm_password {
        return reject("passwords do not match");
    }
    if !registration.agree_to_terms {
        return reject("terms must be accepted");
    }
    Ok(())
}

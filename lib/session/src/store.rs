//! Single owner of the session value.
//!
//! All mutation goes through the named transitions on [`SessionStore`].
//! Each transition is applied under one lock, persisted, and then published
//! to subscribers, so readers only ever see whole snapshots.

use crate::clock::Clock;
use crate::error::{SessionError, StorageError};
use crate::session::{LogoutReason, Session, SessionStatus, TokenPair};
use crate::storage::{
    ACCESS_TOKEN_KEY, EXPIRES_AT_KEY, KeyValueStore, PRINCIPAL_KEY, REFRESH_TOKEN_KEY,
    migrate_legacy_keys,
};
use chrono::{DateTime, Utc};
use gatekeeper_access::Principal;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const SESSION_KEYS: [&str; 4] = [
    ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY,
    PRINCIPAL_KEY,
    EXPIRES_AT_KEY,
];

/// Holds the one session value and persists every change.
///
/// Persistence is best effort: a storage failure is logged and the
/// in-memory transition still applies.
pub struct SessionStore {
    session: Mutex<Session>,
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    updates: watch::Sender<Session>,
}

impl SessionStore {
    /// Opens the store, migrating legacy keys and rehydrating any persisted
    /// session.
    ///
    /// A complete persisted session comes back as `Validating` until the
    /// backend confirms it. Partial or corrupt state is discarded.
    pub fn open(storage: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        if let Err(e) = migrate_legacy_keys(storage.as_ref()) {
            warn!(error = %e, "Failed to migrate legacy session keys");
        }

        let session = match read_persisted(storage.as_ref()) {
            Ok(Some(session)) => {
                info!(
                    principal = %session.principal.as_ref().map(|p| p.id().as_str()).unwrap_or_default(),
                    "Rehydrated persisted session"
                );
                session
            }
            Ok(None) => {
                remove_keys(storage.as_ref());
                Session::anonymous(0)
            }
            Err(e) => {
                warn!(error = %e, "Discarding unreadable persisted session");
                remove_keys(storage.as_ref());
                Session::anonymous(0)
            }
        };

        let (updates, _) = watch::channel(session.clone());
        Self {
            session: Mutex::new(session),
            storage,
            clock,
            updates,
        }
    }

    /// Returns the current session.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.lock().clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Subscribes to session snapshots. The receiver starts with the current
    /// value.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.updates.subscribe()
    }

    /// Starts a new session, replacing whatever was there.
    ///
    /// # Errors
    ///
    /// Returns `AuthInvalid` if the access token is empty.
    pub fn login(&self, tokens: TokenPair, principal: Principal) -> Result<Session, SessionError> {
        let now = self.clock.now();
        self.transition(|session| {
            ensure_token(&tokens)?;
            *session = Session {
                status: SessionStatus::Authenticated,
                generation: session.generation + 1,
                expires_at: expiry(now, tokens.expires_in),
                access_token: Some(tokens.access_token),
                refresh_token: tokens.refresh_token,
                principal: Some(principal),
                logout_reason: None,
            };
            info!(
                principal = %session.principal.as_ref().map(|p| p.id().as_str()).unwrap_or_default(),
                generation = session.generation,
                "Session started"
            );
            Ok(())
        })
    }

    /// Rotates tokens for the session issued at `generation`.
    ///
    /// The principal is unchanged. If the backend did not send a new refresh
    /// token the old one is kept.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed since `generation`, and
    /// `AuthInvalid` if the access token is empty.
    pub fn refresh(&self, generation: u64, tokens: TokenPair) -> Result<Session, SessionError> {
        let now = self.clock.now();
        self.transition(|session| {
            ensure_current(session, generation)?;
            ensure_token(&tokens)?;
            session.access_token = Some(tokens.access_token);
            if let Some(refresh_token) = tokens.refresh_token {
                session.refresh_token = Some(refresh_token);
            }
            session.expires_at = expiry(now, tokens.expires_in);
            debug!(generation, "Session tokens rotated");
            Ok(())
        })
    }

    /// Replaces the principal snapshot for the session issued at
    /// `generation`.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed since `generation`.
    pub fn set_principal(
        &self,
        generation: u64,
        principal: Principal,
    ) -> Result<Session, SessionError> {
        self.transition(|session| {
            ensure_current(session, generation)?;
            session.principal = Some(principal);
            Ok(())
        })
    }

    /// Moves a live session between `Authenticated`, `Validating` and
    /// `Suspect`.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed since `generation`, and
    /// `NotAuthenticated` if `status` is not a live status.
    pub fn mark(&self, generation: u64, status: SessionStatus) -> Result<Session, SessionError> {
        if !status.is_live() {
            return Err(SessionError::NotAuthenticated);
        }
        self.transition(|session| {
            ensure_current(session, generation)?;
            if session.status != status {
                debug!(generation, from = %session.status, to = %status, "Session status changed");
                session.status = status;
            }
            Ok(())
        })
    }

    /// Ends the current session whatever its generation.
    ///
    /// A user-requested logout leaves the store `Anonymous`; any other reason
    /// leaves it `Unauthenticated`.
    pub fn clear(&self, reason: LogoutReason) -> Session {
        let mut guard = self.lock();
        let next = cleared(&guard, reason);
        self.commit(&mut guard, next)
    }

    /// Ends the session only if it is still the one issued at `generation`.
    ///
    /// # Errors
    ///
    /// Returns `Superseded` if the session changed since `generation`.
    pub fn clear_if(&self, generation: u64, reason: LogoutReason) -> Result<Session, SessionError> {
        let mut guard = self.lock();
        ensure_current(&guard, generation)?;
        let next = cleared(&guard, reason);
        Ok(self.commit(&mut guard, next))
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        apply: impl FnOnce(&mut Session) -> Result<(), SessionError>,
    ) -> Result<Session, SessionError> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        apply(&mut next)?;
        Ok(self.commit(&mut guard, next))
    }

    fn commit(&self, current: &mut Session, next: Session) -> Session {
        if persisted_fields_changed(current, &next) {
            self.persist(&next);
        }
        *current = next.clone();
        self.updates.send_replace(next.clone());
        next
    }

    fn persist(&self, session: &Session) {
        let storage = self.storage.as_ref();
        let result = match (&session.access_token, &session.principal) {
            (Some(token), Some(principal)) if session.status.is_live() => {
                write_session(storage, token, session, principal)
            }
            _ => {
                remove_keys(storage);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(error = %e, generation = session.generation, "Failed to persist session");
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.lock();
        f.debug_struct("SessionStore")
            .field("status", &session.status)
            .field("generation", &session.generation)
            .finish_non_exhaustive()
    }
}

fn ensure_current(session: &Session, generation: u64) -> Result<(), SessionError> {
    if session.generation != generation || !session.is_live() {
        return Err(SessionError::Superseded);
    }
    Ok(())
}

/// Estimated expiry; a lifetime past chrono's range counts as unknown.
fn expiry(now: DateTime<Utc>, lifetime: Option<chrono::Duration>) -> Option<DateTime<Utc>> {
    let lifetime = lifetime?;
    let expires_at = now.checked_add_signed(lifetime);
    if expires_at.is_none() {
        warn!(
            lifetime_secs = lifetime.num_seconds(),
            "Token lifetime out of range; expiry unknown"
        );
    }
    expires_at
}

fn ensure_token(tokens: &TokenPair) -> Result<(), SessionError> {
    if tokens.access_token.trim().is_empty() {
        return Err(SessionError::AuthInvalid {
            reason: "backend issued an empty access token".to_string(),
        });
    }
    Ok(())
}

fn cleared(current: &Session, reason: LogoutReason) -> Session {
    let mut next = Session::anonymous(current.generation + 1);
    if reason.is_forced() {
        next.status = SessionStatus::Unauthenticated;
        warn!(generation = current.generation, ?reason, "Session ended");
    } else {
        info!(generation = current.generation, "Session ended by user");
    }
    next.logout_reason = Some(reason);
    next
}

fn persisted_fields_changed(prev: &Session, next: &Session) -> bool {
    prev.status.is_live() != next.status.is_live()
        || prev.access_token != next.access_token
        || prev.refresh_token != next.refresh_token
        || prev.expires_at != next.expires_at
        || prev.principal != next.principal
}

fn write_session(
    storage: &dyn KeyValueStore,
    token: &str,
    session: &Session,
    principal: &Principal,
) -> Result<(), StorageError> {
    let principal = serde_json::to_string(principal).map_err(|e| StorageError::Serialization {
        reason: e.to_string(),
    })?;
    storage.set(ACCESS_TOKEN_KEY, token)?;
    storage.set(PRINCIPAL_KEY, &principal)?;
    match &session.refresh_token {
        Some(refresh_token) => storage.set(REFRESH_TOKEN_KEY, refresh_token)?,
        None => storage.remove(REFRESH_TOKEN_KEY)?,
    }
    match session.expires_at {
        Some(expires_at) => storage.set(EXPIRES_AT_KEY, &expires_at.to_rfc3339())?,
        None => storage.remove(EXPIRES_AT_KEY)?,
    }
    Ok(())
}

fn read_persisted(storage: &dyn KeyValueStore) -> Result<Option<Session>, StorageError> {
    let Some(token) = storage
        .get(ACCESS_TOKEN_KEY)?
        .filter(|token| !token.trim().is_empty())
    else {
        return Ok(None);
    };
    let Some(raw_principal) = storage.get(PRINCIPAL_KEY)? else {
        return Ok(None);
    };
    let principal: Principal =
        serde_json::from_str(&raw_principal).map_err(|e| StorageError::Serialization {
            reason: e.to_string(),
        })?;
    let expires_at = storage
        .get(EXPIRES_AT_KEY)?
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc));

    Ok(Some(Session {
        status: SessionStatus::Validating,
        generation: 1,
        access_token: Some(token),
        refresh_token: storage.get(REFRESH_TOKEN_KEY)?,
        expires_at,
        principal: Some(principal),
        logout_reason: None,
    }))
}

fn remove_keys(storage: &dyn KeyValueStore) {
    for key in SESSION_KEYS {
        if let Err(e) = storage.remove(key) {
            warn!(error = %e, key, "Failed to remove session key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{FileStore, LEGACY_PRINCIPAL_KEY, MemoryStore};
    use chrono::Duration;
    use gatekeeper_access::Role;

    fn principal() -> Principal {
        Principal::builder("u-1", Role::TenantAdmin)
            .tenant("t-1")
            .build()
    }

    fn open(storage: Arc<MemoryStore>) -> (SessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (SessionStore::open(storage, clock.clone()), clock)
    }

    /// Storage whose writes always fail.
    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Io {
                reason: "disk full".to_string(),
            })
        }
        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Io {
                reason: "disk full".to_string(),
            })
        }
    }

    #[test]
    fn starts_anonymous_with_empty_storage() {
        let (store, _) = open(Arc::new(MemoryStore::new()));
        let session = store.snapshot();
        assert_eq!(session.status(), SessionStatus::Anonymous);
        assert_eq!(session.generation(), 0);
    }

    #[test]
    fn login_authenticates_and_persists() {
        let storage = Arc::new(MemoryStore::new());
        let (store, clock) = open(storage.clone());

        let session = store
            .login(
                TokenPair::new("tok", "ref").expires_in(Duration::minutes(15)),
                principal(),
            )
            .expect("login");

        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(session.generation(), 1);
        assert_eq!(session.access_token(), Some("tok"));
        assert_eq!(session.expires_at(), Some(clock.now() + Duration::minutes(15)));
        assert_eq!(
            storage.get(ACCESS_TOKEN_KEY).expect("get").as_deref(),
            Some("tok")
        );
        assert_eq!(
            storage.get(REFRESH_TOKEN_KEY).expect("get").as_deref(),
            Some("ref")
        );
        assert!(storage.get(PRINCIPAL_KEY).expect("get").is_some());
    }

    #[test]
    fn login_rejects_empty_token() {
        let (store, _) = open(Arc::new(MemoryStore::new()));
        let err = store
            .login(TokenPair::new("  ", "ref"), principal())
            .unwrap_err();
        assert!(matches!(err, SessionError::AuthInvalid { .. }));
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn persisted_session_is_rehydrated_as_validating() {
        let storage = Arc::new(MemoryStore::new());
        {
            let (store, _) = open(storage.clone());
            store
                .login(TokenPair::new("tok", "ref"), principal())
                .expect("login");
        }

        let (store, _) = open(storage);
        let session = store.snapshot();
        assert_eq!(session.status(), SessionStatus::Validating);
        assert_eq!(session.access_token(), Some("tok"));
        assert_eq!(session.refresh_token(), Some("ref"));
        assert_eq!(session.principal(), Some(&principal()));
    }

    #[test]
    fn corrupt_persisted_principal_is_discarded() {
        let storage = Arc::new(MemoryStore::with_entries([
            (ACCESS_TOKEN_KEY, "tok"),
            (PRINCIPAL_KEY, "{not json"),
        ]));
        let (store, _) = open(storage.clone());

        assert_eq!(store.snapshot().status(), SessionStatus::Anonymous);
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn unreadable_session_file_is_repaired_by_next_login() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        std::fs::write(&path, "not json").expect("write");
        let clock = Arc::new(ManualClock::new(Utc::now()));

        let store = SessionStore::open(Arc::new(FileStore::new(&path)), clock.clone());
        assert_eq!(store.snapshot().status(), SessionStatus::Anonymous);
        store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login");

        let reopened = SessionStore::open(Arc::new(FileStore::new(&path)), clock);
        let session = reopened.snapshot();
        assert_eq!(session.status(), SessionStatus::Validating);
        assert_eq!(session.access_token(), Some("tok"));
    }

    #[test]
    fn legacy_principal_key_is_migrated_on_open() {
        let raw = serde_json::to_string(&principal()).expect("serialize");
        let storage = Arc::new(MemoryStore::with_entries([
            (ACCESS_TOKEN_KEY, "tok".to_string()),
            (LEGACY_PRINCIPAL_KEY, raw.clone()),
        ]));

        let (store, _) = open(storage.clone());
        assert_eq!(store.snapshot().status(), SessionStatus::Validating);
        assert_eq!(storage.get(PRINCIPAL_KEY).expect("get"), Some(raw));
        assert_eq!(storage.get(LEGACY_PRINCIPAL_KEY).expect("get"), None);

        let keys_after_first = storage.keys();
        let (reopened, _) = open(storage.clone());
        assert_eq!(storage.keys(), keys_after_first);
        assert_eq!(reopened.snapshot().status(), SessionStatus::Validating);
    }

    #[test]
    fn refresh_rotates_tokens_and_keeps_principal() {
        let (store, _) = open(Arc::new(MemoryStore::new()));
        let generation = store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login")
            .generation();

        let session = store
            .refresh(
                generation,
                TokenPair {
                    access_token: "tok2".to_string(),
                    refresh_token: None,
                    expires_in: None,
                },
            )
            .expect("refresh");

        assert_eq!(session.access_token(), Some("tok2"));
        assert_eq!(session.refresh_token(), Some("ref"));
        assert_eq!(session.principal(), Some(&principal()));
        assert_eq!(session.generation(), generation);
    }

    #[test]
    fn out_of_range_lifetime_leaves_expiry_unknown() {
        let (store, _) = open(Arc::new(MemoryStore::new()));
        let huge = Duration::try_seconds(10_000_000_000_000).expect("representable");

        let session = store
            .login(TokenPair::new("tok", "ref").expires_in(huge), principal())
            .expect("login");
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(session.expires_at(), None);

        let session = store
            .refresh(
                session.generation(),
                TokenPair::new("tok2", "ref2").expires_in(huge),
            )
            .expect("refresh");
        assert_eq!(session.access_token(), Some("tok2"));
        assert_eq!(session.expires_at(), None);
    }

    #[test]
    fn stale_refresh_is_rejected_after_clear() {
        let storage = Arc::new(MemoryStore::new());
        let (store, _) = open(storage.clone());
        let generation = store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login")
            .generation();
        store.clear(LogoutReason::UserRequested);

        let err = store
            .refresh(generation, TokenPair::new("late", "late"))
            .unwrap_err();
        assert_eq!(err, SessionError::Superseded);
        assert_eq!(store.snapshot().access_token(), None);
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn clear_reason_decides_final_status() {
        let (store, _) = open(Arc::new(MemoryStore::new()));

        store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login");
        let session = store.clear(LogoutReason::UserRequested);
        assert_eq!(session.status(), SessionStatus::Anonymous);

        store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login");
        let session = store.clear(LogoutReason::SessionInvalid);
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(session.logout_reason(), Some(LogoutReason::SessionInvalid));
        assert_eq!(session.generation(), 4);
    }

    #[test]
    fn clear_if_ignores_other_generations() {
        let (store, _) = open(Arc::new(MemoryStore::new()));
        let first = store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login")
            .generation();
        let second = store
            .login(TokenPair::new("tok2", "ref2"), principal())
            .expect("login")
            .generation();

        assert_eq!(
            store.clear_if(first, LogoutReason::RetryBudgetExhausted),
            Err(SessionError::Superseded)
        );
        assert!(store.snapshot().is_live());
        assert!(store.clear_if(second, LogoutReason::RetryBudgetExhausted).is_ok());
        assert!(!store.snapshot().is_live());
    }

    #[test]
    fn mark_only_accepts_live_statuses() {
        let (store, _) = open(Arc::new(MemoryStore::new()));
        let generation = store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login")
            .generation();

        let session = store
            .mark(generation, SessionStatus::Suspect)
            .expect("mark");
        assert_eq!(session.status(), SessionStatus::Suspect);
        assert_eq!(
            store.mark(generation, SessionStatus::Anonymous),
            Err(SessionError::NotAuthenticated)
        );
    }

    #[test]
    fn storage_failures_do_not_block_transitions() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = SessionStore::open(Arc::new(BrokenStore), clock);

        let session = store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login");
        assert_eq!(session.status(), SessionStatus::Authenticated);
        assert_eq!(store.clear(LogoutReason::UserRequested).status(), SessionStatus::Anonymous);
    }

    #[test]
    fn subscribers_see_transitions() {
        let (store, _) = open(Arc::new(MemoryStore::new()));
        let mut rx = store.subscribe();
        assert_eq!(rx.borrow_and_update().status(), SessionStatus::Anonymous);

        store
            .login(TokenPair::new("tok", "ref"), principal())
            .expect("login");
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().status(), SessionStatus::Authenticated);
    }
}

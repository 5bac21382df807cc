//! Periodic session health checks.
//!
//! The monitor tells a backend hiccup apart from a session that is really
//! gone. Connectivity failures move the session to suspect and only end it
//! after a bounded number of consecutive failures; rate limiting is
//! ignored; an invalid token ends the session at once. All state changes go
//! through [`SessionController`].

use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::controller::SessionController;
use crate::error::SessionError;
use crate::session::LogoutReason;
use crate::validator::TokenStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

/// Coarse health of the session as seen by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Suspect,
    Unauthenticated,
}

/// Observable monitor state. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub suspect: bool,
    pub last_success: Option<DateTime<Utc>>,
    /// Set when the monitor ended the session.
    pub logout_reason: Option<LogoutReason>,
}

/// Result of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// There was no live session to check.
    NoSession,
    /// The session was confirmed valid.
    Healthy,
    /// The backend throttled the check; nothing changed.
    RateLimited,
    /// The backend could not confirm the session.
    Failed { consecutive_failures: u32 },
    /// The monitor ended the session.
    LoggedOut(LogoutReason),
    /// The session changed while the check was running; the result was
    /// dropped.
    Stale,
}

struct Tracker {
    generation: Option<u64>,
    state: HealthState,
}

/// Bounded-retry health monitor for the current session.
pub struct HealthMonitor {
    controller: Arc<SessionController>,
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    tracker: Mutex<Tracker>,
    updates: watch::Sender<HealthState>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        controller: Arc<SessionController>,
        config: HealthConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (updates, _) = watch::channel(HealthState::default());
        Self {
            controller,
            config,
            clock,
            tracker: Mutex::new(Tracker {
                generation: None,
                state: HealthState::default(),
            }),
            updates,
        }
    }

    /// Returns the latest published state.
    #[must_use]
    pub fn state(&self) -> HealthState {
        self.updates.borrow().clone()
    }

    /// Subscribes to state changes, e.g. to show a "server restarted"
    /// banner while suspect.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.updates.subscribe()
    }

    /// Runs one check now.
    ///
    /// Checks are serialized, so a scheduled check and an on-demand one
    /// from a route transition never interleave.
    #[instrument(skip(self))]
    pub async fn check_now(&self) -> CheckOutcome {
        let mut tracker = self.tracker.lock().await;
        let Some(probe) = self.controller.probe().await else {
            self.forget_session(&mut tracker);
            return CheckOutcome::NoSession;
        };

        if tracker.generation != Some(probe.generation) {
            debug!(generation = probe.generation, "Tracking new session");
            tracker.generation = Some(probe.generation);
            tracker.state = HealthState::default();
        }

        let generation = probe.generation;
        let outcome = match probe.status {
            TokenStatus::Valid(principal) => {
                match self.controller.confirm(generation, principal) {
                    Ok(_) => self.record_success(&mut tracker.state),
                    Err(_) => CheckOutcome::Stale,
                }
            }
            TokenStatus::RateLimited => {
                info!(generation, "Health check rate limited; will retry on schedule");
                CheckOutcome::RateLimited
            }
            TokenStatus::Unreachable { reason } => {
                self.record_failure(&mut tracker.state, generation, &reason)
            }
            TokenStatus::Expired => self.recover_expired(&mut tracker.state, generation).await,
            TokenStatus::Invalid { reason } => {
                warn!(generation, reason = %reason, "Backend rejected session token");
                self.end_session(&mut tracker.state, generation, LogoutReason::SessionInvalid)
            }
        };

        self.updates.send_replace(tracker.state.clone());
        outcome
    }

    /// Starts the scheduled check loop.
    ///
    /// The first check runs after the configured initial delay and then
    /// once per interval. The loop stops when the handle is shut down or
    /// dropped.
    #[must_use]
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let monitor = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + monitor.config.initial_delay();
            let mut ticker = tokio::time::interval_at(start, monitor.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_secs = monitor.config.interval().as_secs(),
                failure_threshold = monitor.config.failure_threshold,
                "Health monitor started"
            );

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let outcome = monitor.check_now().await;
                        debug!(?outcome, "Scheduled health check finished");
                    }
                }
            }
            debug!("Health monitor stopped");
        });

        MonitorHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn recover_expired(&self, state: &mut HealthState, generation: u64) -> CheckOutcome {
        debug!(generation, "Access token expired; refreshing");
        match self.controller.refresh_shared().await {
            Ok(_) => match self.controller.mark_authenticated(generation) {
                Ok(_) => self.record_success(state),
                Err(_) => CheckOutcome::Stale,
            },
            Err(SessionError::Superseded | SessionError::NotAuthenticated) => CheckOutcome::Stale,
            Err(SessionError::RateLimited) => {
                info!(generation, "Token refresh rate limited; will retry on schedule");
                CheckOutcome::RateLimited
            }
            Err(SessionError::Unreachable { reason }) => {
                self.record_failure(state, generation, &reason)
            }
            Err(e) => {
                warn!(generation, error = %e, "Expired session could not be refreshed");
                self.end_session(state, generation, LogoutReason::RefreshRejected)
            }
        }
    }

    /// Drops failure tracking once no session is live. A forced logout
    /// stays visible as `Unauthenticated`.
    fn forget_session(&self, tracker: &mut Tracker) {
        tracker.generation = None;
        let next = match tracker.state.status {
            HealthStatus::Unauthenticated => HealthState {
                consecutive_failures: 0,
                suspect: false,
                ..tracker.state.clone()
            },
            _ => HealthState::default(),
        };
        if next != tracker.state {
            debug!("No live session; health tracking reset");
            tracker.state = next;
            self.updates.send_replace(tracker.state.clone());
        }
    }

    fn record_success(&self, state: &mut HealthState) -> CheckOutcome {
        if state.suspect {
            info!(
                failures = state.consecutive_failures,
                "Identity backend reachable again"
            );
        }
        state.status = HealthStatus::Healthy;
        state.consecutive_failures = 0;
        state.suspect = false;
        state.last_success = Some(self.clock.now());
        CheckOutcome::Healthy
    }

    fn record_failure(&self, state: &mut HealthState, generation: u64, reason: &str) -> CheckOutcome {
        if !self.controller.is_current(generation) {
            return CheckOutcome::Stale;
        }

        state.consecutive_failures += 1;
        state.suspect = true;
        state.status = HealthStatus::Suspect;
        warn!(
            generation,
            failures = state.consecutive_failures,
            threshold = self.config.failure_threshold,
            reason,
            "Health check failed"
        );

        if state.consecutive_failures >= self.config.failure_threshold {
            return self.end_session(state, generation, LogoutReason::RetryBudgetExhausted);
        }
        if let Err(e) = self.controller.mark_suspect(generation) {
            debug!(error = %e, "Session changed before it could be marked suspect");
            return CheckOutcome::Stale;
        }
        CheckOutcome::Failed {
            consecutive_failures: state.consecutive_failures,
        }
    }

    fn end_session(
        &self,
        state: &mut HealthState,
        generation: u64,
        reason: LogoutReason,
    ) -> CheckOutcome {
        match self.controller.force_logout_for(generation, reason) {
            Ok(_) => {
                state.status = HealthStatus::Unauthenticated;
                state.suspect = false;
                state.logout_reason = Some(reason);
                CheckOutcome::LoggedOut(reason)
            }
            Err(_) => CheckOutcome::Stale,
        }
    }
}

/// Handle to a running monitor loop. Dropping it stops the loop.
pub struct MonitorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Health monitor task failed");
                }
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::SessionConfig;
    use crate::error::IdentityError;
    use crate::identity::Credentials;
    use crate::session::{SessionStatus, TokenPair};
    use crate::storage::MemoryStore;
    use crate::store::SessionStore;
    use crate::testing::ScriptedIdentity;
    use gatekeeper_access::{Principal, Role};
    use std::time::Duration;

    struct Harness {
        monitor: Arc<HealthMonitor>,
        controller: Arc<SessionController>,
        identity: Arc<ScriptedIdentity>,
    }

    fn network_down() -> IdentityError {
        IdentityError::Network {
            reason: "connection refused".to_string(),
        }
    }

    fn unauthorized(message: &str) -> IdentityError {
        IdentityError::Status {
            code: 401,
            error: Some("unauthorized".to_string()),
            message: Some(message.to_string()),
        }
    }

    async fn logged_in() -> Harness {
        let identity = Arc::new(ScriptedIdentity::new().with_account(
            "carol@example.com",
            "password",
            Principal::builder("u-carol", Role::PlatformUser).build(),
        ));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(SessionStore::open(
            Arc::new(MemoryStore::new()),
            clock.clone(),
        ));
        let controller = Arc::new(SessionController::new(
            store,
            identity.clone(),
            SessionConfig::default(),
        ));
        controller
            .login(Credentials::new("carol@example.com", "password"))
            .await
            .expect("login");
        let monitor = Arc::new(HealthMonitor::new(
            controller.clone(),
            HealthConfig::default(),
            clock,
        ));
        Harness {
            monitor,
            controller,
            identity,
        }
    }

    #[tokio::test]
    async fn two_failures_then_success_resets() {
        let h = logged_in().await;
        h.identity.fail_validate(network_down(), 2);

        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::Failed {
                consecutive_failures: 1
            }
        );
        assert_eq!(h.controller.snapshot().status(), SessionStatus::Suspect);
        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::Failed {
                consecutive_failures: 2
            }
        );
        assert!(h.monitor.state().suspect);

        assert_eq!(h.monitor.check_now().await, CheckOutcome::Healthy);
        let state = h.monitor.state();
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.suspect);
        assert_eq!(state.status, HealthStatus::Healthy);
        assert!(state.last_success.is_some());
        assert_eq!(h.controller.snapshot().status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn check_keeps_switched_primary_role() {
        let identity = Arc::new(ScriptedIdentity::new().with_account(
            "dana@example.com",
            "password",
            Principal::builder("u-dana", Role::TenantAdmin)
                .role(Role::MarketplaceDeveloper)
                .tenant("t-1")
                .build(),
        ));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(SessionStore::open(
            Arc::new(MemoryStore::new()),
            clock.clone(),
        ));
        let controller = Arc::new(SessionController::new(
            store,
            identity.clone(),
            SessionConfig::default(),
        ));
        controller
            .login(Credentials::new("dana@example.com", "password"))
            .await
            .expect("login");
        let monitor = HealthMonitor::new(controller.clone(), HealthConfig::default(), clock);

        controller
            .switch_role(Role::MarketplaceDeveloper)
            .expect("switch");
        assert_eq!(monitor.check_now().await, CheckOutcome::Healthy);
        assert_eq!(identity.validate_calls(), 1);

        let session = controller.snapshot();
        let principal = session.principal().expect("principal");
        assert_eq!(principal.primary_role(), &Role::MarketplaceDeveloper);
        assert!(principal.holds_role(&Role::TenantAdmin));
        assert_eq!(session.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn three_failures_end_the_session() {
        let h = logged_in().await;
        h.identity.fail_validate(network_down(), 3);

        h.monitor.check_now().await;
        h.monitor.check_now().await;
        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::LoggedOut(LogoutReason::RetryBudgetExhausted)
        );

        let session = h.controller.snapshot();
        assert_eq!(session.status(), SessionStatus::Unauthenticated);
        assert_eq!(session.access_token(), None);
        assert_eq!(
            session.logout_reason(),
            Some(LogoutReason::RetryBudgetExhausted)
        );
        assert_eq!(h.monitor.state().status, HealthStatus::Unauthenticated);
        assert_eq!(h.monitor.check_now().await, CheckOutcome::NoSession);
        let state = h.monitor.state();
        assert_eq!(state.status, HealthStatus::Unauthenticated);
        assert_eq!(state.logout_reason, Some(LogoutReason::RetryBudgetExhausted));
    }

    #[tokio::test]
    async fn rate_limiting_is_absorbed() {
        let h = logged_in().await;
        let throttled = IdentityError::Status {
            code: 429,
            error: None,
            message: None,
        };
        h.identity.fail_validate(network_down(), 1);
        h.identity.fail_validate(throttled, 5);
        h.identity.fail_validate(network_down(), 1);

        h.monitor.check_now().await;
        for _ in 0..5 {
            assert_eq!(h.monitor.check_now().await, CheckOutcome::RateLimited);
        }
        assert_eq!(h.monitor.state().consecutive_failures, 1);
        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::Failed {
                consecutive_failures: 2
            }
        );
        assert!(h.controller.snapshot().is_live());
    }

    #[tokio::test]
    async fn invalid_token_ends_session_immediately() {
        let h = logged_in().await;
        h.identity.push_validate(Err(unauthorized("Invalid token")));

        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::LoggedOut(LogoutReason::SessionInvalid)
        );
        assert_eq!(
            h.controller.snapshot().status(),
            SessionStatus::Unauthenticated
        );
    }

    #[tokio::test]
    async fn expired_token_is_refreshed() {
        let h = logged_in().await;
        let before = h.controller.snapshot();
        h.identity.push_validate(Err(unauthorized("Token has expired")));

        assert_eq!(h.monitor.check_now().await, CheckOutcome::Healthy);
        assert_eq!(h.identity.refresh_calls(), 1);
        let after = h.controller.snapshot();
        assert_ne!(after.access_token(), before.access_token());
        assert_eq!(after.status(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn expired_with_unreachable_refresh_counts_against_budget() {
        let h = logged_in().await;
        for _ in 0..3 {
            h.identity.push_validate(Err(unauthorized("Token has expired")));
            h.identity.push_refresh(Err(network_down()));
        }

        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::Failed {
                consecutive_failures: 1
            }
        );
        h.monitor.check_now().await;
        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::LoggedOut(LogoutReason::RetryBudgetExhausted)
        );
    }

    #[tokio::test]
    async fn expired_with_rejected_refresh_ends_session() {
        let h = logged_in().await;
        h.identity.push_validate(Err(unauthorized("Token has expired")));
        h.identity
            .push_refresh(Err(unauthorized("Invalid refresh token")));

        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::LoggedOut(LogoutReason::RefreshRejected)
        );
        assert!(!h.controller.snapshot().is_live());
    }

    #[tokio::test]
    async fn expired_without_refresh_token_ends_session() {
        let h = logged_in().await;
        let principal = h
            .controller
            .snapshot()
            .principal()
            .cloned()
            .expect("principal");
        h.controller
            .store()
            .login(
                TokenPair {
                    access_token: "bare".to_string(),
                    refresh_token: None,
                    expires_in: None,
                },
                principal,
            )
            .expect("login");
        h.identity.push_validate(Err(unauthorized("Token has expired")));

        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::LoggedOut(LogoutReason::RefreshRejected)
        );
        assert_eq!(h.identity.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn new_session_starts_with_clean_counters() {
        let h = logged_in().await;
        h.identity.fail_validate(network_down(), 2);
        h.monitor.check_now().await;
        h.monitor.check_now().await;

        h.controller
            .login(Credentials::new("carol@example.com", "password"))
            .await
            .expect("login again");
        h.identity.fail_validate(network_down(), 1);

        assert_eq!(
            h.monitor.check_now().await,
            CheckOutcome::Failed {
                consecutive_failures: 1
            }
        );
    }

    #[tokio::test]
    async fn logout_while_suspect_clears_published_state() {
        let h = logged_in().await;
        h.identity.fail_validate(network_down(), 2);
        h.monitor.check_now().await;
        h.monitor.check_now().await;
        assert_eq!(h.monitor.state().status, HealthStatus::Suspect);

        let mut rx = h.monitor.subscribe();
        h.controller.logout().await;
        assert_eq!(h.monitor.check_now().await, CheckOutcome::NoSession);

        assert!(rx.has_changed().expect("sender alive"));
        let state = rx.borrow_and_update().clone();
        assert_eq!(state, HealthState::default());
        assert!(!state.suspect);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn subscribers_see_suspect_state() {
        let h = logged_in().await;
        let mut rx = h.monitor.subscribe();
        h.identity.fail_validate(network_down(), 1);

        h.monitor.check_now().await;
        assert!(rx.has_changed().expect("sender alive"));
        let state = rx.borrow_and_update().clone();
        assert_eq!(state.status, HealthStatus::Suspect);
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_checks_exhaust_budget() {
        let h = logged_in().await;
        h.identity.fail_validate(network_down(), 3);
        let handle = h.monitor.spawn();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.identity.validate_calls(), 0);

        // Checks at 2s, 32s and 62s.
        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(h.identity.validate_calls(), 3);
        assert_eq!(
            h.controller.snapshot().status(),
            SessionStatus::Unauthenticated
        );

        handle.shutdown().await;
    }
}

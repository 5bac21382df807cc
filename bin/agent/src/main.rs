//! gatekeeper agent.
//!
//! Rehydrates the persisted session (or logs in with configured
//! credentials), keeps the access token fresh, runs the health monitor and
//! logs every session and health transition until Ctrl-C.

mod config;

use crate::config::AgentConfig;
use gatekeeper_access::{FeaturePermissionMatrix, PermissionResolver};
use gatekeeper_session::{
    AccessGuard, Clock, Credentials, FileStore, HealthMonitor, HealthStatus,
    HttpIdentityClient, SessionController, SessionStore, SystemClock,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env().expect("failed to load configuration");
    tracing::info!(base_url = %config.identity.base_url, "Loaded configuration");

    let matrix_json = std::fs::read_to_string(&config.matrix_path)
        .expect("failed to read permission matrix");
    let matrix =
        FeaturePermissionMatrix::from_json(&matrix_json).expect("invalid permission matrix");
    tracing::info!(features = matrix.len(), "Loaded permission matrix");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(SessionStore::open(
        Arc::new(FileStore::new(config.storage_path.clone())),
        clock.clone(),
    ));
    let identity =
        HttpIdentityClient::new(config.identity).expect("failed to build identity client");
    let controller = Arc::new(SessionController::new(
        store.clone(),
        Arc::new(identity),
        config.session,
    ));
    let guard = AccessGuard::new(store.clone(), PermissionResolver::new(matrix));

    if !store.snapshot().is_live() {
        if let Some(login) = config.login {
            match controller
                .login(Credentials::new(login.email, login.password))
                .await
            {
                Ok(session) => {
                    tracing::info!(generation = session.generation(), "Logged in");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Login failed; waiting for a session");
                }
            }
        }
    }

    if let Some(class) = guard.role_class() {
        let features = guard
            .accessible_features()
            .into_iter()
            .map(|(feature, level)| format!("{feature}={level}"))
            .collect::<Vec<_>>();
        tracing::info!(role_class = ?class, features = %features.join(","), "Accessible features");
    }

    // Log session transitions
    let mut sessions = store.subscribe();
    tokio::spawn(async move {
        let mut last = sessions.borrow_and_update().status();
        while sessions.changed().await.is_ok() {
            let session = sessions.borrow_and_update().clone();
            if session.status() == last {
                continue;
            }
            tracing::info!(
                from = %last,
                to = %session.status(),
                generation = session.generation(),
                "Session status changed"
            );
            if let Some(reason) = session.logout_reason() {
                tracing::warn!(reason = reason.message(), "Session ended");
            }
            last = session.status();
        }
    });

    // Refresh ahead of expiry
    let refresher = controller.clone();
    let refresh_interval = config.health.interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(refresh_interval);
        loop {
            interval.tick().await;
            match refresher.refresh_if_needed().await {
                Ok(Some(_)) => tracing::debug!("Refreshed access token ahead of expiry"),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Proactive token refresh failed"),
            }
        }
    });

    let monitor = Arc::new(HealthMonitor::new(controller.clone(), config.health, clock));
    let mut health = monitor.subscribe();
    tokio::spawn(async move {
        let mut last = health.borrow_and_update().status;
        while health.changed().await.is_ok() {
            let state = health.borrow_and_update().clone();
            if state.status == last {
                continue;
            }
            match state.status {
                HealthStatus::Suspect => tracing::warn!(
                    failures = state.consecutive_failures,
                    "Identity backend unreachable; keeping session while it recovers"
                ),
                HealthStatus::Healthy => tracing::info!("Identity backend healthy"),
                HealthStatus::Unauthenticated => {
                    tracing::warn!("Health monitor ended the session; log in again");
                }
            }
            last = state.status;
        }
    });
    let handle = monitor.spawn();

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl-c");
    tracing::info!("Shutting down");
    handle.shutdown().await;
}

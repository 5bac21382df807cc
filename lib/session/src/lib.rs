//! Session lifecycle and access guarding for gatekeeper.
//!
//! The pieces, from the bottom up:
//! - [`KeyValueStore`]: persistence port, with memory and file adapters
//! - [`SessionStore`]: single owner of the session value
//! - [`IdentityProvider`]: port to the identity backend, with
//!   [`HttpIdentityClient`] as the production adapter
//! - [`TokenValidator`]: classifies access tokens
//! - [`SessionController`]: login, logout, role switch, single-flight refresh
//! - [`HealthMonitor`]: bounded-retry session health checks
//! - [`AccessGuard`]: allow, redirect or deny for routes and components
//!
//! Network results are tagged with the session generation they were issued
//! for. A result for an older generation is dropped, so a logout always
//! wins over a refresh or validation still in flight.

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod guard;
pub mod health;
pub mod http;
pub mod identity;
pub mod session;
pub mod storage;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod validator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EndpointPaths, HealthConfig, IdentityConfig, SessionConfig};
pub use controller::{MIN_PASSWORD_LEN, Probe, SessionController};
pub use error::{IdentityError, SessionError, StorageError};
pub use guard::{AccessGuard, Decision, Requirement, evaluate};
pub use health::{CheckOutcome, HealthMonitor, HealthState, HealthStatus, MonitorHandle};
pub use http::HttpIdentityClient;
pub use identity::{Credentials, IdentityProvider, LoginGrant, Registration};
pub use session::{LogoutReason, Session, SessionStatus, TokenPair};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use store::SessionStore;
pub use validator::{TokenStatus, TokenValidator};

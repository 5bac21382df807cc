//! Role classification and feature permission resolution for gatekeeper.
//!
//! This crate is pure and synchronous. It provides:
//! - Roles and their coarse classes (`Role`, `RoleClass`, `classify`)
//! - The authenticated identity snapshot (`Principal`)
//! - Feature access levels and their resolution (`AccessLevel`, `Feature`,
//!   `FeaturePermissionMatrix`, `PermissionResolver`)
//!
//! # Example
//!
//! ```
//! use gatekeeper_access::{
//!     AccessLevel, Feature, FeaturePermissionMatrix, PermissionResolver, Principal, Role,
//! };
//!
//! let matrix = FeaturePermissionMatrix::new()
//!     .with_entry(Feature::Users, Role::TenantAdmin, AccessLevel::Full)
//!     .with_entry(Feature::Analytics, Role::TenantUser, AccessLevel::None);
//! let resolver = PermissionResolver::new(matrix);
//!
//! let principal = Principal::builder("u-1", Role::TenantUser)
//!     .tenant("acme")
//!     .grant("analytics:limited")
//!     .build();
//!
//! assert_eq!(resolver.resolve_access(&principal, Feature::Analytics), AccessLevel::Limited);
//! assert!(!resolver.can_access(&principal, Feature::Users));
//! ```

pub mod error;
pub mod permission;
pub mod principal;
pub mod role;

pub use error::{AuthorizationError, MatrixError, ParseFeatureError};
pub use permission::{AccessLevel, CustomGrant, Feature, FeaturePermissionMatrix, PermissionResolver};
pub use principal::{Principal, PrincipalBuilder};
pub use role::{Role, RoleClass, classify};

//! Core types shared by the gatekeeper crates.
//!
//! This crate provides the `Result` alias used across the workspace and the
//! opaque identifiers that the identity backend hands us for principals and
//! tenants.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{ParseIdError, PrincipalId, TenantId};

//! Core domain types for Loupe.
//!
//! This crate contains pure domain types with no IO and no async:
//!
//! - **`settings`**: user-facing language-server overrides, validated at the
//!   deserialization boundary
//! - **`env`**: the denylist of secret-bearing environment variables that
//!   must never leak into spawned child processes

pub mod env;
pub mod settings;

pub use env::{ENV_SECRET_DENYLIST, is_secret_env};
pub use settings::{LspSettings, ServerOverride, ServerOverrideError};

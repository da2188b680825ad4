//! Configuration
//!
//! Shared types, supervisor tunables and launch-time validation.

pub mod settings;
pub mod types;
pub mod validator;

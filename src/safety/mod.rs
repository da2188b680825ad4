//! Safety and cleanup
//!
//! Exactly-once release of resource groups and the live-handle registry
//! that guarantees it on host shutdown.

pub mod cleanup;
pub mod registry;

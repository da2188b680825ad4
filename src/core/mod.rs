//! Supervision core.
//!
//! Launcher, CPU accountant and termination watcher, all operating on one
//! shared handle state. Outcome classification lives in [`crate::verdict`],
//! teardown in [`crate::safety`].

pub mod accountant;
pub mod completion;
pub mod handle;
pub mod launcher;
pub mod token;

//! Kernel primitives
//!
//! Resource-group governance and signal plumbing used by the supervision core.

pub mod cgroup;
pub mod signal;

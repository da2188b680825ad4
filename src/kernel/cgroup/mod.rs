//! Cgroup resource governance
//!
//! The supervision core consumes cgroups through [`IsolationBackend`]; the
//! v2 backend is the production implementation.

pub mod backend;
pub mod v2;

pub use backend::{Capability, IsolationBackend};
pub use v2::CgroupV2Backend;

/// Peak memory usage (kernel 5.19+)
pub const MEMORY_PEAK: &str = "memory.peak";
/// Instantaneous memory usage
pub const MEMORY_CURRENT: &str = "memory.current";
/// Flat-keyed CPU statistics
pub const CPU_STAT: &str = "cpu.stat";
/// Cumulative CPU usage key inside `cpu.stat`, in microseconds
pub const CPU_USAGE_USEC: &str = "usage_usec";

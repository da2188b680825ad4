/// Outcome resolution
/// Pure, deterministic mapping from supervision flags and final readings
/// to one terminal status. First matching rule wins.
use crate::config::types::{SandboxStatus, TerminationCause};

/// Everything the resolver looks at, captured once at termination
#[derive(Debug, Clone, PartialEq)]
pub struct ResolverInput {
    /// Soft time-limit trip fired during the run
    pub timed_out: bool,
    /// Caller requested a stop
    pub cancelled: bool,
    /// Authoritative CPU time (nanoseconds)
    pub cpu_time_ns: u64,
    /// Memory usage in bytes; `None` when not measurable
    pub memory_bytes: Option<u64>,
    pub termination: TerminationCause,
    pub time_limit_ns: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
}

pub struct OutcomeResolver;

impl OutcomeResolver {
    /// Classify the run. A CPU breach outranks cancellation and memory.
    pub fn resolve(input: &ResolverInput) -> SandboxStatus {
        if input.timed_out || Self::exceeds(Some(input.cpu_time_ns), input.time_limit_ns) {
            return SandboxStatus::TimeLimitExceeded;
        }

        if input.cancelled {
            return SandboxStatus::Cancelled;
        }

        if Self::exceeds(input.memory_bytes, input.memory_limit_bytes) {
            return SandboxStatus::MemoryLimitExceeded;
        }

        match input.termination {
            TerminationCause::Signaled(_) => SandboxStatus::RuntimeError,
            TerminationCause::Exited(_) => SandboxStatus::Ok,
            TerminationCause::Unrecognized => {
                log::error!(
                    "Outcome resolver exhausted its rules (defect upstream): {:?}",
                    input
                );
                SandboxStatus::Unknown
            }
        }
    }

    fn exceeds(value: Option<u64>, limit: Option<u64>) -> bool {
        matches!((value, limit), (Some(value), Some(limit)) if value > limit)
    }
}

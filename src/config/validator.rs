// Launch-time parameter validation
// Invalid parameters fail fast before the backend is touched

use crate::config::types::{Result, SandboxError, SandboxParameter};
use std::path::{Component, Path};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a parameter before launch.
/// Returns the warnings on success; errors are fatal.
pub fn validate_parameter(parameter: &SandboxParameter) -> Result<ValidationResult> {
    let mut result = ValidationResult::default();

    validate_group_path(&parameter.cgroup, &mut result);
    validate_limits(parameter, &mut result);

    if parameter.executable.as_os_str().is_empty() {
        result.add_error("executable cannot be empty".to_string());
    }

    for warning in &result.warnings {
        log::warn!("Parameter warning: {}", warning);
    }

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "Parameter validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

/// Group paths are joined under the cgroup root, so they must stay beneath it.
fn validate_group_path(group: &Path, result: &mut ValidationResult) {
    if group.as_os_str().is_empty() {
        result.add_error("cgroup base path cannot be empty".to_string());
        return;
    }

    for component in group.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                result.add_error(format!(
                    "cgroup base path must not contain '..': {}",
                    group.display()
                ));
                return;
            }
            Component::RootDir | Component::Prefix(_) => {
                result.add_error(format!(
                    "cgroup base path must be relative to the cgroup root: {}",
                    group.display()
                ));
                return;
            }
        }
    }
}

fn validate_limits(parameter: &SandboxParameter, result: &mut ValidationResult) {
    if parameter.time_limit_ns == Some(0) {
        result.add_error("time limit cannot be zero".to_string());
    }

    if let Some(memory_limit) = parameter.memory_limit_bytes {
        if memory_limit == 0 {
            result.add_error("memory limit cannot be zero".to_string());
        } else if memory_limit < 1024 * 1024 {
            result.add_warning(format!(
                "memory limit {} is very low (< 1MB), may cause OOM",
                memory_limit
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_parameter() {
        let parameter = SandboxParameter::new("judge/pool", "/bin/true");
        assert!(validate_parameter(&parameter).is_ok());
    }

    #[test]
    fn test_rejects_escaping_group() {
        let parameter = SandboxParameter::new("../escape", "/bin/true");
        assert!(matches!(
            validate_parameter(&parameter),
            Err(SandboxError::Config(_))
        ));

        let parameter = SandboxParameter::new("/sys/fs/cgroup/judge", "/bin/true");
        assert!(validate_parameter(&parameter).is_err());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut parameter = SandboxParameter::new("judge", "/bin/true");
        parameter.time_limit_ns = Some(0);
        parameter.memory_limit_bytes = Some(0);
        let err = validate_parameter(&parameter).unwrap_err().to_string();
        assert!(err.contains("time limit"));
        assert!(err.contains("memory limit"));
    }

    #[test]
    fn test_low_memory_limit_is_warning() {
        let parameter = SandboxParameter::new("judge", "/bin/true").with_memory_limit(4096);
        let result = validate_parameter(&parameter).unwrap();
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_rejects_empty_executable() {
        let parameter = SandboxParameter::new("judge", "");
        assert!(validate_parameter(&parameter).is_err());
    }
}

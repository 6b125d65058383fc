//! Execution job definition
//!
//! An [`ExecutionJob`] is created per snippet run and destroyed after
//! completion or forced termination. It carries everything the executor
//! needs: the snippet source, parameter bindings, the wall-clock budget,
//! and the import allow-list in force for this run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Default wall-clock budget for a snippet run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on captured output
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Modules a snippet may import unless the job narrows the list
pub const DEFAULT_ALLOWED_IMPORTS: &[&str] = &[
    "math",
    "statistics",
    "json",
    "datetime",
    "re",
    "collections",
    "itertools",
    "functools",
];

/// A bounded, restricted-capability snippet execution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionJob {
    /// Unique job id, used for event correlation
    pub id: Uuid,
    /// Snippet source text
    pub source: String,
    /// Named values injected into the snippet as `params`
    pub bindings: HashMap<String, serde_json::Value>,
    /// Hard wall-clock budget
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    /// Module roots the snippet may import
    pub allowed_imports: Vec<String>,
    /// Cap on captured stdout/stderr bytes
    pub max_output_bytes: usize,
}

impl ExecutionJob {
    /// Create a job with default budget, allow-list, and output cap
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            bindings: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            allowed_imports: DEFAULT_ALLOWED_IMPORTS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Bind a named value, available to the snippet as `params["name"]`
    #[must_use]
    pub fn with_binding(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.bindings.insert(name.into(), value);
        self
    }

    /// Set the wall-clock budget
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the import allow-list
    #[must_use]
    pub fn with_allowed_imports(mut self, imports: Vec<String>) -> Self {
        self.allowed_imports = imports;
        self
    }

    /// Add one module root to the allow-list
    #[must_use]
    pub fn allow_import(mut self, module: impl Into<String>) -> Self {
        self.allowed_imports.push(module.into());
        self
    }

    /// Set the output cap
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_defaults() {
        let job = ExecutionJob::new("result = 1");
        assert_eq!(job.timeout, DEFAULT_TIMEOUT);
        assert_eq!(job.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert!(job.allowed_imports.contains(&"math".to_string()));
        assert!(job.bindings.is_empty());
    }

    #[test]
    fn test_job_builder() {
        let job = ExecutionJob::new("result = params['n'] * 2")
            .with_binding("n", serde_json::json!(21))
            .with_timeout(Duration::from_secs(5))
            .allow_import("statistics")
            .with_max_output_bytes(1024);

        assert_eq!(job.bindings.get("n"), Some(&serde_json::json!(21)));
        assert_eq!(job.timeout, Duration::from_secs(5));
        assert_eq!(job.max_output_bytes, 1024);
    }

    #[test]
    fn test_job_serialization_round_trip() {
        let job = ExecutionJob::new("result = 0").with_timeout(Duration::from_millis(1500));
        let json = serde_json::to_string(&job).unwrap();
        let back: ExecutionJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timeout, Duration::from_millis(1500));
        assert_eq!(back.id, job.id);
    }
}

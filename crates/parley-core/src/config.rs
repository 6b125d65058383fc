//! Configuration surface
//!
//! Every tunable the core recognizes, loadable from TOML with serde
//! defaults so a partial file is always valid. Confidence thresholds,
//! execution budget, arena expiry, and the conflict-retry discipline are
//! all adjustable without a code change.

use crate::arena::ArenaConfig;
use crate::error::{Error, Result};
use crate::interpreter::InterpreterConfig;
use crate::router::RouterConfig;
use crate::workflow::WorkflowConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Intent router settings
    #[serde(default)]
    pub router: RouterSettings,
    /// Choice interpreter settings
    #[serde(default)]
    pub interpreter: InterpreterSettings,
    /// Snippet execution settings
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Arena comparison settings
    #[serde(default)]
    pub arena: ArenaSettings,
    /// Optimistic-concurrency and history settings
    #[serde(default)]
    pub state: StateSettings,
    /// Shared store settings
    #[serde(default)]
    pub store: StoreSettings,
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file is unreadable or invalid.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a configuration error on invalid TOML.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Router config for [`crate::router::IntentRouter`]
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            confidence_threshold: self.router.confidence_threshold,
            keyword_weight: self.router.keyword_weight,
            entity_weight: self.router.entity_weight,
            stage_bonus: self.router.stage_bonus,
            reasoner_weight: self.router.reasoner_weight,
            reasoner_timeout: Duration::from_millis(self.router.reasoner_timeout_ms),
            max_input_length: self.router.max_input_length,
        }
    }

    /// Interpreter config for [`crate::interpreter::ChoiceInterpreter`]
    #[must_use]
    pub fn interpreter_config(&self) -> InterpreterConfig {
        InterpreterConfig {
            confidence_threshold: self.interpreter.confidence_threshold,
        }
    }

    /// Workflow config for [`crate::workflow::WorkflowMachine`]
    #[must_use]
    pub fn workflow_config(&self) -> WorkflowConfig {
        WorkflowConfig {
            conflict_retries: self.state.conflict_retries,
            conflict_backoff: Duration::from_millis(self.state.conflict_backoff_ms),
        }
    }

    /// Arena config for [`crate::arena::ArenaCoordinator`]
    #[must_use]
    pub fn arena_config(&self) -> ArenaConfig {
        ArenaConfig {
            expiry: Duration::from_secs(self.arena.expiry_secs),
        }
    }

    /// Sandbox config for [`parley_sandbox::SandboxExecutor`]
    #[must_use]
    pub fn sandbox_config(&self) -> parley_sandbox::SandboxConfig {
        parley_sandbox::SandboxConfig::default()
            .with_interpreter(self.execution.interpreter.clone())
            .with_default_timeout(Duration::from_secs(self.execution.timeout_secs))
    }

    /// Snippet execution budget
    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.timeout_secs)
    }
}

/// Intent router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterSettings {
    /// Minimum confidence for an actionable classification
    #[serde(default = "default_router_threshold")]
    pub confidence_threshold: f32,
    /// Weight for trigger-keyword overlap
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f32,
    /// Weight for parameter-entity presence
    #[serde(default = "default_entity_weight")]
    pub entity_weight: f32,
    /// Bonus for stage-relevant actions
    #[serde(default = "default_stage_bonus")]
    pub stage_bonus: f32,
    /// Blend factor for reasoner re-ranking
    #[serde(default = "default_reasoner_weight")]
    pub reasoner_weight: f32,
    /// Budget for one reasoner call in milliseconds
    #[serde(default = "default_reasoner_timeout_ms")]
    pub reasoner_timeout_ms: u64,
    /// Maximum accepted input length
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_router_threshold(),
            keyword_weight: default_keyword_weight(),
            entity_weight: default_entity_weight(),
            stage_bonus: default_stage_bonus(),
            reasoner_weight: default_reasoner_weight(),
            reasoner_timeout_ms: default_reasoner_timeout_ms(),
            max_input_length: default_max_input_length(),
        }
    }
}

fn default_router_threshold() -> f32 {
    0.4
}
fn default_keyword_weight() -> f32 {
    0.5
}
fn default_entity_weight() -> f32 {
    0.3
}
fn default_stage_bonus() -> f32 {
    0.45
}
fn default_reasoner_weight() -> f32 {
    0.5
}
fn default_reasoner_timeout_ms() -> u64 {
    2_000
}
fn default_max_input_length() -> usize {
    10_000
}

/// Choice interpreter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterSettings {
    /// Minimum confidence for argument resolution
    #[serde(default = "default_interpreter_threshold")]
    pub confidence_threshold: f32,
}

impl Default for InterpreterSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: default_interpreter_threshold(),
        }
    }
}

fn default_interpreter_threshold() -> f32 {
    0.65
}

/// Snippet execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Hard wall-clock budget in seconds
    #[serde(default = "default_execution_timeout_secs")]
    pub timeout_secs: u64,
    /// Cap on captured output
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Interpreter argv; the snippet program is fed on stdin
    #[serde(default = "default_interpreter_argv")]
    pub interpreter: Vec<String>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_execution_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            interpreter: default_interpreter_argv(),
        }
    }
}

fn default_execution_timeout_secs() -> u64 {
    30
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}
fn default_interpreter_argv() -> Vec<String> {
    vec!["python3".to_string(), "-I".to_string(), "-".to_string()]
}

/// Arena settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaSettings {
    /// How long an unvoted battle stays eligible, in seconds
    #[serde(default = "default_arena_expiry_secs")]
    pub expiry_secs: u64,
}

impl Default for ArenaSettings {
    fn default() -> Self {
        Self {
            expiry_secs: default_arena_expiry_secs(),
        }
    }
}

fn default_arena_expiry_secs() -> u64 {
    900
}

/// Optimistic-concurrency and history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSettings {
    /// Conflict retries before surfacing a transient failure
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    /// Linear backoff between retries, in milliseconds
    #[serde(default = "default_conflict_backoff_ms")]
    pub conflict_backoff_ms: u64,
    /// Retained history entries before folding into the summary
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            conflict_backoff_ms: default_conflict_backoff_ms(),
            max_history: default_max_history(),
        }
    }
}

fn default_conflict_retries() -> u32 {
    4
}
fn default_conflict_backoff_ms() -> u64 {
    25
}
fn default_max_history() -> usize {
    40
}

/// Shared store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map, development/testing only
    Memory,
    /// Redis, the production backend
    Redis,
}

/// Shared store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Which backend to use
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Key prefix isolating this deployment's records
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
    /// Record TTL in seconds
    #[serde(default = "default_store_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            prefix: default_store_prefix(),
            ttl_secs: default_store_ttl_secs(),
        }
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Memory
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_store_prefix() -> String {
    "parley:".to_string()
}
fn default_store_ttl_secs() -> u64 {
    24 * 3600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.router.confidence_threshold, 0.4);
        assert_eq!(config.interpreter.confidence_threshold, 0.65);
        assert_eq!(config.execution.timeout_secs, 30);
        assert_eq!(config.arena.expiry_secs, 900);
        assert_eq!(config.state.conflict_retries, 4);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = CoreConfig::from_toml_str(
            r#"
            [interpreter]
            confidence_threshold = 0.8

            [store]
            backend = "redis"
            redis_url = "redis://cache.internal:6379"
            "#,
        )
        .unwrap();

        assert_eq!(config.interpreter.confidence_threshold, 0.8);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.redis_url, "redis://cache.internal:6379");
        // Untouched sections keep their defaults
        assert_eq!(config.router.confidence_threshold, 0.4);
        assert_eq!(config.arena.expiry_secs, 900);
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let result = CoreConfig::from_toml_str("not toml at all [[[");
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_component_config_mapping() {
        let mut config = CoreConfig::default();
        config.state.conflict_retries = 7;
        config.state.conflict_backoff_ms = 100;
        config.arena.expiry_secs = 60;

        let workflow = config.workflow_config();
        assert_eq!(workflow.conflict_retries, 7);
        assert_eq!(workflow.conflict_backoff, Duration::from_millis(100));

        let arena = config.arena_config();
        assert_eq!(arena.expiry, Duration::from_secs(60));
    }

    #[test]
    fn test_round_trip() {
        let config = CoreConfig::default();
        let toml_text = toml::to_string(&config).unwrap();
        let back = CoreConfig::from_toml_str(&toml_text).unwrap();
        assert_eq!(back.execution.timeout_secs, config.execution.timeout_secs);
    }
}

//! Action catalog
//!
//! The catalog holds every action the assistant can dispatch: its
//! parameter schema, the workflow stages it is reachable from, and the
//! handler that executes it. Parameter schemas are a closed set of typed
//! variants so argument resolution is exhaustively checkable.

use crate::conversation::Conversation;
use crate::error::Result;
use crate::interpreter::ResolvedArguments;
use crate::workflow::WorkflowStage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Typed parameter schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamSchema {
    /// Enumerated options with optional paraphrase aliases
    Choice {
        /// Valid values, in presentation order
        options: Vec<String>,
        /// Paraphrase → option mapping (e.g. "first-level" → "primary")
        #[serde(default)]
        aliases: HashMap<String, String>,
    },
    /// Quantity-style parameter accepting numeric coercion
    Number {
        /// Inclusive lower bound
        #[serde(default)]
        min: Option<f64>,
        /// Inclusive upper bound
        #[serde(default)]
        max: Option<f64>,
    },
    /// Free text, optionally constrained by a pattern
    Text {
        /// Regex the value must match
        #[serde(default)]
        pattern: Option<String>,
    },
}

/// One parameter of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Parameter name
    pub name: String,
    /// Short description, used in clarifying questions
    pub description: String,
    /// Typed schema
    pub schema: ParamSchema,
    /// Whether resolution must produce a value
    pub required: bool,
}

impl ParamSpec {
    /// Create a required parameter
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, schema: ParamSchema) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema,
            required: true,
        }
    }

    /// Mark the parameter optional
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Shorthand for an enumerated parameter
    #[must_use]
    pub fn choice(
        name: impl Into<String>,
        description: impl Into<String>,
        options: &[&str],
    ) -> Self {
        Self::new(
            name,
            description,
            ParamSchema::Choice {
                options: options.iter().map(|s| (*s).to_string()).collect(),
                aliases: HashMap::new(),
            },
        )
    }

    /// Add a paraphrase alias (only meaningful for `Choice`)
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>, option: impl Into<String>) -> Self {
        if let ParamSchema::Choice { aliases, .. } = &mut self.schema {
            aliases.insert(alias.into().to_lowercase(), option.into());
        }
        self
    }
}

/// Action metadata: routing triggers, gating, and workflow effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Unique action name
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Trigger keywords for lexical routing
    pub keywords: Vec<String>,
    /// Parameters to resolve before dispatch
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Stages this action is reachable from (`None` = any stage)
    #[serde(default)]
    pub allowed_stages: Option<Vec<WorkflowStage>>,
    /// Stage the conversation advances to on success
    #[serde(default)]
    pub advances_to: Option<WorkflowStage>,
    /// Whether dispatch is wrapped in an arena comparison when a
    /// challenger implementation is registered
    #[serde(default)]
    pub comparison: bool,
}

impl ActionSpec {
    /// Create an action with a name and description
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            keywords: Vec::new(),
            params: Vec::new(),
            allowed_stages: None,
            advances_to: None,
            comparison: false,
        }
    }

    /// Add trigger keywords
    #[must_use]
    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords
            .extend(keywords.iter().map(|s| (*s).to_lowercase()));
        self
    }

    /// Add a parameter
    #[must_use]
    pub fn with_param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    /// Restrict the action to specific stages (a hard gate)
    #[must_use]
    pub fn gated_to(mut self, stages: &[WorkflowStage]) -> Self {
        self.allowed_stages = Some(stages.to_vec());
        self
    }

    /// Advance the workflow to `stage` on successful dispatch
    #[must_use]
    pub fn advances_to(mut self, stage: WorkflowStage) -> Self {
        self.advances_to = Some(stage);
        self
    }

    /// Mark the action as comparison-capable
    #[must_use]
    pub fn as_comparison(mut self) -> Self {
        self.comparison = true;
        self
    }

    /// Whether the action is reachable from `stage`
    #[must_use]
    pub fn reachable_from(&self, stage: WorkflowStage) -> bool {
        match &self.allowed_stages {
            None => true,
            Some(stages) => stages.contains(&stage),
        }
    }
}

/// Result of dispatching an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// User-facing response text
    pub message: String,
    /// Opaque handle to a produced analysis result, if any
    #[serde(default)]
    pub result_handle: Option<String>,
    /// Context bag updates to commit with the stage transition
    #[serde(default)]
    pub context_updates: HashMap<String, serde_json::Value>,
    /// Clear the context bag before applying updates (reset/cancel actions)
    #[serde(default)]
    pub clear_context: bool,
}

impl ActionOutcome {
    /// A plain text outcome
    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: text.into(),
            result_handle: None,
            context_updates: HashMap::new(),
            clear_context: false,
        }
    }

    /// Clear collected inputs when this outcome commits
    #[must_use]
    pub fn with_context_cleared(mut self) -> Self {
        self.clear_context = true;
        self
    }

    /// Attach a result handle
    #[must_use]
    pub fn with_result_handle(mut self, handle: impl Into<String>) -> Self {
        self.result_handle = Some(handle.into());
        self
    }

    /// Attach a context update
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

/// Trait for action implementations.
#[async_trait::async_trait]
pub trait ActionHandler: Send + Sync {
    /// Get the action spec
    fn spec(&self) -> &ActionSpec;

    /// Execute with fully-resolved arguments. The conversation is read-only
    /// here; state mutations happen through the returned context updates.
    async fn execute(
        &self,
        args: &ResolvedArguments,
        conversation: &Conversation,
    ) -> Result<ActionOutcome>;
}

/// Registry of actions and their (optional) challenger implementations.
pub struct ActionCatalog {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    challengers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            challengers: HashMap::new(),
        }
    }

    /// Register an action handler
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        let name = handler.spec().name.clone();
        debug!(action = %name, "registering action");
        self.handlers.insert(name, handler);
    }

    /// Register a challenger implementation for an existing action
    pub fn register_challenger(&mut self, action: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.challengers.insert(action.into(), handler);
    }

    /// Get a handler by action name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Get a challenger implementation, if one is registered
    #[must_use]
    pub fn challenger(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.challengers.get(name).cloned()
    }

    /// Get an action spec by name
    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&ActionSpec> {
        self.handlers.get(name).map(|h| h.spec())
    }

    /// Iterate all registered specs
    pub fn specs(&self) -> impl Iterator<Item = &ActionSpec> {
        self.handlers.values().map(|h| h.spec())
    }

    /// Whether an action exists
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered actions
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for ActionCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler {
        spec: ActionSpec,
    }

    #[async_trait::async_trait]
    impl ActionHandler for NoopHandler {
        fn spec(&self) -> &ActionSpec {
            &self.spec
        }

        async fn execute(
            &self,
            _args: &ResolvedArguments,
            _conversation: &Conversation,
        ) -> Result<ActionOutcome> {
            Ok(ActionOutcome::message("ok"))
        }
    }

    #[test]
    fn test_spec_builder() {
        let spec = ActionSpec::new("choose_facility_tier", "Pick a facility tier")
            .with_keywords(&["facility", "tier", "level"])
            .with_param(ParamSpec::choice(
                "tier",
                "facility tier",
                &["primary", "secondary", "tertiary", "all"],
            ))
            .gated_to(&[WorkflowStage::AwaitingFacilityChoice])
            .advances_to(WorkflowStage::AwaitingAgeGroup);

        assert_eq!(spec.keywords.len(), 3);
        assert_eq!(spec.params.len(), 1);
        assert!(spec.reachable_from(WorkflowStage::AwaitingFacilityChoice));
        assert!(!spec.reachable_from(WorkflowStage::Idle));
        assert_eq!(spec.advances_to, Some(WorkflowStage::AwaitingAgeGroup));
    }

    #[test]
    fn test_ungated_action_reachable_everywhere() {
        let spec = ActionSpec::new("help", "Show help");
        assert!(spec.reachable_from(WorkflowStage::Idle));
        assert!(spec.reachable_from(WorkflowStage::Completed));
    }

    #[test]
    fn test_catalog_registration() {
        let mut catalog = ActionCatalog::new();
        assert!(catalog.is_empty());

        catalog.register(Arc::new(NoopHandler {
            spec: ActionSpec::new("help", "Show help"),
        }));

        assert!(catalog.has("help"));
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("help").is_some());
        assert!(catalog.get("missing").is_none());
        assert!(catalog.challenger("help").is_none());
    }

    #[test]
    fn test_challenger_registration() {
        let mut catalog = ActionCatalog::new();
        catalog.register(Arc::new(NoopHandler {
            spec: ActionSpec::new("run_analysis", "Run").as_comparison(),
        }));
        catalog.register_challenger(
            "run_analysis",
            Arc::new(NoopHandler {
                spec: ActionSpec::new("run_analysis", "Run (alt)"),
            }),
        );

        assert!(catalog.challenger("run_analysis").is_some());
    }

    #[test]
    fn test_alias_normalized() {
        let param = ParamSpec::choice("tier", "facility tier", &["primary"])
            .with_alias("First-Level", "primary");
        if let ParamSchema::Choice { aliases, .. } = &param.schema {
            assert_eq!(aliases.get("first-level"), Some(&"primary".to_string()));
        } else {
            panic!("expected choice schema");
        }
    }
}

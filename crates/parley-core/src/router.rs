//! Intent router
//!
//! Classifies an incoming message into a candidate action with extracted
//! entities and a confidence score. Classification is never independent of
//! stage: actions reachable from the conversation's current stage receive
//! an affinity bonus, so the same utterance routes differently mid-workflow
//! than it does when idle.
//!
//! An optional external [`Reasoner`] can re-rank the lexical candidates.
//! The call is wrapped in a timeout and treated as failable: any error or
//! overrun falls back to the lexical scores. The router never mutates
//! persisted state; it emits one router event per call.

use crate::catalog::{ActionCatalog, ActionSpec, ParamSchema};
use crate::conversation::Conversation;
use crate::error::Result;
use crate::events::{CoreEvent, EventEmitter};
use crate::workflow::WorkflowStage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Gating decision attached to a classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Action may be dispatched
    Allowed,
    /// Confidence below threshold; the caller must treat the result as
    /// non-actionable
    LowConfidence,
    /// Action is valid in principle but disallowed at the current stage
    Blocked {
        /// The stage that blocks it
        stage: WorkflowStage,
    },
}

/// Result of classifying one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentClassification {
    /// Selected action, absent on a low-confidence classification
    pub action: Option<String>,
    /// Extracted entities: parameter name → raw text span
    pub entities: HashMap<String, String>,
    /// Confidence in [0, 1]
    pub confidence: f32,
    /// Gating decision
    pub gate: GateDecision,
}

/// External reasoning backend used to re-rank lexical candidates.
///
/// Implementations typically call a remote model; the router treats the
/// call as failable and bounded.
#[async_trait::async_trait]
pub trait Reasoner: Send + Sync {
    /// Score candidate action names for the message, in [0, 1].
    async fn rank(&self, message: &str, candidates: &[String]) -> Result<Vec<(String, f32)>>;
}

/// Configuration for the intent router
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Minimum confidence to consider a classification actionable
    pub confidence_threshold: f32,
    /// Weight for trigger-keyword overlap
    pub keyword_weight: f32,
    /// Weight for parameter-entity presence
    pub entity_weight: f32,
    /// Bonus for actions reachable from the current stage
    pub stage_bonus: f32,
    /// Blend factor for reasoner scores (0 = lexical only)
    pub reasoner_weight: f32,
    /// Budget for one reasoner call
    pub reasoner_timeout: Duration,
    /// Maximum input length
    pub max_input_length: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            keyword_weight: 0.5,
            entity_weight: 0.3,
            // Above the confidence threshold on its own: the pending
            // stage's action stays reachable for bare replies.
            stage_bonus: 0.45,
            reasoner_weight: 0.5,
            reasoner_timeout: Duration::from_secs(2),
            max_input_length: 10_000,
        }
    }
}

/// Stage-aware intent router over the action catalog.
pub struct IntentRouter {
    catalog: Arc<ActionCatalog>,
    config: RouterConfig,
    reasoner: Option<Arc<dyn Reasoner>>,
    emitter: EventEmitter,
}

struct Scored {
    name: String,
    score: f32,
    entities: HashMap<String, String>,
}

impl IntentRouter {
    /// Create a router without an external reasoner
    #[must_use]
    pub fn new(catalog: Arc<ActionCatalog>, config: RouterConfig, emitter: EventEmitter) -> Self {
        Self {
            catalog,
            config,
            reasoner: None,
            emitter,
        }
    }

    /// Attach an external reasoner
    #[must_use]
    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Classify a message in the context of the conversation's stage.
    #[instrument(skip(self, conversation, message), fields(conversation_id = %conversation.id, stage = %conversation.stage))]
    pub async fn classify(
        &self,
        conversation: &Conversation,
        message: &str,
        correlation_id: Uuid,
    ) -> IntentClassification {
        let classification = self.classify_inner(conversation, message).await;

        self.emitter.emit(CoreEvent::Router {
            conversation_id: conversation.id.clone(),
            correlation_id,
            stage: conversation.stage,
            action: classification.action.clone(),
            confidence: classification.confidence,
            gate: classification.gate.clone(),
        });

        classification
    }

    async fn classify_inner(
        &self,
        conversation: &Conversation,
        message: &str,
    ) -> IntentClassification {
        let trimmed = message.trim();
        if trimmed.is_empty() || trimmed.len() > self.config.max_input_length {
            debug!(len = trimmed.len(), "input rejected before scoring");
            return IntentClassification {
                action: None,
                entities: HashMap::new(),
                confidence: 0.0,
                gate: GateDecision::LowConfidence,
            };
        }

        let lowered = trimmed.to_lowercase();
        let stage = conversation.stage;

        let mut scored: Vec<Scored> = self
            .catalog
            .specs()
            .map(|spec| self.score_action(spec, &lowered, stage))
            .filter(|s| s.score > 0.0)
            .collect();

        if let Some(reasoner) = &self.reasoner {
            self.rerank(reasoner, trimmed, &mut scored).await;
        }

        // Deterministic order: score descending, then name
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });

        let Some(best) = scored.into_iter().next() else {
            return IntentClassification {
                action: None,
                entities: HashMap::new(),
                confidence: 0.0,
                gate: GateDecision::LowConfidence,
            };
        };

        if best.score < self.config.confidence_threshold {
            debug!(action = %best.name, score = best.score, "classification below threshold");
            return IntentClassification {
                action: None,
                entities: HashMap::new(),
                confidence: best.score,
                gate: GateDecision::LowConfidence,
            };
        }

        let spec = self.catalog.spec(&best.name);
        let gate = match spec {
            Some(spec) if !spec.reachable_from(stage) => {
                debug!(action = %best.name, stage = %stage, "classification gate-blocked");
                GateDecision::Blocked { stage }
            }
            _ => GateDecision::Allowed,
        };

        IntentClassification {
            action: Some(best.name),
            entities: best.entities,
            confidence: best.score,
            gate,
        }
    }

    /// Lexical score: keyword overlap, entity presence, stage affinity.
    fn score_action(&self, spec: &ActionSpec, lowered: &str, stage: WorkflowStage) -> Scored {
        let tokens: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();

        // Two keyword hits count as a full keyword match; requiring every
        // trigger word would punish actions with rich keyword lists.
        let matches = spec
            .keywords
            .iter()
            .filter(|kw| tokens.contains(&kw.as_str()))
            .count();
        let keyword_score = (matches as f32 / 2.0).min(1.0);

        let mut entities = HashMap::new();
        for param in &spec.params {
            if let ParamSchema::Choice { options, aliases } = &param.schema {
                let span = options
                    .iter()
                    .find(|o| tokens.contains(&o.to_lowercase().as_str()))
                    .map(|o| o.to_lowercase())
                    .or_else(|| {
                        aliases
                            .keys()
                            .find(|a| lowered.contains(a.as_str()))
                            .cloned()
                    });
                if let Some(span) = span {
                    entities.insert(param.name.clone(), span);
                }
            }
        }
        let entity_score = if spec.params.is_empty() {
            0.0
        } else {
            entities.len() as f32 / spec.params.len() as f32
        };

        // Mid-workflow, the action answering the pending stage is always a
        // live candidate: a bare reply like "the second one" carries no
        // keywords, only the stage tells us what it answers. Idle has no
        // pending question, so no affinity applies there.
        let stage_affinity = match &spec.allowed_stages {
            Some(stages) if stage != WorkflowStage::Idle && stages.contains(&stage) => {
                self.config.stage_bonus
            }
            _ => 0.0,
        };

        let raw = keyword_score * self.config.keyword_weight
            + entity_score * self.config.entity_weight
            + stage_affinity;

        Scored {
            name: spec.name.clone(),
            score: raw.min(1.0),
            entities,
        }
    }

    /// Blend reasoner scores into the lexical ranking. Failable: any
    /// error or timeout leaves the lexical scores untouched.
    async fn rerank(&self, reasoner: &Arc<dyn Reasoner>, message: &str, scored: &mut [Scored]) {
        let candidates: Vec<String> = scored.iter().map(|s| s.name.clone()).collect();
        if candidates.is_empty() {
            return;
        }

        let ranked =
            match tokio::time::timeout(self.config.reasoner_timeout, reasoner.rank(message, &candidates))
                .await
            {
                Ok(Ok(ranked)) => ranked,
                Ok(Err(e)) => {
                    warn!(error = %e, "reasoner failed, falling back to lexical scores");
                    return;
                }
                Err(_) => {
                    warn!(
                        timeout_ms = %self.config.reasoner_timeout.as_millis(),
                        "reasoner timed out, falling back to lexical scores"
                    );
                    return;
                }
            };

        let by_name: HashMap<&str, f32> = ranked
            .iter()
            .map(|(name, score)| (name.as_str(), score.clamp(0.0, 1.0)))
            .collect();
        let weight = self.config.reasoner_weight.clamp(0.0, 1.0);
        for entry in scored.iter_mut() {
            if let Some(&model_score) = by_name.get(entry.name.as_str()) {
                entry.score = entry.score * (1.0 - weight) + model_score * weight;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActionHandler, ActionOutcome, ParamSpec};
    use crate::error::Error;
    use crate::interpreter::ResolvedArguments;

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

    fn catalog() -> Arc<ActionCatalog> {
        let mut catalog = ActionCatalog::new();
        catalog.register(Arc::new(NoopHandler {
            spec: ActionSpec::new("start_guided_analysis", "Begin the guided flow")
                .with_keywords(&["start", "begin", "guided", "analysis"])
                .gated_to(&[WorkflowStage::Idle])
                .advances_to(WorkflowStage::AwaitingFacilityChoice),
        }));
        catalog.register(Arc::new(NoopHandler {
            spec: ActionSpec::new("choose_facility_tier", "Pick a facility tier")
                .with_keywords(&["facility", "tier", "hospitals", "clinics"])
                .with_param(ParamSpec::choice(
                    "tier",
                    "facility tier",
                    &["primary", "secondary", "tertiary", "all"],
                ))
                .gated_to(&[WorkflowStage::AwaitingFacilityChoice]),
        }));
        catalog.register(Arc::new(NoopHandler {
            spec: ActionSpec::new("run_analysis", "Run the computed analysis")
                .with_keywords(&["run", "compute", "calculate", "go"])
                .gated_to(&[WorkflowStage::ReadyForCompute]),
        }));
        catalog.register(Arc::new(NoopHandler {
            spec: ActionSpec::new("show_summary", "Summarize the loaded data")
                .with_keywords(&["summary", "summarize", "overview", "describe"]),
        }));
        Arc::new(catalog)
    }

    fn router() -> IntentRouter {
        IntentRouter::new(catalog(), RouterConfig::default(), EventEmitter::new(16))
    }

    fn conversation_at(stage: WorkflowStage) -> Conversation {
        let mut conv = Conversation::new("c1");
        conv.stage = stage;
        conv
    }

    #[tokio::test]
    async fn test_keyword_routing_when_idle() {
        let router = router();
        let conv = conversation_at(WorkflowStage::Idle);

        let result = router
            .classify(&conv, "give me a summary overview", Uuid::new_v4())
            .await;
        assert_eq!(result.action.as_deref(), Some("show_summary"));
        assert_eq!(result.gate, GateDecision::Allowed);
    }

    #[tokio::test]
    async fn test_stage_biases_classification() {
        let router = router();

        // Mid-workflow, a bare option mention routes to the stage's action
        let conv = conversation_at(WorkflowStage::AwaitingFacilityChoice);
        let result = router
            .classify(&conv, "secondary please", Uuid::new_v4())
            .await;
        assert_eq!(result.action.as_deref(), Some("choose_facility_tier"));
        assert_eq!(result.gate, GateDecision::Allowed);
        assert_eq!(result.entities.get("tier").map(String::as_str), Some("secondary"));
    }

    #[tokio::test]
    async fn test_gate_blocks_out_of_stage_action() {
        let router = router();
        let conv = conversation_at(WorkflowStage::Idle);

        let result = router
            .classify(&conv, "run the compute now, calculate it, go", Uuid::new_v4())
            .await;
        assert_eq!(result.action.as_deref(), Some("run_analysis"));
        assert_eq!(
            result.gate,
            GateDecision::Blocked {
                stage: WorkflowStage::Idle
            }
        );
    }

    #[tokio::test]
    async fn test_low_confidence_on_unrelated_message() {
        let router = router();
        let conv = conversation_at(WorkflowStage::Idle);

        let result = router
            .classify(&conv, "what's the weather like today", Uuid::new_v4())
            .await;
        assert_eq!(result.gate, GateDecision::LowConfidence);
        assert!(result.action.is_none());
    }

    #[tokio::test]
    async fn test_empty_message_is_low_confidence() {
        let router = router();
        let conv = conversation_at(WorkflowStage::Idle);

        let result = router.classify(&conv, "   ", Uuid::new_v4()).await;
        assert_eq!(result.gate, GateDecision::LowConfidence);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_router_event_emitted() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();
        let router = IntentRouter::new(catalog(), RouterConfig::default(), emitter);
        let conv = conversation_at(WorkflowStage::Idle);

        let id = Uuid::new_v4();
        router.classify(&conv, "show me a summary", id).await;

        let event = rx.try_recv().unwrap();
        assert_eq!(event.correlation_id(), id);
        assert!(matches!(event, CoreEvent::Router { .. }));
    }

    struct FixedReasoner {
        favorite: String,
    }

    #[async_trait::async_trait]
    impl Reasoner for FixedReasoner {
        async fn rank(&self, _message: &str, candidates: &[String]) -> Result<Vec<(String, f32)>> {
            Ok(candidates
                .iter()
                .map(|c| {
                    let score = if *c == self.favorite { 1.0 } else { 0.0 };
                    (c.clone(), score)
                })
                .collect())
        }
    }

    struct StallingReasoner;

    #[async_trait::async_trait]
    impl Reasoner for StallingReasoner {
        async fn rank(&self, _message: &str, _candidates: &[String]) -> Result<Vec<(String, f32)>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    struct FailingReasoner;

    #[async_trait::async_trait]
    impl Reasoner for FailingReasoner {
        async fn rank(&self, _message: &str, _candidates: &[String]) -> Result<Vec<(String, f32)>> {
            Err(Error::Internal("backend unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_reasoner_rerank_changes_winner() {
        let router = IntentRouter::new(catalog(), RouterConfig::default(), EventEmitter::new(16))
            .with_reasoner(Arc::new(FixedReasoner {
                favorite: "start_guided_analysis".to_string(),
            }));
        let conv = conversation_at(WorkflowStage::Idle);

        // "analysis summary" scores both actions lexically; the reasoner
        // pushes the guided flow to the top.
        let result = router
            .classify(&conv, "analysis summary please", Uuid::new_v4())
            .await;
        assert_eq!(result.action.as_deref(), Some("start_guided_analysis"));
    }

    #[tokio::test]
    async fn test_reasoner_timeout_falls_back_to_lexical() {
        let config = RouterConfig {
            reasoner_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let router = IntentRouter::new(catalog(), config, EventEmitter::new(16))
            .with_reasoner(Arc::new(StallingReasoner));
        let conv = conversation_at(WorkflowStage::Idle);

        let result = router
            .classify(&conv, "give me a summary overview", Uuid::new_v4())
            .await;
        assert_eq!(result.action.as_deref(), Some("show_summary"));
    }

    #[tokio::test]
    async fn test_reasoner_error_falls_back_to_lexical() {
        let router = IntentRouter::new(catalog(), RouterConfig::default(), EventEmitter::new(16))
            .with_reasoner(Arc::new(FailingReasoner));
        let conv = conversation_at(WorkflowStage::Idle);

        let result = router
            .classify(&conv, "give me a summary overview", Uuid::new_v4())
            .await;
        assert_eq!(result.action.as_deref(), Some("show_summary"));
    }
}

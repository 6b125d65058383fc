//! Guided workflow state machine
//!
//! Tracks the per-conversation stage of the guided analysis flow and
//! enforces valid transitions. Every transition is transactional against
//! the shared store: read stage + version, validate, write conditionally.
//! A version mismatch means another worker advanced the conversation
//! first; the transition is retried against the fresh stage rather than
//! overwritten blindly.

use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::store::ConversationStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Stage of the guided analysis workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    /// No guided flow in progress
    Idle,
    /// Waiting for the user to pick a facility tier
    AwaitingFacilityChoice,
    /// Waiting for the user to pick an age group
    AwaitingAgeGroup,
    /// All inputs collected; analysis can run
    ReadyForCompute,
    /// Terminal: the guided flow finished
    Completed,
}

impl WorkflowStage {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingFacilityChoice => "awaiting_facility_choice",
            Self::AwaitingAgeGroup => "awaiting_age_group",
            Self::ReadyForCompute => "ready_for_compute",
            Self::Completed => "completed",
        }
    }

    /// Terminal stages accept no further transitions except none at all
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// The forward path is strictly sequential; reset to `Idle` is
    /// reachable from any non-terminal stage; a same-stage "transition"
    /// is legal and treated as idempotent re-entry.
    #[must_use]
    pub fn can_transition_to(&self, to: WorkflowStage) -> bool {
        if *self == to {
            return true;
        }
        match (self, to) {
            (Self::Idle, Self::AwaitingFacilityChoice)
            | (Self::AwaitingFacilityChoice, Self::AwaitingAgeGroup)
            | (Self::AwaitingAgeGroup, Self::ReadyForCompute)
            | (Self::ReadyForCompute, Self::Completed) => true,
            (from, Self::Idle) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Deterministic user-facing prompt for an action blocked at this stage.
    #[must_use]
    pub fn gate_prompt(&self) -> String {
        match self {
            Self::Idle => {
                "Let's start an analysis first. Say \"start a guided analysis\".".to_string()
            }
            Self::AwaitingFacilityChoice => {
                "Please choose a facility tier first (primary, secondary, tertiary, or all)."
                    .to_string()
            }
            Self::AwaitingAgeGroup => {
                "Please choose an age group first (e.g. under five, five to fourteen, adults)."
                    .to_string()
            }
            Self::ReadyForCompute => {
                "Your inputs are set. Say \"run the analysis\" to continue.".to_string()
            }
            Self::Completed => {
                "This analysis is finished. Start a new one to make further changes.".to_string()
            }
        }
    }
}

impl Default for WorkflowStage {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry discipline for optimistic-concurrency conflicts.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Attempts before a conflict is surfaced as transient failure
    pub conflict_retries: u32,
    /// Linear backoff between attempts
    pub conflict_backoff: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 4,
            conflict_backoff: Duration::from_millis(25),
        }
    }
}

/// Workflow state machine bound to the shared store.
///
/// The context bag inside a [`Conversation`] is mutated only through this
/// type's transactional update step, never directly by the router or the
/// interpreter.
pub struct WorkflowMachine {
    store: Arc<dyn ConversationStore>,
    config: WorkflowConfig,
}

impl WorkflowMachine {
    /// Create a machine over a store
    #[must_use]
    pub fn new(store: Arc<dyn ConversationStore>, config: WorkflowConfig) -> Self {
        Self { store, config }
    }

    /// Load a conversation, creating it at `Idle` if absent.
    pub async fn load_or_create(&self, conversation_id: &str) -> Result<Conversation> {
        if let Some(conv) = self.store.load(conversation_id).await? {
            return Ok(conv);
        }
        let conv = Conversation::new(conversation_id);
        match self.store.save(&conv, None).await {
            Ok(version) => {
                let mut created = conv;
                created.version = version;
                Ok(created)
            }
            // Another worker created it between our load and save
            Err(Error::StateConflict { .. }) => self
                .store
                .load(conversation_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id))),
            Err(e) => Err(e),
        }
    }

    /// Transactionally mutate a conversation with bounded conflict retries.
    ///
    /// The closure runs once per attempt against a freshly-loaded record,
    /// so it must be re-runnable. Returning `Ok(false)` from the closure
    /// means "nothing to change" and skips the write entirely.
    #[instrument(skip(self, mutate), fields(conversation_id = %conversation_id))]
    pub async fn update<F>(&self, conversation_id: &str, mutate: F) -> Result<Conversation>
    where
        F: Fn(&mut Conversation) -> Result<bool> + Send + Sync,
    {
        let mut attempts: u32 = 0;
        loop {
            let mut conv = self
                .store
                .load(conversation_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("conversation {}", conversation_id)))?;
            let expected = conv.version;

            if !mutate(&mut conv)? {
                debug!(conversation_id = %conversation_id, "update was a no-op");
                return Ok(conv);
            }
            conv.touch();

            match self.store.save(&conv, Some(expected)).await {
                Ok(version) => {
                    conv.version = version;
                    return Ok(conv);
                }
                Err(Error::StateConflict { .. }) => {
                    attempts += 1;
                    if attempts >= self.config.conflict_retries {
                        warn!(
                            conversation_id = %conversation_id,
                            attempts = attempts,
                            "giving up after repeated version conflicts"
                        );
                        return Err(Error::StateConflict { attempts });
                    }
                    debug!(
                        conversation_id = %conversation_id,
                        attempt = attempts,
                        "version conflict, retrying against fresh state"
                    );
                    tokio::time::sleep(self.config.conflict_backoff * attempts).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Advance a conversation to `to`, recording context values collected
    /// at this stage.
    ///
    /// Idempotent re-entry: if the conversation already sits at `to` with
    /// the same context values, nothing is written and no side effect
    /// repeats. If another worker advanced the conversation first, the
    /// retry revalidates against the fresh stage instead of double-applying.
    #[instrument(skip(self, context_updates), fields(conversation_id = %conversation_id, to = %to))]
    pub async fn transition(
        &self,
        conversation_id: &str,
        to: WorkflowStage,
        context_updates: HashMap<String, serde_json::Value>,
    ) -> Result<Conversation> {
        self.update(conversation_id, move |conv| {
            let already_there = conv.stage == to
                && context_updates
                    .iter()
                    .all(|(k, v)| conv.context.get(k) == Some(v));
            if already_there {
                return Ok(false);
            }
            if !conv.stage.can_transition_to(to) {
                return Err(Error::InvalidState(format!(
                    "cannot move from '{}' to '{}'",
                    conv.stage, to
                )));
            }
            conv.stage = to;
            for (k, v) in &context_updates {
                conv.context.insert(k.clone(), v.clone());
            }
            Ok(true)
        })
        .await
    }

    /// Cancel the in-progress flow, returning the conversation to `Idle`
    /// and clearing collected inputs. Reachable from any non-terminal
    /// stage; at `Idle` it is a no-op.
    pub async fn reset(&self, conversation_id: &str) -> Result<Conversation> {
        self.update(conversation_id, |conv| {
            if conv.stage == WorkflowStage::Idle {
                return Ok(false);
            }
            if conv.stage.is_terminal() {
                return Err(Error::InvalidState(
                    "a finished analysis cannot be cancelled".to_string(),
                ));
            }
            conv.stage = WorkflowStage::Idle;
            conv.context.clear();
            Ok(true)
        })
        .await
    }
}

//! Conversation engine
//!
//! The single entry point between an incoming chat message and the
//! execution of an analytical action: classify, gate-check, resolve
//! arguments, dispatch, then commit the outcome to the shared store with
//! the versioned read-modify-write discipline.
//!
//! Every turn produces exactly one of: an answer, one clarifying
//! question, a gate-blocked notice, or one bounded failure message. Only
//! store unavailability escapes as a hard error.

use crate::arena::{ArenaBattle, ArenaCoordinator, Vote};
use crate::catalog::{ActionCatalog, ActionSpec};
use crate::config::CoreConfig;
use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventEmitter};
use crate::interpreter::{ChoiceInterpreter, ResolvedArguments};
use crate::router::{GateDecision, IntentRouter, Reasoner};
use crate::store::ConversationStore;
use crate::workflow::{WorkflowMachine, WorkflowStage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Size of one streamed delta in characters
const STREAM_CHUNK_CHARS: usize = 80;

/// User-visible result of one conversation turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// A direct answer, possibly referencing a produced result
    Answer {
        /// Response text
        text: String,
        /// Opaque handle to the produced result, if any
        result_handle: Option<String>,
    },
    /// Exactly one clarifying question
    Clarification {
        /// The question
        text: String,
    },
    /// The classified action is disallowed at the current stage
    GateBlocked {
        /// Stage-appropriate redirect message
        text: String,
    },
    /// One bounded failure message
    Failure {
        /// The message
        text: String,
    },
}

impl Response {
    /// The user-visible text of this response
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Answer { text, .. }
            | Self::Clarification { text }
            | Self::GateBlocked { text }
            | Self::Failure { text } => text,
        }
    }
}

/// One element of a streamed response.
#[derive(Debug, Clone)]
pub enum ResponseChunk {
    /// A piece of the response text
    Delta(String),
    /// Final element; state has been committed
    Done(Response),
}

/// State mutation to apply once the turn's response is fully delivered.
struct Commit {
    stage: Option<WorkflowStage>,
    context_updates: HashMap<String, serde_json::Value>,
    clear_context: bool,
    user_text: String,
    assistant_text: String,
}

struct TurnOutcome {
    response: Response,
    commit: Commit,
}

/// The conversation engine.
pub struct Engine {
    catalog: Arc<ActionCatalog>,
    router: IntentRouter,
    interpreter: ChoiceInterpreter,
    workflow: WorkflowMachine,
    arena: ArenaCoordinator,
    emitter: EventEmitter,
    config: CoreConfig,
}

impl Engine {
    /// Build an engine over a store and an action catalog.
    #[must_use]
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn ConversationStore>,
        catalog: Arc<ActionCatalog>,
    ) -> Self {
        let emitter = EventEmitter::default();
        let router = IntentRouter::new(
            Arc::clone(&catalog),
            config.router_config(),
            emitter.clone(),
        );
        let interpreter = ChoiceInterpreter::new(config.interpreter_config(), emitter.clone());
        let workflow = WorkflowMachine::new(Arc::clone(&store), config.workflow_config());
        let arena = ArenaCoordinator::new(Arc::clone(&store), emitter.clone(), config.arena_config());

        Self {
            catalog,
            router,
            interpreter,
            workflow,
            arena,
            emitter,
            config,
        }
    }

    /// Attach an external reasoner to the router.
    #[must_use]
    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.router = self.router.with_reasoner(reasoner);
        self
    }

    /// The engine's event stream.
    #[must_use]
    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Handle one message for one conversation.
    ///
    /// # Errors
    ///
    /// Only store unavailability (after the bounded retries) is returned
    /// as an error; every other failure is recovered into a [`Response`].
    #[instrument(skip(self, message), fields(conversation_id = %conversation_id))]
    pub async fn handle(&self, conversation_id: &str, message: &str) -> Result<Response> {
        let correlation_id = Uuid::new_v4();
        let conversation = self.workflow.load_or_create(conversation_id).await?;

        let outcome = match self
            .compute(&conversation, message, correlation_id, &CancellationToken::new())
            .await
        {
            Ok(Some(outcome)) => outcome,
            // Uncancellable token: this arm is unreachable in practice
            Ok(None) => {
                return Ok(Response::Failure {
                    text: Error::Internal("turn interrupted".to_string()).user_message(),
                })
            }
            Err(e @ Error::StoreUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "turn computation failed");
                return Ok(Response::Failure {
                    text: e.user_message(),
                });
            }
        };

        match self.commit_turn(conversation_id, &outcome.commit).await {
            Ok(()) => Ok(outcome.response),
            Err(e @ Error::StoreUnavailable(_)) => Err(e),
            Err(e) => {
                warn!(error = %e, "turn commit failed");
                Ok(Response::Failure {
                    text: e.user_message(),
                })
            }
        }
    }

    /// Streaming variant: yields response chunks incrementally and commits
    /// conversation state exactly once, at stream completion. Cancelling
    /// the token (or dropping the receiver) stops the stream and skips the
    /// commit; a cancelled turn is equivalent to no turn.
    #[must_use]
    pub fn handle_streamed(
        self: &Arc<Self>,
        conversation_id: String,
        message: String,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ResponseChunk> {
        let (tx, rx) = mpsc::channel(16);
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let correlation_id = Uuid::new_v4();
            let conversation = match engine.workflow.load_or_create(&conversation_id).await {
                Ok(conversation) => conversation,
                Err(e) => {
                    let _ = tx
                        .send(ResponseChunk::Done(Response::Failure {
                            text: e.user_message(),
                        }))
                        .await;
                    return;
                }
            };

            let outcome = match engine
                .compute(&conversation, &message, correlation_id, &cancel)
                .await
            {
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    debug!(conversation_id = %conversation_id, "stream cancelled before dispatch completed");
                    return;
                }
                Err(e) => {
                    let _ = tx
                        .send(ResponseChunk::Done(Response::Failure {
                            text: e.user_message(),
                        }))
                        .await;
                    return;
                }
            };

            for chunk in chunk_text(outcome.response.text(), STREAM_CHUNK_CHARS) {
                if cancel.is_cancelled() {
                    debug!(conversation_id = %conversation_id, "stream cancelled mid-delivery, skipping commit");
                    return;
                }
                if tx.send(ResponseChunk::Delta(chunk)).await.is_err() {
                    // Receiver dropped: client disconnected
                    debug!(conversation_id = %conversation_id, "stream receiver dropped, skipping commit");
                    return;
                }
            }

            if cancel.is_cancelled() {
                return;
            }

            // Single authoritative commit, now that delivery finished
            let response = match engine.commit_turn(&conversation_id, &outcome.commit).await {
                Ok(()) => outcome.response,
                Err(e) => Response::Failure {
                    text: e.user_message(),
                },
            };
            let _ = tx.send(ResponseChunk::Done(response)).await;
        });

        rx
    }

    /// Record a vote for a pending comparison.
    pub async fn vote(&self, battle_id: Uuid, vote: Vote) -> Result<Response> {
        match self.arena.vote(battle_id, vote).await {
            Ok(battle) => Ok(Response::Answer {
                text: format!("Recorded your pick for comparison {}.", battle.id),
                result_handle: Some(battle.id.to_string()),
            }),
            Err(e @ Error::StoreUnavailable(_)) => Err(e),
            Err(e) => Ok(Response::Failure {
                text: e.user_message(),
            }),
        }
    }

    /// Sweep expired battles out of the voting pool.
    pub async fn expire_stale_battles(&self) -> Result<usize> {
        self.arena.expire_stale().await
    }

    /// Classify, gate-check, resolve, and dispatch. Returns `None` when the
    /// cancellation token fired mid-dispatch; otherwise every failure is
    /// folded into the returned response.
    async fn compute(
        &self,
        conversation: &Conversation,
        message: &str,
        correlation_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnOutcome>> {
        let classification = self.router.classify(conversation, message, correlation_id).await;

        let action = match (&classification.gate, &classification.action) {
            (GateDecision::LowConfidence, _) | (_, None) => {
                let error = Error::LowConfidenceRouting {
                    confidence: classification.confidence,
                };
                return Ok(Some(self.plain_turn(
                    message,
                    Response::Clarification {
                        text: error.user_message(),
                    },
                )));
            }
            (GateDecision::Blocked { stage }, _) => {
                return Ok(Some(self.plain_turn(
                    message,
                    Response::GateBlocked {
                        text: stage.gate_prompt(),
                    },
                )));
            }
            (GateDecision::Allowed, Some(action)) => action.clone(),
        };

        let Some(handler) = self.catalog.get(&action) else {
            warn!(action = %action, "classified action missing from catalog");
            return Ok(Some(self.plain_turn(
                message,
                Response::Failure {
                    text: Error::Internal("unknown action".to_string()).user_message(),
                },
            )));
        };
        let spec = handler.spec().clone();

        let resolved = if spec.params.is_empty() {
            ResolvedArguments::empty(&spec.name)
        } else {
            self.interpreter
                .resolve(&spec, message, conversation, correlation_id)
        };

        if let Some(question) = &resolved.clarifier {
            // A pending clarifier never triggers a transition
            return Ok(Some(self.plain_turn(
                message,
                Response::Clarification {
                    text: question.clone(),
                },
            )));
        }

        if spec.comparison {
            if let Some(challenger) = self.catalog.challenger(&spec.name) {
                let battle = self
                    .arena
                    .start(conversation, correlation_id, &resolved, handler, challenger)
                    .await?;
                return Ok(Some(self.battle_turn(message, &spec, &battle)));
            }
            debug!(action = %spec.name, "comparison action has no challenger, dispatching directly");
        }

        let start = Instant::now();
        let dispatched = tokio::select! {
            outcome = handler.execute(&resolved, conversation) => outcome,
            () = cancel.cancelled() => {
                info!(action = %spec.name, "dispatch cancelled by client");
                return Ok(None);
            }
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        self.emitter.emit(CoreEvent::Execution {
            conversation_id: conversation.id.clone(),
            correlation_id,
            action: spec.name.clone(),
            success: dispatched.is_ok(),
            duration_ms,
            error: dispatched.as_ref().err().map(|e| e.to_string()),
        });

        let outcome = match dispatched {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(action = %spec.name, error = %e, "dispatch failed");
                return Ok(Some(self.plain_turn(
                    message,
                    Response::Failure {
                        text: e.user_message(),
                    },
                )));
            }
        };

        // Stage inputs collected this turn travel with the transition
        let mut context_updates: HashMap<String, serde_json::Value> = resolved
            .values
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect();
        context_updates.extend(outcome.context_updates.clone());

        let response = Response::Answer {
            text: outcome.message.clone(),
            result_handle: outcome.result_handle.clone(),
        };

        Ok(Some(TurnOutcome {
            commit: Commit {
                stage: spec.advances_to,
                context_updates,
                clear_context: outcome.clear_context,
                user_text: message.to_string(),
                assistant_text: outcome.message,
            },
            response,
        }))
    }

    /// A turn that records history but never advances the workflow.
    fn plain_turn(&self, message: &str, response: Response) -> TurnOutcome {
        TurnOutcome {
            commit: Commit {
                stage: None,
                context_updates: HashMap::new(),
                clear_context: false,
                user_text: message.to_string(),
                assistant_text: response.text().to_string(),
            },
            response,
        }
    }

    fn battle_turn(&self, message: &str, spec: &ActionSpec, battle: &ArenaBattle) -> TurnOutcome {
        let side_a = battle
            .slot_a
            .as_ref()
            .map(|r| r.message.as_str())
            .unwrap_or("(no result)");
        let side_b = battle
            .slot_b
            .as_ref()
            .map(|r| r.message.as_str())
            .unwrap_or("(no result)");
        let text = format!(
            "Two takes on that:\n\nA) {}\n\nB) {}\n\nWhich looks better: A, B, or tie?",
            side_a, side_b
        );

        TurnOutcome {
            commit: Commit {
                stage: spec.advances_to,
                context_updates: HashMap::new(),
                clear_context: false,
                user_text: message.to_string(),
                assistant_text: text.clone(),
            },
            response: Response::Answer {
                text,
                result_handle: Some(battle.id.to_string()),
            },
        }
    }

    /// Apply one turn's mutation with the versioned read-modify-write
    /// discipline: history append, context updates, and the stage advance
    /// land in a single conditional write.
    async fn commit_turn(&self, conversation_id: &str, commit: &Commit) -> Result<()> {
        let max_history = self.config.state.max_history;
        self.workflow
            .update(conversation_id, |conv| {
                conv.max_history = max_history;

                if let Some(to) = commit.stage {
                    let repeated = conv.stage == to
                        && commit
                            .context_updates
                            .iter()
                            .all(|(k, v)| conv.context.get(k) == Some(v));
                    if !repeated {
                        if !conv.stage.can_transition_to(to) {
                            return Err(Error::InvalidState(format!(
                                "cannot move from '{}' to '{}'",
                                conv.stage, to
                            )));
                        }
                        conv.stage = to;
                    }
                }

                if commit.clear_context {
                    conv.context.clear();
                }
                for (key, value) in &commit.context_updates {
                    conv.context.insert(key.clone(), value.clone());
                }

                conv.add_user_message(&commit.user_text);
                conv.add_assistant_message(&commit.assistant_text);
                Ok(true)
            })
            .await
            .map(|_| ())
    }
}

/// Split text into chunks of at most `size` characters, on char
/// boundaries.
fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

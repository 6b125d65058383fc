//! Observability event stream
//!
//! Append-only structured events correlating router, choice, execution,
//! and arena decisions for one conversation turn. This is a pure side
//! channel: emission failures are swallowed and counted, never propagated
//! into the request path.

use crate::router::GateDecision;
use crate::workflow::WorkflowStage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted by the core, one class per component.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    /// Intent router decision
    Router {
        /// Conversation this turn belongs to
        conversation_id: String,
        /// Correlation id for the turn
        correlation_id: Uuid,
        /// Stage the classification was biased by
        stage: WorkflowStage,
        /// Selected action, if any cleared the threshold
        action: Option<String>,
        /// Best confidence reached
        confidence: f32,
        /// Gating decision
        gate: GateDecision,
    },
    /// Choice interpreter decision
    Choice {
        /// Conversation this turn belongs to
        conversation_id: String,
        /// Correlation id for the turn
        correlation_id: Uuid,
        /// Action whose parameters were resolved
        action: String,
        /// Resolution confidence
        confidence: f32,
        /// How the winning candidate matched
        matched_by: String,
        /// Whether a clarifying question was issued instead of a dispatch
        clarified: bool,
    },
    /// Action/snippet execution outcome
    Execution {
        /// Conversation this turn belongs to
        conversation_id: String,
        /// Correlation id for the turn
        correlation_id: Uuid,
        /// Dispatched action
        action: String,
        /// Whether the dispatch succeeded
        success: bool,
        /// Wall-clock duration in milliseconds
        duration_ms: u64,
        /// Sanitized error description on failure
        error: Option<String>,
    },
    /// Arena battle lifecycle change
    Arena {
        /// Conversation this turn belongs to
        conversation_id: String,
        /// Correlation id for the turn
        correlation_id: Uuid,
        /// Battle id
        battle_id: Uuid,
        /// Phase after the change
        phase: String,
    },
}

impl CoreEvent {
    /// Correlation id tying this event to one conversation turn.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::Router { correlation_id, .. }
            | Self::Choice { correlation_id, .. }
            | Self::Execution { correlation_id, .. }
            | Self::Arena { correlation_id, .. } => *correlation_id,
        }
    }

    /// Conversation id the event belongs to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::Router {
                conversation_id, ..
            }
            | Self::Choice {
                conversation_id, ..
            }
            | Self::Execution {
                conversation_id, ..
            }
            | Self::Arena {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Broadcast-based event emitter.
///
/// Uses `tokio::broadcast` so multiple subscribers can observe the same
/// stream. With no subscribers (or lagged ones) events are dropped and
/// counted rather than blocking or failing the request.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<CoreEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventEmitter {
    /// Create an emitter with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Failures are swallowed and counted.
    pub fn emit(&self, event: CoreEvent) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of events dropped because no subscriber received them.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router_event(correlation_id: Uuid) -> CoreEvent {
        CoreEvent::Router {
            conversation_id: "c1".to_string(),
            correlation_id,
            stage: WorkflowStage::Idle,
            action: Some("show_summary".to_string()),
            confidence: 0.8,
            gate: GateDecision::Allowed,
        }
    }

    #[tokio::test]
    async fn test_emit_and_receive() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        let id = Uuid::new_v4();
        emitter.emit(router_event(id));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.correlation_id(), id);
        assert_eq!(event.conversation_id(), "c1");
    }

    #[test]
    fn test_emit_without_subscribers_is_swallowed() {
        let emitter = EventEmitter::new(16);
        emitter.emit(router_event(Uuid::new_v4()));
        emitter.emit(router_event(Uuid::new_v4()));
        assert_eq!(emitter.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        let id = Uuid::new_v4();
        emitter.emit(router_event(id));
        assert_eq!(rx1.recv().await.unwrap().correlation_id(), id);
        assert_eq!(rx2.recv().await.unwrap().correlation_id(), id);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoreEvent::Execution {
            conversation_id: "c1".to_string(),
            correlation_id: Uuid::nil(),
            action: "run_analysis".to_string(),
            success: true,
            duration_ms: 120,
            error: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"execution\""));
        assert!(json.contains("\"action\":\"run_analysis\""));
    }
}

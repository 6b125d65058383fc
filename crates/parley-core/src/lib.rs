//! Parley Core - routing and state coordination
//!
//! This crate sits between an incoming chat message and the execution of
//! an analytical action:
//! - Routing: stage-aware intent classification with confidence gating
//! - Interpretation: universal slot filling against typed parameter schemas
//! - Workflow: a per-conversation stage machine with transactional,
//!   version-checked transitions
//! - Store: the shared conversation/battle state, the only cross-worker
//!   synchronization point
//! - Arena: paired comparison executions resolved by a user vote
//! - Events: a structured observability side channel
//!
//! Workers are stateless between requests; any worker may handle any
//! request for any conversation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod arena;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod router;
pub mod store;
pub mod workflow;

pub use arena::{ArenaBattle, ArenaConfig, ArenaCoordinator, BattlePhase, BattleSlot, Vote};
pub use catalog::{
    ActionCatalog, ActionHandler, ActionOutcome, ActionSpec, ParamSchema, ParamSpec,
};
pub use config::{CoreConfig, StoreBackend};
pub use conversation::{Conversation, HistoryEntry, Role};
pub use engine::{Engine, Response, ResponseChunk};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventEmitter};
pub use interpreter::{
    ArgValue, ChoiceInterpreter, InterpreterConfig, MatchedBy, ResolvedArguments,
};
pub use router::{GateDecision, IntentClassification, IntentRouter, Reasoner, RouterConfig};
pub use store::{ConversationStore, MemoryStore, RedisStore};
pub use workflow::{WorkflowConfig, WorkflowMachine, WorkflowStage};

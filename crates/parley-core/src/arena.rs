//! Arena coordinator
//!
//! Runs paired "battle" executions: the same resolved input dispatched to
//! two independent action implementations, with completion tracked per
//! slot (no ordering guarantee between the two) and a user vote collected
//! once both results are in. Battles persist in the shared store until a
//! vote is recorded or the expiry timer lapses, so stale battles never
//! accumulate unboundedly.

use crate::catalog::ActionHandler;
use crate::conversation::Conversation;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventEmitter};
use crate::interpreter::ResolvedArguments;
use crate::store::ConversationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Lifecycle phase of a battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattlePhase {
    /// Battle record created, nothing dispatched yet
    Created,
    /// Both candidates dispatched, neither complete
    BothPending,
    /// One candidate finished
    OneComplete,
    /// Both candidates finished; voting is open
    BothComplete,
    /// A vote was recorded (terminal)
    Voted,
    /// Expiry lapsed before a vote (terminal)
    Expired,
}

impl BattlePhase {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::BothPending => "both_pending",
            Self::OneComplete => "one_complete",
            Self::BothComplete => "both_complete",
            Self::Voted => "voted",
            Self::Expired => "expired",
        }
    }

    /// Terminal phases accept no further changes
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Voted | Self::Expired)
    }
}

/// Which candidate slot a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BattleSlot {
    /// First candidate
    A,
    /// Second candidate
    B,
}

/// A recorded user vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    /// First candidate wins
    A,
    /// Second candidate wins
    B,
    /// Neither is better
    Tie,
}

/// Outcome captured for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleResult {
    /// Whether the candidate completed without error
    pub success: bool,
    /// Response text (or the bounded failure message)
    pub message: String,
    /// Result handle when the candidate produced one
    #[serde(default)]
    pub result_handle: Option<String>,
    /// Completion timestamp
    pub completed_at: DateTime<Utc>,
}

/// A paired comparison, persisted until voted or expired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaBattle {
    /// Battle id
    pub id: Uuid,
    /// Conversation the battle belongs to
    pub conversation_id: String,
    /// Current phase
    pub phase: BattlePhase,
    /// First candidate result
    #[serde(default)]
    pub slot_a: Option<BattleResult>,
    /// Second candidate result
    #[serde(default)]
    pub slot_b: Option<BattleResult>,
    /// Recorded vote
    #[serde(default)]
    pub vote: Option<Vote>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Instant after which an unvoted battle is expired
    pub expires_at: DateTime<Utc>,
}

impl ArenaBattle {
    /// Create a battle with the given expiry duration
    #[must_use]
    pub fn new(conversation_id: impl Into<String>, expiry: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.into(),
            phase: BattlePhase::Created,
            slot_a: None,
            slot_b: None,
            vote: None,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::seconds(900)),
        }
    }

    /// Record one candidate's result and advance the phase.
    pub fn record(&mut self, slot: BattleSlot, result: BattleResult) {
        match slot {
            BattleSlot::A => self.slot_a = Some(result),
            BattleSlot::B => self.slot_b = Some(result),
        }
        self.phase = match (self.slot_a.is_some(), self.slot_b.is_some()) {
            (true, true) => BattlePhase::BothComplete,
            (false, false) => BattlePhase::BothPending,
            _ => BattlePhase::OneComplete,
        };
    }

    /// Whether voting is currently valid
    #[must_use]
    pub fn can_vote(&self) -> bool {
        self.phase == BattlePhase::BothComplete
    }

    /// Whether the expiry timer has lapsed for a non-terminal battle
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.phase.is_terminal() && now >= self.expires_at
    }
}

/// Configuration for the arena
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// How long an unvoted battle stays eligible
    pub expiry: Duration,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(900),
        }
    }
}

/// Coordinator for paired comparison executions.
pub struct ArenaCoordinator {
    store: Arc<dyn ConversationStore>,
    emitter: EventEmitter,
    config: ArenaConfig,
}

impl ArenaCoordinator {
    /// Create a coordinator over a store
    #[must_use]
    pub fn new(store: Arc<dyn ConversationStore>, emitter: EventEmitter, config: ArenaConfig) -> Self {
        Self {
            store,
            emitter,
            config,
        }
    }

    /// Dispatch one resolved input to two candidate implementations and
    /// persist the completed battle. Candidate failures are captured as
    /// failed slots, never propagated.
    #[instrument(skip_all, fields(conversation_id = %conversation.id, action = %args.action))]
    pub async fn start(
        &self,
        conversation: &Conversation,
        correlation_id: Uuid,
        args: &ResolvedArguments,
        primary: Arc<dyn ActionHandler>,
        challenger: Arc<dyn ActionHandler>,
    ) -> Result<ArenaBattle> {
        let mut battle = ArenaBattle::new(&conversation.id, self.config.expiry);
        battle.phase = BattlePhase::BothPending;
        self.store.save_battle(&battle).await?;
        self.emit_phase(conversation, correlation_id, &battle);

        let (first, second) = futures::future::join(
            primary.execute(args, conversation),
            challenger.execute(args, conversation),
        )
        .await;

        battle.record(BattleSlot::A, capture(first));
        self.store.save_battle(&battle).await?;
        self.emit_phase(conversation, correlation_id, &battle);

        battle.record(BattleSlot::B, capture(second));
        self.store.save_battle(&battle).await?;
        self.emit_phase(conversation, correlation_id, &battle);

        debug!(battle_id = %battle.id, "battle complete, awaiting vote");
        Ok(battle)
    }

    /// Record a vote. Valid only while the battle is at `BothComplete`
    /// and not past its expiry.
    #[instrument(skip(self), fields(battle_id = %battle_id))]
    pub async fn vote(&self, battle_id: Uuid, vote: Vote) -> Result<ArenaBattle> {
        let mut battle = self
            .store
            .load_battle(battle_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("battle {}", battle_id)))?;

        if battle.is_expired(Utc::now()) {
            battle.phase = BattlePhase::Expired;
            self.store.save_battle(&battle).await?;
            return Err(Error::InvalidState(
                "This comparison has expired; run it again to vote.".to_string(),
            ));
        }

        if !battle.can_vote() {
            return Err(Error::InvalidState(format!(
                "Voting is not open for this comparison (phase: {}).",
                battle.phase.as_str()
            )));
        }

        battle.vote = Some(vote);
        battle.phase = BattlePhase::Voted;
        self.store.save_battle(&battle).await?;

        self.emitter.emit(CoreEvent::Arena {
            conversation_id: battle.conversation_id.clone(),
            correlation_id: Uuid::new_v4(),
            battle_id: battle.id,
            phase: battle.phase.as_str().to_string(),
        });

        Ok(battle)
    }

    /// Expire every battle past its deadline. Returns how many were swept.
    pub async fn expire_stale(&self) -> Result<usize> {
        let now = Utc::now();
        let mut swept = 0;
        for mut battle in self.store.list_battles().await? {
            if battle.is_expired(now) {
                battle.phase = BattlePhase::Expired;
                if let Err(e) = self.store.save_battle(&battle).await {
                    warn!(battle_id = %battle.id, error = %e, "failed to persist expiry");
                    continue;
                }
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(swept = swept, "expired stale battles");
        }
        Ok(swept)
    }

    fn emit_phase(&self, conversation: &Conversation, correlation_id: Uuid, battle: &ArenaBattle) {
        self.emitter.emit(CoreEvent::Arena {
            conversation_id: conversation.id.clone(),
            correlation_id,
            battle_id: battle.id,
            phase: battle.phase.as_str().to_string(),
        });
    }
}

fn capture(outcome: Result<crate::catalog::ActionOutcome>) -> BattleResult {
    match outcome {
        Ok(outcome) => BattleResult {
            success: true,
            message: outcome.message,
            result_handle: outcome.result_handle,
            completed_at: Utc::now(),
        },
        Err(e) => BattleResult {
            success: false,
            message: e.user_message(),
            result_handle: None,
            completed_at: Utc::now(),
        },
    }
}

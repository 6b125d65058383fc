//! Conversation record
//!
//! One record per conversation id lives in the shared store: current
//! workflow stage, the context bag of collected inputs, a bounded message
//! history folded into a compact summary past the size threshold, and the
//! version counter used for optimistic concurrency.

use crate::workflow::WorkflowStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default bound on retained history entries
const DEFAULT_MAX_HISTORY: usize = 40;

/// Cap on the folded summary text
const SUMMARY_CLIP: usize = 500;

/// Who produced a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The assistant
    Assistant,
}

/// One turn of recorded history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Speaker
    pub role: Role,
    /// Message text
    pub text: String,
    /// When it was recorded
    pub at: DateTime<Utc>,
}

/// Durable per-conversation state.
///
/// Workers hold a `Conversation` only for the duration of one request;
/// the shared store is the writer of record. The `version` field is
/// bumped by every successful conditional save and must accompany any
/// write back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Opaque conversation id
    pub id: String,
    /// Current workflow stage
    #[serde(default)]
    pub stage: WorkflowStage,
    /// Collected inputs and handles (facility tier, age group, last result)
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    /// Bounded recent history
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Compact summary of evicted history
    #[serde(default)]
    pub summary: Option<String>,
    /// Optimistic-concurrency version counter
    #[serde(default)]
    pub version: u64,
    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,
    /// History bound before folding starts
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    DEFAULT_MAX_HISTORY
}

impl Conversation {
    /// Create a fresh conversation at `Idle` with version 0 (unsaved).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stage: WorkflowStage::Idle,
            context: HashMap::new(),
            history: Vec::new(),
            summary: None,
            version: 0,
            last_activity: Utc::now(),
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    /// Create with a custom history bound
    #[must_use]
    pub fn with_max_history(id: impl Into<String>, max_history: usize) -> Self {
        Self {
            max_history: max_history.max(2),
            ..Self::new(id)
        }
    }

    /// Record a user message
    pub fn add_user_message(&mut self, text: impl Into<String>) {
        self.push_entry(Role::User, text.into());
    }

    /// Record an assistant message
    pub fn add_assistant_message(&mut self, text: impl Into<String>) {
        self.push_entry(Role::Assistant, text.into());
    }

    /// Number of retained history entries
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.history.len()
    }

    /// Read a context value
    #[must_use]
    pub fn context_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.get(key)
    }

    /// Bump the activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    fn push_entry(&mut self, role: Role, text: String) {
        self.history.push(HistoryEntry {
            role,
            text,
            at: Utc::now(),
        });
        self.last_activity = Utc::now();
        self.fold_if_needed();
    }

    /// Fold the oldest half of the history into the summary once the bound
    /// is exceeded. The fold is deterministic: entry count plus clipped
    /// text, no model involvement.
    fn fold_if_needed(&mut self) {
        if self.history.len() <= self.max_history {
            return;
        }
        let evict = self.history.len() - self.max_history / 2;
        let evicted: Vec<HistoryEntry> = self.history.drain(..evict).collect();

        let mut folded = String::new();
        for entry in &evicted {
            if !folded.is_empty() {
                folded.push_str("; ");
            }
            folded.push_str(clip(&entry.text, 40).as_str());
            if folded.len() > SUMMARY_CLIP {
                break;
            }
        }

        let prior = self.summary.as_deref().map(summary_count).unwrap_or(0);

        self.summary = Some(clip(
            &format!("{} earlier messages: {}", prior + evicted.len(), folded),
            SUMMARY_CLIP + 64,
        ));
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max).collect();
        format!("{}…", clipped)
    }
}

fn summary_count(summary: &str) -> usize {
    summary
        .split_whitespace()
        .next()
        .and_then(|w| w.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_conversation() {
        let conv = Conversation::new("c1");
        assert_eq!(conv.id, "c1");
        assert_eq!(conv.stage, WorkflowStage::Idle);
        assert_eq!(conv.version, 0);
        assert!(conv.history.is_empty());
        assert!(conv.summary.is_none());
    }

    #[test]
    fn test_history_recording() {
        let mut conv = Conversation::new("c1");
        conv.add_user_message("hello");
        conv.add_assistant_message("hi there");

        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.history[0].role, Role::User);
        assert_eq!(conv.history[1].role, Role::Assistant);
    }

    #[test]
    fn test_history_folds_into_summary() {
        let mut conv = Conversation::with_max_history("c1", 10);
        for i in 0..25 {
            conv.add_user_message(format!("message number {}", i));
        }

        assert!(conv.history.len() <= 10);
        let summary = conv.summary.as_ref().expect("summary should exist");
        assert!(summary.contains("earlier messages"));
        // The most recent messages are always retained verbatim
        assert!(conv.history.iter().any(|e| e.text.contains("24")));
    }

    #[test]
    fn test_summary_accumulates_count() {
        let mut conv = Conversation::with_max_history("c1", 4);
        for i in 0..20 {
            conv.add_user_message(format!("m{}", i));
        }
        let summary = conv.summary.clone().unwrap();
        let count: usize = summary.split_whitespace().next().unwrap().parse().unwrap();
        assert_eq!(count + conv.history.len(), 20);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut conv = Conversation::new("c1");
        conv.stage = WorkflowStage::AwaitingAgeGroup;
        conv.context
            .insert("facility_tier".to_string(), serde_json::json!("tertiary"));
        conv.version = 7;

        let json = serde_json::to_string(&conv).unwrap();
        let back: Conversation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.stage, WorkflowStage::AwaitingAgeGroup);
        assert_eq!(back.version, 7);
        assert_eq!(
            back.context_value("facility_tier"),
            Some(&serde_json::json!("tertiary"))
        );
    }
}

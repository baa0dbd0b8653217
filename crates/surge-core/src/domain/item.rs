//! Persisted domain items: status and the pipeline-level retry counter.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ItemId;

/// Name of a pipeline stage (e.g. `"classify"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(String);

impl Stage {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Status of an item as stored on its row.
///
/// State transitions:
/// - Eligible(stage) -> Completed(stage)
/// - Eligible(stage) -> Eligible(stage) (recycled, attempts + 1)
/// - Eligible(stage) -> TerminalFailure (attempts reached max_attempts)
///
/// A stage run selects `Eligible(stage)` rows; there is no separate retry
/// queue, the status flag is the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "status", content = "stage", rename_all = "snake_case")]
pub enum ItemStatus {
    Eligible(Stage),
    Completed(Stage),
    TerminalFailure,
}

impl ItemStatus {
    /// No further automatic transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::TerminalFailure)
    }

    pub fn is_eligible_for(&self, stage: &Stage) -> bool {
        matches!(self, ItemStatus::Eligible(s) if s == stage)
    }
}

/// Pipeline-level retry counter, persisted on the owning item.
///
/// `attempts` never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCounter {
    pub attempts: u32,
    pub max_attempts: u32,
}

impl RetryCounter {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Counter after recording one more failed attempt.
    pub fn incremented(self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self
        }
    }
}

/// Row of the relational store that a stage run works on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedItem {
    pub item_id: ItemId,
    pub payload: serde_json::Value,
    pub status: ItemStatus,
    pub retry: RetryCounter,

    /// Response of the last successful stage call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Error detail of the last failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    pub updated_at: DateTime<Utc>,
}

impl TrackedItem {
    pub fn new(
        item_id: ItemId,
        stage: Stage,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            payload,
            status: ItemStatus::Eligible(stage),
            retry: RetryCounter::new(max_attempts),
            result: None,
            last_error: None,
            updated_at: now,
        }
    }
}

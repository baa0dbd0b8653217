//! Outcome model: the record emitted for every completed dispatch unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::CorrelationId;

/// What the external service answered (or why it never did).
///
/// Serialized as `{"kind": "response", "value": ...}` or
/// `{"kind": "error", "value": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutcomeBody {
    Response(serde_json::Value),
    Error(String),
}

/// Result record for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub correlation_id: CorrelationId,
    pub succeeded: bool,
    pub body: OutcomeBody,
    pub completed_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn success(
        correlation_id: CorrelationId,
        response: serde_json::Value,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            correlation_id,
            succeeded: true,
            body: OutcomeBody::Response(response),
            completed_at,
        }
    }

    pub fn response(&self) -> Option<&serde_json::Value> {
        match &self.body {
            OutcomeBody::Response(value) => Some(value),
            OutcomeBody::Error(_) => None,
        }
    }
}

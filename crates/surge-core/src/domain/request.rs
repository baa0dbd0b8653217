//! Request descriptors: the immutable unit of work handed to the dispatcher.

use serde::{Deserialize, Serialize};

use super::ids::CorrelationId;

/// One unit of work for the external service.
///
/// Descriptors are read from the input batch and never mutated; a descriptor
/// that exhausts its local retries is routed to the failure sink exactly as
/// it was received. The `payload` is opaque here and only interpreted by the
/// external service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub correlation_id: CorrelationId,

    /// Identifier of the domain record this request was built from.
    pub external_id: String,

    pub payload: serde_json::Value,
}

impl RequestDescriptor {
    pub fn new(
        correlation_id: CorrelationId,
        external_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            correlation_id,
            external_id: external_id.into(),
            payload,
        }
    }
}

/// Shape of one line of a JSON-lines input artifact.
///
/// `correlation_id` is optional on disk; a fresh one is assigned when absent.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestLine {
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
    pub external_id: String,
    pub payload: serde_json::Value,
}

impl RequestLine {
    pub fn into_descriptor(self, fallback: impl FnOnce() -> CorrelationId) -> RequestDescriptor {
        RequestDescriptor {
            correlation_id: self.correlation_id.unwrap_or_else(fallback),
            external_id: self.external_id,
            payload: self.payload,
        }
    }
}

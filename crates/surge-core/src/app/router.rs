//! Outcome router: splits finished dispatch units into a success sink and a
//! failure sink.
//!
//! Units push into the router concurrently; the dispatcher drains it once
//! every unit has finished. Order within a sink follows completion order,
//! not input order.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::domain::{CorrelationId, OutcomeRecord, RequestDescriptor};

/// Terminal result of one dispatch unit.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitResult {
    Succeeded {
        record: OutcomeRecord,
        attempts: u32,
    },
    /// The descriptor exactly as admitted.
    Failed {
        descriptor: RequestDescriptor,
        reason: String,
        attempts: u32,
    },
}

impl UnitResult {
    pub fn attempts(&self) -> u32 {
        match self {
            UnitResult::Succeeded { attempts, .. } | UnitResult::Failed { attempts, .. } => {
                *attempts
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub admitted: usize,
    pub succeeded: usize,
    pub failed: usize,

    /// Units that needed more than one attempt, whichever sink they ended in.
    pub retried: usize,

    pub backpressure_events: u64,
    pub final_limit: usize,
}

/// What `Dispatch` hands back.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub successes: Vec<OutcomeRecord>,
    pub failures: Vec<RequestDescriptor>,

    /// Last error of each failed unit.
    pub failure_reasons: HashMap<CorrelationId, String>,

    pub stats: DispatchStats,
}

#[derive(Debug, Default)]
struct Sinks {
    successes: Vec<OutcomeRecord>,
    failures: Vec<RequestDescriptor>,
    reasons: HashMap<CorrelationId, String>,
    retried: usize,
}

#[derive(Debug, Default)]
pub struct OutcomeRouter {
    sinks: Mutex<Sinks>,
}

impl OutcomeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, result: UnitResult) {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        if result.attempts() > 1 {
            sinks.retried += 1;
        }
        match result {
            UnitResult::Succeeded { record, .. } => sinks.successes.push(record),
            UnitResult::Failed {
                descriptor, reason, ..
            } => {
                sinks.reasons.insert(descriptor.correlation_id, reason);
                sinks.failures.push(descriptor);
            }
        }
    }

    /// Number of units routed so far.
    pub fn routed(&self) -> usize {
        let sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        sinks.successes.len() + sinks.failures.len()
    }

    /// Drain both sinks. `admitted`, `backpressure_events` and `final_limit`
    /// are filled in by the dispatcher.
    pub fn drain(&self) -> DispatchReport {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        let sinks = std::mem::take(&mut *sinks);
        DispatchReport {
            stats: DispatchStats {
                succeeded: sinks.successes.len(),
                failed: sinks.failures.len(),
                retried: sinks.retried,
                ..DispatchStats::default()
            },
            successes: sinks.successes,
            failures: sinks.failures,
            failure_reasons: sinks.reasons,
        }
    }
}

//! Pipeline-level retry escalation.
//!
//! Every failure of an item bumps its persisted attempt counter. Below the
//! policy maximum the item is put back into `Eligible(stage)`, where the next
//! scan of that stage picks it up again; at the maximum it becomes a
//! `TerminalFailure` and is never selected again.
//!
//! [`EscalationPolicy::decide`] is the pure transition; [`RetryEscalation`]
//! reads and writes the rows around it.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::config::EscalationPolicy;
use crate::domain::{ItemId, ItemStatus, RetryCounter, Stage};
use crate::ports::{EntityStore, OutcomeRow, StoreError};

/// Next state of a failed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Back to `Eligible(stage)` for the next scan.
    Recycled { stage: Stage, retry: RetryCounter },

    /// Retry budget exhausted.
    Terminal { retry: RetryCounter },
}

impl Escalation {
    pub fn status(&self) -> ItemStatus {
        match self {
            Escalation::Recycled { stage, .. } => ItemStatus::Eligible(stage.clone()),
            Escalation::Terminal { .. } => ItemStatus::TerminalFailure,
        }
    }

    pub fn retry(&self) -> RetryCounter {
        match self {
            Escalation::Recycled { retry, .. } | Escalation::Terminal { retry } => *retry,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Escalation::Terminal { .. })
    }
}

impl EscalationPolicy {
    /// Transition for one more failure of an item currently in `status`.
    ///
    /// `None` for an item that is already terminal: its counter is frozen.
    /// The policy maximum applies uniformly, whatever maximum the row was
    /// created with.
    pub fn decide(&self, status: &ItemStatus, retry: RetryCounter) -> Option<Escalation> {
        let stage = match status {
            ItemStatus::Eligible(stage) | ItemStatus::Completed(stage) => stage.clone(),
            ItemStatus::TerminalFailure => return None,
        };

        let retry = RetryCounter {
            max_attempts: self.max_attempts,
            ..retry
        }
        .incremented();

        Some(if retry.is_exhausted() {
            Escalation::Terminal { retry }
        } else {
            Escalation::Recycled { stage, retry }
        })
    }
}

/// Counts of one bulk escalation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EscalationReport {
    pub recycled: usize,
    pub terminal: usize,

    /// Items that were already terminal and were left untouched.
    pub frozen: usize,
}

/// A bulk escalation stopped on a store failure.
#[derive(Debug, Error)]
#[error("escalation failed after {applied} rows applied: {source}")]
pub struct EscalationError {
    /// Rows committed by earlier chunks of the same call.
    pub applied: usize,
    #[source]
    pub source: StoreError,
}

impl EscalationError {
    fn at(applied: usize) -> impl FnOnce(StoreError) -> Self {
        move |source| Self { applied, source }
    }
}

pub struct RetryEscalation {
    store: Arc<dyn EntityStore>,
    policy: EscalationPolicy,
    chunk_size: usize,
}

impl RetryEscalation {
    pub fn new(store: Arc<dyn EntityStore>, policy: EscalationPolicy, chunk_size: usize) -> Self {
        Self {
            store,
            policy,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Record one failure of `item_id` and return its new status.
    pub async fn on_item_failure(
        &self,
        item_id: ItemId,
        error: &str,
    ) -> Result<ItemStatus, StoreError> {
        let rows = self.store.bulk_read(&[item_id]).await?;
        let item = rows.get(&item_id).ok_or(StoreError::NotFound(item_id))?;

        let Some(escalation) = self.policy.decide(&item.status, item.retry) else {
            debug!(%item_id, "failure on terminal item ignored");
            return Ok(ItemStatus::TerminalFailure);
        };

        let status = escalation.status();
        self.store
            .bulk_apply_outcomes(&[OutcomeRow::failed(
                item_id,
                status.clone(),
                escalation.retry(),
                error,
            )])
            .await?;
        log_escalation(item_id, &escalation, error);
        Ok(status)
    }

    /// Record one failure for each `(item_id, error)` pair.
    ///
    /// Rows are read and written in chunks of `chunk_size`. A failed chunk
    /// aborts the call; earlier chunks stay applied and their counters are
    /// already bumped, so the caller must treat the run as failed.
    pub async fn on_failures(
        &self,
        failures: &[(ItemId, String)],
    ) -> Result<EscalationReport, EscalationError> {
        let mut report = EscalationReport::default();
        let mut seen = HashSet::new();
        let failures: Vec<_> = failures
            .iter()
            .filter(|(id, _)| seen.insert(*id))
            .collect();

        let mut applied = 0;
        for chunk in failures.chunks(self.chunk_size) {
            let ids: Vec<ItemId> = chunk.iter().map(|(id, _)| *id).collect();
            let items = self
                .store
                .bulk_read(&ids)
                .await
                .map_err(EscalationError::at(applied))?;

            let mut planned = Vec::with_capacity(chunk.len());
            for (item_id, error) in chunk {
                let item = items
                    .get(item_id)
                    .ok_or(StoreError::NotFound(*item_id))
                    .map_err(EscalationError::at(applied))?;
                match self.policy.decide(&item.status, item.retry) {
                    Some(escalation) => planned.push((*item_id, escalation, error.as_str())),
                    None => report.frozen += 1,
                }
            }
            if planned.is_empty() {
                continue;
            }

            let rows: Vec<OutcomeRow> = planned
                .iter()
                .map(|(id, e, error)| OutcomeRow::failed(*id, e.status(), e.retry(), *error))
                .collect();
            self.store
                .bulk_apply_outcomes(&rows)
                .await
                .map_err(EscalationError::at(applied))?;
            applied += rows.len();

            for (id, escalation, error) in &planned {
                log_escalation(*id, escalation, error);
                if escalation.is_terminal() {
                    report.terminal += 1;
                } else {
                    report.recycled += 1;
                }
            }
        }
        Ok(report)
    }
}

fn log_escalation(item_id: ItemId, escalation: &Escalation, error: &str) {
    let retry = escalation.retry();
    match escalation {
        Escalation::Terminal { .. } => warn!(
            %item_id,
            attempts = retry.attempts,
            max_attempts = retry.max_attempts,
            error,
            "item terminally failed"
        ),
        Escalation::Recycled { stage, .. } => debug!(
            %item_id,
            %stage,
            attempts = retry.attempts,
            max_attempts = retry.max_attempts,
            "item recycled for retry"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TrackedItem;
    use crate::impls::InMemoryEntityStore;
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;

    fn classify() -> Stage {
        Stage::new("classify")
    }

    fn policy() -> EscalationPolicy {
        EscalationPolicy { max_attempts: 3 }
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, false)]
    #[case(2, true)]
    #[case(5, true)]
    fn decides_terminal_at_max(#[case] attempts: u32, #[case] terminal: bool) {
        let retry = RetryCounter {
            attempts,
            max_attempts: 3,
        };
        let next = policy()
            .decide(&ItemStatus::Eligible(classify()), retry)
            .unwrap();
        assert_eq!(next.is_terminal(), terminal);
        assert_eq!(next.retry().attempts, attempts + 1);
    }

    #[test]
    fn terminal_items_are_frozen() {
        let retry = RetryCounter {
            attempts: 3,
            max_attempts: 3,
        };
        assert_eq!(policy().decide(&ItemStatus::TerminalFailure, retry), None);
    }

    #[test]
    fn policy_maximum_overrides_row_maximum() {
        let retry = RetryCounter {
            attempts: 1,
            max_attempts: 10,
        };
        let next = policy()
            .decide(&ItemStatus::Eligible(classify()), retry)
            .unwrap();
        assert_eq!(next.retry().max_attempts, 3);
        assert!(!next.is_terminal());
    }

    async fn store_with(n: usize) -> (Arc<InMemoryEntityStore>, Vec<ItemId>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let items: Vec<_> = (0..n)
            .map(|i| TrackedItem::new(ItemId::generate(), classify(), json!({"i": i}), 3, Utc::now()))
            .collect();
        let ids = items.iter().map(|i| i.item_id).collect();
        store.insert(items).await.unwrap();
        (store, ids)
    }

    #[tokio::test]
    async fn third_failure_is_terminal() {
        let (store, ids) = store_with(1).await;
        let escalation = RetryEscalation::new(store.clone(), policy(), 500);
        let id = ids[0];

        for expected in [1, 2] {
            let status = escalation.on_item_failure(id, "HTTP 503").await.unwrap();
            assert_eq!(status, ItemStatus::Eligible(classify()));
            assert_eq!(store.get(id).await.unwrap().retry.attempts, expected);
        }

        let status = escalation.on_item_failure(id, "HTTP 503").await.unwrap();
        assert_eq!(status, ItemStatus::TerminalFailure);

        let row = store.get(id).await.unwrap();
        assert_eq!(row.retry.attempts, 3);
        assert_eq!(row.last_error.as_deref(), Some("HTTP 503"));

        // never re-selected, never re-incremented
        let eligible = store
            .select_by_status(&ItemStatus::Eligible(classify()), None)
            .await
            .unwrap();
        assert!(eligible.is_empty());
        escalation.on_item_failure(id, "again").await.unwrap();
        assert_eq!(store.get(id).await.unwrap().retry.attempts, 3);
    }

    #[tokio::test]
    async fn unknown_item_is_not_found() {
        let (store, _) = store_with(0).await;
        let escalation = RetryEscalation::new(store, policy(), 500);
        let err = escalation
            .on_item_failure(ItemId::generate(), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn bulk_failures_are_chunked_and_counted() {
        let (store, ids) = store_with(7).await;
        // two items already at attempts = 2
        for id in &ids[..2] {
            RetryEscalation::new(store.clone(), policy(), 500)
                .on_failures(&[(*id, "e".into()), (*id, "dup".into())])
                .await
                .unwrap();
            RetryEscalation::new(store.clone(), policy(), 500)
                .on_item_failure(*id, "e")
                .await
                .unwrap();
        }

        let failures: Vec<_> = ids.iter().map(|id| (*id, "HTTP 500".to_string())).collect();
        let report = RetryEscalation::new(store.clone(), policy(), 3)
            .on_failures(&failures)
            .await
            .unwrap();

        assert_eq!(
            report,
            EscalationReport {
                recycled: 5,
                terminal: 2,
                frozen: 0,
            }
        );
        assert_eq!(store.apply_calls().await, 3 + 2 * 2);
        // 2 * (1 + 1) setup reads, then 7 failures read 3 at a time
        assert_eq!(store.read_calls().await, 4 + 3);
    }

    #[tokio::test]
    async fn failed_chunk_reports_rows_already_applied() {
        let (store, ids) = store_with(7).await;
        store.fail_apply_call(1).await;
        let failures: Vec<_> = ids.iter().map(|id| (*id, "HTTP 500".to_string())).collect();

        let err = RetryEscalation::new(store.clone(), policy(), 3)
            .on_failures(&failures)
            .await
            .unwrap_err();

        assert_eq!(err.applied, 3);
        assert!(matches!(err.source, StoreError::Unavailable(_)));
        let bumped = store
            .snapshot()
            .await
            .into_iter()
            .filter(|row| row.retry.attempts == 1)
            .count();
        assert_eq!(bumped, 3);
    }
}

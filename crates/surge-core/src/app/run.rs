//! Batch run: one pass of a pipeline stage over the entity store.
//!
//! 1. select `Eligible(stage)` rows, one chunk-sized page per transaction
//! 2. dispatch them as one batch (fresh concurrency controller per run)
//! 3. apply successes as `Completed(stage)` in chunked transactions
//! 4. run failures through retry escalation
//!
//! A replay over the same store selects nothing once every item reached
//! `Completed(stage)` or `TerminalFailure`, so it is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use super::config::{ConfigError, SurgeConfig};
use super::dispatcher::Dispatcher;
use super::escalation::RetryEscalation;
use crate::domain::{
    CorrelationId, ItemId, ItemStatus, RequestDescriptor, RunId, Stage, TrackedItem,
};
use crate::ports::{Clock, EntityStore, ExternalService, IdGenerator, OutcomeRow, StoreError};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A store transaction failed. Chunks applied before it stay applied.
    #[error("store failure after {applied} rows applied: {source}")]
    Store {
        applied: usize,
        #[source]
        source: StoreError,
    },
}

/// Counts reported by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub stage: Stage,
    pub selected: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
    pub recycled: usize,
    pub terminal: usize,
    pub final_limit: usize,
}

impl RunReport {
    fn empty(run_id: RunId, stage: Stage) -> Self {
        Self {
            run_id,
            stage,
            selected: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            recycled: 0,
            terminal: 0,
            final_limit: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

pub struct BatchRun {
    store: Arc<dyn EntityStore>,
    ids: Arc<dyn IdGenerator>,
    config: SurgeConfig,
    dispatcher: Dispatcher,
    escalation: RetryEscalation,
}

impl BatchRun {
    pub fn new(
        store: Arc<dyn EntityStore>,
        service: Arc<dyn ExternalService>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: SurgeConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let dispatcher = Dispatcher::with_clock(service, clock, &config.dispatch)?;
        let escalation =
            RetryEscalation::new(Arc::clone(&store), config.escalation, config.store.chunk_size);
        Ok(Self {
            store,
            ids,
            config,
            dispatcher,
            escalation,
        })
    }

    /// Run `stage` over at most `limit` eligible items.
    pub async fn run(&self, stage: &Stage, limit: Option<usize>) -> Result<RunReport, RunError> {
        let run_id = self.ids.run_id();
        let mut report = RunReport::empty(run_id, stage.clone());

        let items = self.select_eligible(stage, limit).await?;
        report.selected = items.len();
        if items.is_empty() {
            info!(%run_id, %stage, "no eligible items");
            return Ok(report);
        }
        info!(%run_id, %stage, selected = items.len(), "run started");

        let mut owners: HashMap<CorrelationId, ItemId> = HashMap::with_capacity(items.len());
        let descriptors: Vec<RequestDescriptor> = items
            .into_iter()
            .map(|item| {
                let correlation_id = self.ids.correlation_id();
                owners.insert(correlation_id, item.item_id);
                RequestDescriptor::new(correlation_id, item.item_id.to_string(), item.payload)
            })
            .collect();

        let dispatched = self.dispatcher.dispatch_all(descriptors).await;
        report.succeeded = dispatched.stats.succeeded;
        report.failed = dispatched.stats.failed;
        report.retried = dispatched.stats.retried;
        report.final_limit = dispatched.stats.final_limit;

        let completed: Vec<OutcomeRow> = dispatched
            .successes
            .iter()
            .filter_map(|record| {
                let item_id = *owners.get(&record.correlation_id)?;
                let response = record.response()?.clone();
                Some(OutcomeRow::completed(
                    item_id,
                    ItemStatus::Completed(stage.clone()),
                    response,
                ))
            })
            .collect();
        let applied = self.apply_chunked(run_id, &completed).await?;

        let failures: Vec<(ItemId, String)> = dispatched
            .failures
            .iter()
            .filter_map(|descriptor| {
                let item_id = *owners.get(&descriptor.correlation_id)?;
                let reason = dispatched
                    .failure_reasons
                    .get(&descriptor.correlation_id)
                    .cloned()
                    .unwrap_or_default();
                Some((item_id, reason))
            })
            .collect();
        let escalated = self
            .escalation
            .on_failures(&failures)
            .await
            .map_err(|e| {
                error!(%run_id, applied = applied + e.applied, error = %e.source, "escalation failed");
                RunError::Store {
                    applied: applied + e.applied,
                    source: e.source,
                }
            })?;
        report.recycled = escalated.recycled;
        report.terminal = escalated.terminal;

        info!(
            %run_id,
            %stage,
            succeeded = report.succeeded,
            failed = report.failed,
            retried = report.retried,
            recycled = report.recycled,
            terminal = report.terminal,
            "run finished"
        );
        Ok(report)
    }

    /// Eligible rows in id order, paged by `chunk_size`.
    async fn select_eligible(
        &self,
        stage: &Stage,
        limit: Option<usize>,
    ) -> Result<Vec<TrackedItem>, RunError> {
        let cap = limit.unwrap_or(usize::MAX);
        let mut items = Vec::new();
        let mut after = None;
        while items.len() < cap {
            let page_size = self.config.store.chunk_size.min(cap - items.len());
            let page = self
                .store
                .select_eligible(stage, after, page_size)
                .await
                .map_err(|source| RunError::Store { applied: 0, source })?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.item_id);
            let full = page.len() == page_size;
            items.extend(page);
            if !full {
                break;
            }
        }
        Ok(items)
    }

    /// Returns the number of rows applied.
    async fn apply_chunked(&self, run_id: RunId, rows: &[OutcomeRow]) -> Result<usize, RunError> {
        let mut applied = 0;
        for chunk in rows.chunks(self.config.store.chunk_size) {
            if let Err(source) = self.store.bulk_apply_outcomes(chunk).await {
                error!(
                    %run_id,
                    applied,
                    chunk = chunk.len(),
                    error = %source,
                    "outcome chunk failed; run aborted"
                );
                return Err(RunError::Store { applied, source });
            }
            applied += chunk.len();
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceError;
    use crate::impls::InMemoryEntityStore;
    use crate::ports::{SystemClock, UlidGenerator};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value, json};

    /// Fails with a transient error whenever the payload says so.
    struct Flaky;

    #[async_trait]
    impl ExternalService for Flaky {
        async fn call(&self, payload: &Value) -> Result<Value, ServiceError> {
            if payload["fail"] == true {
                Err(ServiceError::Transient("HTTP 503".into()))
            } else {
                Ok(json!({"label": payload["i"]}))
            }
        }
    }

    fn config(chunk_size: usize) -> SurgeConfig {
        let mut config = SurgeConfig::default();
        config.dispatch.min_concurrency = 1;
        config.dispatch.initial_concurrency = 8;
        config.dispatch.max_concurrency = 16;
        config.dispatch.retry_base_delay_ms = 0;
        config.store.chunk_size = chunk_size;
        config
    }

    fn stage() -> Stage {
        Stage::new("classify")
    }

    async fn seeded(n: usize, failing: usize) -> (Arc<InMemoryEntityStore>, Vec<ItemId>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let items: Vec<_> = (0..n)
            .map(|i| {
                let payload = json!({"i": i, "fail": i < failing});
                TrackedItem::new(ItemId::generate(), stage(), payload, 3, Utc::now())
            })
            .collect();
        let ids = items.iter().map(|i| i.item_id).collect();
        store.insert(items).await.unwrap();
        (store, ids)
    }

    fn runner(store: Arc<InMemoryEntityStore>, chunk_size: usize) -> BatchRun {
        BatchRun::new(
            store,
            Arc::new(Flaky),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
            config(chunk_size),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn completes_successes_and_recycles_failures() {
        let (store, ids) = seeded(10, 2).await;
        let report = runner(store.clone(), 4).run(&stage(), None).await.unwrap();

        assert_eq!(report.selected, 10);
        assert_eq!(report.succeeded, 8);
        assert_eq!(report.failed, 2);
        assert_eq!(report.retried, 2);
        assert_eq!(report.recycled, 2);
        assert_eq!(report.terminal, 0);
        assert!(!report.is_clean());

        let ok = store.get(ids[5]).await.unwrap();
        assert_eq!(ok.status, ItemStatus::Completed(stage()));
        assert_eq!(ok.result, Some(json!({"label": 5})));

        let failed = store.get(ids[0]).await.unwrap();
        assert_eq!(failed.status, ItemStatus::Eligible(stage()));
        assert_eq!(failed.retry.attempts, 1);
        assert!(failed.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn repeated_failures_end_terminal_and_replay_is_a_no_op() {
        let (store, ids) = seeded(5, 1).await;
        let run = runner(store.clone(), 500);

        let first = run.run(&stage(), None).await.unwrap();
        assert_eq!((first.selected, first.recycled), (5, 1));

        let second = run.run(&stage(), None).await.unwrap();
        assert_eq!((second.selected, second.recycled, second.terminal), (1, 1, 0));

        let third = run.run(&stage(), None).await.unwrap();
        assert_eq!((third.selected, third.terminal), (1, 1));
        assert_eq!(store.get(ids[0]).await.unwrap().status, ItemStatus::TerminalFailure);

        let before = store.snapshot().await;
        let replay = run.run(&stage(), None).await.unwrap();
        assert_eq!(replay.selected, 0);
        assert!(replay.is_clean());
        assert_eq!(store.snapshot().await, before);
    }

    #[tokio::test]
    async fn limit_bounds_the_selection() {
        let (store, _) = seeded(10, 0).await;
        let report = runner(store, 500).run(&stage(), Some(3)).await.unwrap();
        assert_eq!(report.selected, 3);
        assert_eq!(report.succeeded, 3);
    }

    #[tokio::test]
    async fn failed_chunk_aborts_the_run() {
        let (store, _) = seeded(10, 0).await;
        store.fail_apply_call(1).await;

        let err = runner(store.clone(), 4).run(&stage(), None).await.unwrap_err();
        match err {
            RunError::Store { applied, .. } => assert_eq!(applied, 4),
            other => panic!("expected store error, got {other:?}"),
        }

        // first chunk committed, the failed chunk left nothing behind
        let completed = store
            .select_by_status(&ItemStatus::Completed(stage()), None)
            .await
            .unwrap();
        assert_eq!(completed.len(), 4);
    }

    #[tokio::test]
    async fn reads_are_chunked() {
        let (store, _) = seeded(10, 2).await;
        let report = runner(store.clone(), 4).run(&stage(), None).await.unwrap();
        assert_eq!(report.selected, 10);
        // pages of 4, 4 and 2, then one read for the 2 failures
        assert_eq!(store.read_calls().await, 3 + 1);
        // successes 4 + 4, failures 2
        assert_eq!(store.apply_calls().await, 3);
    }

    #[tokio::test]
    async fn failed_escalation_counts_every_committed_row() {
        let (store, _) = seeded(10, 6).await;
        // call 0 applies the 4 successes, call 1 the first 4 failures
        store.fail_apply_call(2).await;

        let err = runner(store.clone(), 4).run(&stage(), None).await.unwrap_err();
        match err {
            RunError::Store { applied, .. } => assert_eq!(applied, 8),
            other => panic!("expected store error, got {other:?}"),
        }
        let recycled = store
            .snapshot()
            .await
            .into_iter()
            .filter(|row| row.retry.attempts == 1)
            .count();
        assert_eq!(recycled, 4);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut bad = config(500);
        bad.escalation.max_attempts = 0;
        let result = BatchRun::new(
            Arc::new(InMemoryEntityStore::new()),
            Arc::new(Flaky),
            Arc::new(UlidGenerator::new(SystemClock)),
            Arc::new(SystemClock),
            bad,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }
}

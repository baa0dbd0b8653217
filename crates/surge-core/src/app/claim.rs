//! Claim coordinator: single-owner processing of trigger artifacts shared by
//! competing workers.
//!
//! Per resource key:
//!
//! ```text
//! Untouched --copy+delete--> Claimed --process ok--> Completed
//!     |                         |
//!     | source gone             +--process err--> Failed   (moved to review)
//!     v                         |
//!  LostRace                     +--move err-----> Orphaned (left in processing)
//! ```
//!
//! The claim is a copy of the trigger object into this worker's private
//! processing area followed by a delete of the trigger object. Whoever's
//! delete succeeds owns the artifact; a worker whose copy or delete reports
//! `NotFound` lost the race and removes its own copy again.
//!
//! Copy-then-delete is not atomic: a worker that dies between the two steps
//! leaves the artifact at both the trigger and processing locations, and it
//! will be processed again by the next sweep. Consumers must be idempotent.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::config::ClaimConfig;
use super::dispatcher::DispatchError;
use crate::ports::{BlobError, BlobStore};

/// Lifecycle of one resource key inside one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    Untouched,
    Claimed,
    Completed,
    Failed,
    /// Failed and stranded in the processing area.
    Orphaned,
    LostRace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimResult {
    /// Another worker owns the artifact. Not an error.
    Skipped,

    /// Processed and removed.
    Completed,

    /// Processing failed; the artifact was preserved at `review_key`
    /// (or never left the trigger location when the claim itself failed).
    Failed { reason: String },

    /// Processing failed and the artifact could not be moved to review.
    /// It is still at `processing_key` and needs an operator.
    Orphaned {
        reason: String,
        processing_key: String,
        move_error: String,
    },
}

impl ClaimResult {
    pub fn state(&self) -> ClaimState {
        match self {
            ClaimResult::Skipped => ClaimState::LostRace,
            ClaimResult::Completed => ClaimState::Completed,
            ClaimResult::Failed { .. } => ClaimState::Failed,
            ClaimResult::Orphaned { .. } => ClaimState::Orphaned,
        }
    }
}

/// Error returned by a [`ClaimProcessor`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("malformed artifact: {0}")]
    Malformed(String),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    Other(String),
}

/// The private copy of a claimed artifact.
#[derive(Debug, Clone)]
pub struct ClaimedArtifact {
    /// Trigger key the artifact was claimed from.
    pub resource_key: String,

    /// `resource_key` relative to the trigger prefix.
    pub name: String,

    /// Key of this worker's private copy.
    pub processing_key: String,

    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ClaimProcessor: Send + Sync {
    async fn process(&self, artifact: &ClaimedArtifact) -> Result<(), ProcessError>;
}

/// Outcome of one sweep over the trigger prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub orphaned: Vec<String>,
}

impl SweepReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty() || !self.orphaned.is_empty()
    }
}

pub struct ClaimCoordinator {
    store: Arc<dyn BlobStore>,
    config: ClaimConfig,
    worker_id: String,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn BlobStore>, config: ClaimConfig, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            config,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Trigger key and name relative to the trigger prefix. A bare name is
    /// taken to live under the trigger prefix.
    fn locate<'a>(&self, resource_key: &'a str) -> (String, &'a str) {
        match resource_key.strip_prefix(self.config.trigger_prefix.as_str()) {
            Some(name) => (resource_key.to_string(), name),
            None => (
                format!("{}{}", self.config.trigger_prefix, resource_key),
                resource_key,
            ),
        }
    }

    fn processing_key(&self, name: &str) -> String {
        format!("{}{}/{}", self.config.processing_prefix, self.worker_id, name)
    }

    fn review_key(&self, name: &str) -> String {
        format!("{}{}", self.config.review_prefix, name)
    }

    pub async fn claim_and_process(
        &self,
        resource_key: &str,
        processor: &dyn ClaimProcessor,
    ) -> ClaimResult {
        let (source_key, name) = self.locate(resource_key);
        let processing_key = self.processing_key(name);

        match self.claim(&source_key, &processing_key).await {
            Ok(true) => {}
            Ok(false) => return ClaimResult::Skipped,
            Err(reason) => return ClaimResult::Failed { reason },
        }
        debug!(resource_key = %source_key, worker = %self.worker_id, "claimed");

        let processed = match self.store.get(&processing_key).await {
            Ok(bytes) => {
                let artifact = ClaimedArtifact {
                    resource_key: source_key.clone(),
                    name: name.to_string(),
                    processing_key: processing_key.clone(),
                    bytes,
                };
                processor.process(&artifact).await
            }
            Err(e) => Err(ProcessError::Blob(e)),
        };

        match processed {
            Ok(()) => {
                if let Err(e) = self.store.delete(&processing_key).await {
                    warn!(%processing_key, error = %e, "processed artifact could not be removed");
                }
                info!(resource_key = %source_key, worker = %self.worker_id, "artifact processed");
                ClaimResult::Completed
            }
            Err(e) => self.quarantine(&source_key, &processing_key, name, e).await,
        }
    }

    /// Copy the trigger object into the private area, then delete the
    /// trigger object. `Ok(false)` means another worker won.
    async fn claim(&self, source_key: &str, processing_key: &str) -> Result<bool, String> {
        match self.store.copy(source_key, processing_key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(
                    resource_key = %source_key,
                    worker = %self.worker_id,
                    "claim race lost: artifact already taken"
                );
                return Ok(false);
            }
            Err(e) => {
                error!(resource_key = %source_key, error = %e, "claim copy failed");
                return Err(format!("claim copy failed: {e}"));
            }
        }

        match self.store.delete(source_key).await {
            Ok(()) => Ok(true),
            Err(e) => {
                let lost = e.is_not_found();
                if let Err(cleanup) = self.store.delete(processing_key).await {
                    warn!(%processing_key, error = %cleanup, "could not remove copy of unowned artifact");
                }
                if lost {
                    info!(
                        resource_key = %source_key,
                        worker = %self.worker_id,
                        "claim race lost: trigger removed by another worker"
                    );
                    Ok(false)
                } else {
                    error!(resource_key = %source_key, error = %e, "claim delete failed");
                    Err(format!("claim delete failed: {e}"))
                }
            }
        }
    }

    async fn quarantine(
        &self,
        source_key: &str,
        processing_key: &str,
        name: &str,
        cause: ProcessError,
    ) -> ClaimResult {
        let reason = cause.to_string();
        let review_key = self.review_key(name);

        if let Err(e) = self.store.copy(processing_key, &review_key).await {
            error!(
                resource_key = %source_key,
                %processing_key,
                %reason,
                move_error = %e,
                "artifact orphaned: processing failed and review move failed"
            );
            return ClaimResult::Orphaned {
                reason,
                processing_key: processing_key.to_string(),
                move_error: e.to_string(),
            };
        }
        if let Err(e) = self.store.delete(processing_key).await {
            warn!(%processing_key, error = %e, "review copy made but processing copy remains");
        }

        warn!(
            resource_key = %source_key,
            %review_key,
            %reason,
            "artifact failed processing; moved to review"
        );
        ClaimResult::Failed { reason }
    }

    /// Claim and process every artifact currently under the trigger prefix.
    pub async fn sweep(&self, processor: &dyn ClaimProcessor) -> Result<SweepReport, BlobError> {
        let objects = self.store.list(&self.config.trigger_prefix).await?;
        info!(
            worker = %self.worker_id,
            pending = objects.len(),
            prefix = %self.config.trigger_prefix,
            "sweeping trigger prefix"
        );

        let mut report = SweepReport::default();
        for object in objects {
            let result = self.claim_and_process(&object.key, processor).await;
            debug!(resource_key = %object.key, state = ?result.state(), "artifact settled");
            match result {
                ClaimResult::Completed => report.completed.push(object.key),
                ClaimResult::Skipped => report.skipped.push(object.key),
                ClaimResult::Failed { reason } => report.failed.push((object.key, reason)),
                ClaimResult::Orphaned { .. } => report.orphaned.push(object.key),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryBlobStore;
    use crate::ports::ObjectMeta;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingProcessor {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl ClaimProcessor for CountingProcessor {
        async fn process(&self, artifact: &ClaimedArtifact) -> Result<(), ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(artifact.bytes, b"{}\n");
            tokio::task::yield_now().await;
            if self.fail {
                Err(ProcessError::Malformed("line 1".into()))
            } else {
                Ok(())
            }
        }
    }

    async fn store_with(key: &str) -> Arc<InMemoryBlobStore> {
        let store = Arc::new(InMemoryBlobStore::new());
        store.put(key, b"{}\n".to_vec()).await.unwrap();
        store
    }

    fn coordinator(store: Arc<dyn BlobStore>, worker: &str) -> ClaimCoordinator {
        ClaimCoordinator::new(store, ClaimConfig::default(), worker)
    }

    async fn keys(store: &InMemoryBlobStore, prefix: &str) -> Vec<String> {
        store.list(prefix).await.unwrap().into_iter().map(|m| m.key).collect()
    }

    #[tokio::test]
    async fn second_claimant_loses_the_race() {
        let store = store_with("incoming/batch_17.jsonl").await;
        let a = coordinator(store.clone(), "worker-a");
        let b = coordinator(store.clone(), "worker-b");
        let processor = CountingProcessor::ok();

        assert_eq!(
            a.claim_and_process("incoming/batch_17.jsonl", &processor).await,
            ClaimResult::Completed
        );
        assert_eq!(
            b.claim_and_process("incoming/batch_17.jsonl", &processor).await,
            ClaimResult::Skipped
        );

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimants_process_exactly_once() {
        for _ in 0..20 {
            let store = store_with("incoming/batch_17.jsonl").await;
            let processor = Arc::new(CountingProcessor::ok());

            let handles: Vec<_> = (0..8)
                .map(|n| {
                    let store: Arc<dyn BlobStore> = store.clone();
                    let processor = Arc::clone(&processor);
                    tokio::spawn(async move {
                        coordinator(store, &format!("worker-{n}"))
                            .claim_and_process("batch_17.jsonl", processor.as_ref())
                            .await
                    })
                })
                .collect();

            let mut results = Vec::new();
            for h in handles {
                results.push(h.await.unwrap());
            }

            assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
            assert_eq!(results.iter().filter(|r| **r == ClaimResult::Completed).count(), 1);
            assert_eq!(results.iter().filter(|r| **r == ClaimResult::Skipped).count(), 7);
            // losers leave nothing behind
            assert!(store.is_empty().await);
        }
    }

    /// Deletes the trigger object right after a copy, as a faster worker would.
    struct RacedStore {
        inner: InMemoryBlobStore,
    }

    #[async_trait]
    impl BlobStore for RacedStore {
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError> {
            self.inner.list(prefix).await
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
            self.inner.put(key, bytes).await
        }
        async fn copy(&self, src: &str, dst: &str) -> Result<(), BlobError> {
            self.inner.copy(src, dst).await?;
            self.inner.delete(src).await
        }
        async fn delete(&self, key: &str) -> Result<(), BlobError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn losing_the_delete_removes_own_copy() {
        let inner = InMemoryBlobStore::new();
        inner.put("incoming/a.jsonl", b"{}\n".to_vec()).await.unwrap();
        let store = Arc::new(RacedStore { inner });
        let processor = CountingProcessor::ok();

        let result = coordinator(store.clone(), "w1")
            .claim_and_process("incoming/a.jsonl", &processor)
            .await;

        assert_eq!(result, ClaimResult::Skipped);
        assert_eq!(result.state(), ClaimState::LostRace);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        assert!(store.inner.is_empty().await);
    }

    #[tokio::test]
    async fn failed_processing_moves_artifact_to_review() {
        let store = store_with("incoming/bad.jsonl").await;
        let processor = CountingProcessor::failing();

        let result = coordinator(store.clone(), "w1")
            .claim_and_process("incoming/bad.jsonl", &processor)
            .await;

        assert!(matches!(&result, ClaimResult::Failed { reason } if reason.contains("line 1")));
        assert_eq!(keys(&store, "review/").await, vec!["review/bad.jsonl"]);
        assert_eq!(store.get("review/bad.jsonl").await.unwrap(), b"{}\n");
        assert!(keys(&store, "processing/").await.is_empty());
        assert!(keys(&store, "incoming/").await.is_empty());
    }

    /// Refuses every write under `review/`.
    struct NoReviewStore {
        inner: InMemoryBlobStore,
    }

    #[async_trait]
    impl BlobStore for NoReviewStore {
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, BlobError> {
            self.inner.list(prefix).await
        }
        async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobError> {
            self.inner.put(key, bytes).await
        }
        async fn copy(&self, src: &str, dst: &str) -> Result<(), BlobError> {
            if dst.starts_with("review/") {
                return Err(BlobError::Io {
                    key: dst.to_string(),
                    source: std::io::Error::other("permission denied"),
                });
            }
            self.inner.copy(src, dst).await
        }
        async fn delete(&self, key: &str) -> Result<(), BlobError> {
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn failed_review_move_is_reported_as_orphaned() {
        let inner = InMemoryBlobStore::new();
        inner.put("incoming/bad.jsonl", b"{}\n".to_vec()).await.unwrap();
        let store = Arc::new(NoReviewStore { inner });

        let result = coordinator(store.clone(), "w1")
            .claim_and_process("incoming/bad.jsonl", &CountingProcessor::failing())
            .await;

        assert_eq!(result.state(), ClaimState::Orphaned);
        match result {
            ClaimResult::Orphaned {
                processing_key,
                move_error,
                ..
            } => {
                assert_eq!(processing_key, "processing/w1/bad.jsonl");
                assert!(move_error.contains("permission denied"));
            }
            other => panic!("expected Orphaned, got {other:?}"),
        }
        assert_eq!(
            keys(&store.inner, "processing/").await,
            vec!["processing/w1/bad.jsonl"]
        );
    }

    #[tokio::test]
    async fn sweep_reports_each_artifact() {
        let store = Arc::new(InMemoryBlobStore::new());
        store.put("incoming/a.jsonl", b"{}\n".to_vec()).await.unwrap();
        store.put("incoming/b.jsonl", b"{}\n".to_vec()).await.unwrap();
        store.put("elsewhere/c.jsonl", b"{}\n".to_vec()).await.unwrap();

        let report = coordinator(store.clone(), "w1")
            .sweep(&CountingProcessor::ok())
            .await
            .unwrap();

        assert_eq!(report.completed, vec!["incoming/a.jsonl", "incoming/b.jsonl"]);
        assert!(!report.has_failures());
        assert_eq!(keys(&store, "elsewhere/").await, vec!["elsewhere/c.jsonl"]);
    }

    #[tokio::test]
    async fn sweeping_twice_is_a_no_op() {
        let store = store_with("incoming/a.jsonl").await;
        let processor = CountingProcessor::ok();
        let c = coordinator(store.clone(), "w1");

        c.sweep(&processor).await.unwrap();
        let second = c.sweep(&processor).await.unwrap();

        assert_eq!(second, SweepReport::default());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }
}

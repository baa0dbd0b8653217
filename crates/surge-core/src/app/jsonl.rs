//! JSON-lines artifacts: parse a claimed artifact into descriptors, dispatch
//! them, and write the outcome artifacts back.
//!
//! For a claimed `incoming/<name>`:
//! - `results/<name>`: one [`OutcomeRecord`] per succeeded descriptor
//! - `failures/<name>`: one line per failed descriptor, in input-line shape
//!   plus an `error` field, so the file can be dropped back into the trigger
//!   prefix as-is
//!
//! A line that does not parse ends the batch: admission stops and the
//! artifact goes to review.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::claim::{ClaimProcessor, ClaimedArtifact, ProcessError};
use super::config::DispatchConfig;
use super::dispatcher::Dispatcher;
use super::router::DispatchReport;
use crate::domain::{OutcomeRecord, RequestDescriptor, RequestLine};
use crate::ports::{BlobStore, Clock, ExternalService, IdGenerator};

pub const RESULTS_PREFIX: &str = "results/";
pub const FAILURES_PREFIX: &str = "failures/";

/// Running totals over every artifact this processor handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JsonlTotals {
    pub artifacts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retried: usize,
}

#[derive(Serialize)]
struct FailureLine<'a> {
    #[serde(flatten)]
    descriptor: &'a RequestDescriptor,
    error: &'a str,
}

pub struct JsonlBatchProcessor {
    store: Arc<dyn BlobStore>,
    service: Arc<dyn ExternalService>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    totals: Mutex<JsonlTotals>,
}

impl JsonlBatchProcessor {
    pub fn new(
        store: Arc<dyn BlobStore>,
        service: Arc<dyn ExternalService>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            service,
            ids,
            clock,
            config,
            totals: Mutex::new(JsonlTotals::default()),
        }
    }

    pub fn totals(&self) -> JsonlTotals {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, report: &DispatchReport) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.artifacts += 1;
        totals.succeeded += report.stats.succeeded;
        totals.failed += report.stats.failed;
        totals.retried += report.stats.retried;
    }

    /// Writes `failures/<name>` first and `results/<name>` last, so a results
    /// file exists only for a fully written artifact.
    async fn write_results(&self, name: &str, report: &DispatchReport) -> Result<(), ProcessError> {
        let mut results = Vec::new();
        for record in &report.successes {
            append_line(&mut results, record)?;
        }
        let mut failures = Vec::new();
        for descriptor in &report.failures {
            let error = report
                .failure_reasons
                .get(&descriptor.correlation_id)
                .map(String::as_str)
                .unwrap_or_default();
            append_line(&mut failures, &FailureLine { descriptor, error })?;
        }

        let failures_key = format!("{FAILURES_PREFIX}{name}");
        let wrote_failures = !failures.is_empty();
        if wrote_failures {
            self.store.put(&failures_key, failures).await?;
        }
        if let Err(e) = self.store.put(&format!("{RESULTS_PREFIX}{name}"), results).await {
            if wrote_failures {
                self.discard(&failures_key).await;
            }
            return Err(e.into());
        }
        Ok(())
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(%key, error = %e, "partial outcome file left behind");
        }
    }
}

fn append_line<T: Serialize>(buf: &mut Vec<u8>, value: &T) -> Result<(), ProcessError> {
    serde_json::to_writer(&mut *buf, value)
        .map_err(|e| ProcessError::Other(format!("failed to encode outcome: {e}")))?;
    buf.push(b'\n');
    Ok(())
}

/// Descriptors of a JSON-lines artifact, in order. Blank lines are skipped;
/// the first bad line yields an error naming its line number.
pub fn parse_lines<'a>(
    text: &'a str,
    ids: &'a dyn IdGenerator,
) -> impl Iterator<Item = Result<RequestDescriptor, String>> + 'a {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(move |(n, line)| {
            serde_json::from_str::<RequestLine>(line)
                .map(|parsed| parsed.into_descriptor(|| ids.correlation_id()))
                .map_err(|e| format!("line {}: {e}", n + 1))
        })
}

#[async_trait]
impl ClaimProcessor for JsonlBatchProcessor {
    async fn process(&self, artifact: &ClaimedArtifact) -> Result<(), ProcessError> {
        let text = std::str::from_utf8(&artifact.bytes)
            .map_err(|e| ProcessError::Malformed(format!("not UTF-8: {e}")))?;

        let dispatcher = Dispatcher::with_clock(
            Arc::clone(&self.service),
            Arc::clone(&self.clock),
            &self.config,
        )
        .map_err(|e| ProcessError::Other(e.to_string()))?;

        let report = dispatcher
            .dispatch(parse_lines(text, self.ids.as_ref()))
            .await?;
        self.write_results(&artifact.name, &report).await?;
        self.record(&report);

        info!(
            resource_key = %artifact.resource_key,
            succeeded = report.stats.succeeded,
            failed = report.stats.failed,
            retried = report.stats.retried,
            "artifact dispatched"
        );
        Ok(())
    }
}

/// Parse an outcome artifact written by [`JsonlBatchProcessor`].
pub fn read_results(bytes: &[u8]) -> Result<Vec<OutcomeRecord>, serde_json::Error> {
    serde_json::Deserializer::from_slice(bytes)
        .into_iter::<OutcomeRecord>()
        .collect()
}

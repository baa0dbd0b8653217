//! EntityStore port: the relational store that owns item rows.
//!
//! Every method is one short transaction. Callers that hold thousands of rows
//! split them into chunks so no single transaction holds locks for long; a
//! failed call must leave the store exactly as it was before that call.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ItemId, ItemStatus, RetryCounter, Stage, TrackedItem};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("item not found: {0}")]
    NotFound(ItemId),

    #[error("retry counter for {item_id} would regress from {current} to {proposed}")]
    CounterRegression {
        item_id: ItemId,
        current: u32,
        proposed: u32,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One row update produced by a stage run.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeRow {
    pub item_id: ItemId,
    pub status: ItemStatus,

    /// New retry counter; `None` leaves the stored counter untouched.
    pub retry: Option<RetryCounter>,

    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
}

impl OutcomeRow {
    pub fn completed(item_id: ItemId, status: ItemStatus, result: serde_json::Value) -> Self {
        Self {
            item_id,
            status,
            retry: None,
            result: Some(result),
            last_error: None,
        }
    }

    pub fn failed(
        item_id: ItemId,
        status: ItemStatus,
        retry: RetryCounter,
        error: impl Into<String>,
    ) -> Self {
        Self {
            item_id,
            status,
            retry: Some(retry),
            result: None,
            last_error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn insert(&self, items: Vec<TrackedItem>) -> Result<(), StoreError>;

    /// Rows for the given ids; unknown ids are absent from the map.
    async fn bulk_read(&self, ids: &[ItemId]) -> Result<HashMap<ItemId, TrackedItem>, StoreError>;

    /// Rows currently in `status`, oldest id first, at most `limit` if given.
    async fn select_by_status(
        &self,
        status: &ItemStatus,
        limit: Option<usize>,
    ) -> Result<Vec<TrackedItem>, StoreError>;

    /// One page of `Eligible(stage)` rows with ids greater than `after`,
    /// oldest id first, at most `limit`. An empty page ends the scan.
    async fn select_eligible(
        &self,
        stage: &Stage,
        after: Option<ItemId>,
        limit: usize,
    ) -> Result<Vec<TrackedItem>, StoreError>;

    /// Set `status` on every id. Returns the number of rows touched.
    async fn bulk_update_status(
        &self,
        ids: &[ItemId],
        status: ItemStatus,
    ) -> Result<usize, StoreError>;

    /// Apply all rows or none of them.
    async fn bulk_apply_outcomes(&self, rows: &[OutcomeRow]) -> Result<usize, StoreError>;
}

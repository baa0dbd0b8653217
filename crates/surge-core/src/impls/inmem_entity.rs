//! InMemoryEntityStore - relational store stand-in for tests and simulations.
//!
//! Each call is one transaction: every row is validated against the current
//! state before anything is written, so a rejected call leaves the store
//! untouched.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{ItemId, ItemStatus, Stage, TrackedItem};
use crate::ports::{Clock, EntityStore, OutcomeRow, StoreError, SystemClock};

#[derive(Debug, Default)]
struct EntityState {
    rows: BTreeMap<ItemId, TrackedItem>,
    apply_calls: usize,
    read_calls: usize,
    fail_on_apply_call: Option<usize>,
}

pub struct InMemoryEntityStore {
    state: Arc<Mutex<EntityState>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(EntityState::default())),
            clock,
        }
    }

    pub async fn get(&self, item_id: ItemId) -> Option<TrackedItem> {
        self.state.lock().await.rows.get(&item_id).cloned()
    }

    /// Every row, oldest id first.
    pub async fn snapshot(&self) -> Vec<TrackedItem> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    /// Row counts per status.
    pub async fn status_counts(&self) -> HashMap<ItemStatus, usize> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for row in state.rows.values() {
            *counts.entry(row.status.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Number of `bulk_apply_outcomes` calls made so far, failed ones included.
    pub async fn apply_calls(&self) -> usize {
        self.state.lock().await.apply_calls
    }

    /// Number of `bulk_read` and `select_eligible` calls made so far.
    pub async fn read_calls(&self) -> usize {
        self.state.lock().await.read_calls
    }

    /// Make the `call`-th (0-based) `bulk_apply_outcomes` fail as unavailable.
    pub async fn fail_apply_call(&self, call: usize) {
        self.state.lock().await.fail_on_apply_call = Some(call);
    }
}

impl Default for InMemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn insert(&self, items: Vec<TrackedItem>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for item in items {
            state.rows.insert(item.item_id, item);
        }
        Ok(())
    }

    async fn bulk_read(&self, ids: &[ItemId]) -> Result<HashMap<ItemId, TrackedItem>, StoreError> {
        let mut state = self.state.lock().await;
        state.read_calls += 1;
        Ok(ids
            .iter()
            .filter_map(|id| state.rows.get(id).map(|row| (*id, row.clone())))
            .collect())
    }

    async fn select_by_status(
        &self,
        status: &ItemStatus,
        limit: Option<usize>,
    ) -> Result<Vec<TrackedItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| &row.status == status)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn select_eligible(
        &self,
        stage: &Stage,
        after: Option<ItemId>,
        limit: usize,
    ) -> Result<Vec<TrackedItem>, StoreError> {
        let mut state = self.state.lock().await;
        state.read_calls += 1;
        let lower = after.map_or(Bound::Unbounded, Bound::Excluded);
        Ok(state
            .rows
            .range((lower, Bound::Unbounded))
            .map(|(_, row)| row)
            .filter(|row| row.status.is_eligible_for(stage))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn bulk_update_status(
        &self,
        ids: &[ItemId],
        status: ItemStatus,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(missing) = ids.iter().find(|id| !state.rows.contains_key(*id)) {
            return Err(StoreError::NotFound(*missing));
        }

        let now = self.clock.now();
        for id in ids {
            if let Some(row) = state.rows.get_mut(id) {
                row.status = status.clone();
                row.updated_at = now;
            }
        }
        Ok(ids.len())
    }

    async fn bulk_apply_outcomes(&self, rows: &[OutcomeRow]) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let call = state.apply_calls;
        state.apply_calls += 1;
        if state.fail_on_apply_call == Some(call) {
            return Err(StoreError::Unavailable(format!(
                "injected failure on apply call {call}"
            )));
        }

        for row in rows {
            let current = state
                .rows
                .get(&row.item_id)
                .ok_or(StoreError::NotFound(row.item_id))?;
            match row.retry {
                Some(retry) if retry.attempts < current.retry.attempts => {
                    return Err(StoreError::CounterRegression {
                        item_id: row.item_id,
                        current: current.retry.attempts,
                        proposed: retry.attempts,
                    });
                }
                _ => {}
            }
        }

        let now = self.clock.now();
        for row in rows {
            if let Some(current) = state.rows.get_mut(&row.item_id) {
                current.status = row.status.clone();
                if let Some(retry) = row.retry {
                    current.retry = retry;
                }
                if let Some(result) = &row.result {
                    current.result = Some(result.clone());
                }
                if let Some(error) = &row.last_error {
                    current.last_error = Some(error.clone());
                }
                current.updated_at = now;
            }
        }
        Ok(rows.len())
    }
}

//! IdGenerator port.
//!
//! Ids are ULIDs whose timestamp part comes from the injected [`Clock`], so a
//! `FixedClock` yields ids with a deterministic time prefix.

use crate::domain::ids::{CorrelationId, ItemId, RunId};
use crate::ports::Clock;
use ulid::Ulid;

pub trait IdGenerator: Send + Sync {
    fn correlation_id(&self) -> CorrelationId;

    fn item_id(&self) -> ItemId;

    fn run_id(&self) -> RunId;
}

pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn correlation_id(&self) -> CorrelationId {
        CorrelationId::from(self.next())
    }

    fn item_id(&self) -> ItemId {
        ItemId::from(self.next())
    }

    fn run_id(&self) -> RunId {
        RunId::from(self.next())
    }
}

//! Domain model (ids, request descriptors, outcomes, items, error taxonomy).

pub mod errors;
pub mod ids;
pub mod item;
pub mod outcome;
pub mod request;

pub use errors::{ErrorKind, ServiceError};
pub use ids::{CorrelationId, ItemId, RunId};
pub use item::{ItemStatus, RetryCounter, Stage, TrackedItem};
pub use outcome::{OutcomeBody, OutcomeRecord};
pub use request::{RequestDescriptor, RequestLine};

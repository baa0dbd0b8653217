//! Ports: the collaborator interfaces the dispatcher and pipeline depend on.
//!
//! - **BlobStore**: shared object store holding trigger artifacts
//! - **ExternalService**: the rate-limited API
//! - **EntityStore**: relational store of item rows and retry counters
//! - **Clock** / **IdGenerator**: time and id sources, swappable in tests

pub mod blob_store;
pub mod clock;
pub mod entity_store;
pub mod external_service;
pub mod id_generator;

pub use self::blob_store::{BlobError, BlobStore, ObjectMeta};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::entity_store::{EntityStore, OutcomeRow, StoreError};
pub use self::external_service::ExternalService;
pub use self::id_generator::{IdGenerator, UlidGenerator};

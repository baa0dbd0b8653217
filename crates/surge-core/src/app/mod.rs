//! App - the batch machinery built on the ports.
//!
//! # Components
//! - **ConcurrencyController**: AIMD admission limit
//! - **Dispatcher**: admits, executes and routes one batch of descriptors
//! - **ClaimCoordinator**: single-owner processing of trigger artifacts
//! - **RetryEscalation**: pipeline-level retry counter and terminal failure
//! - **BatchRun**: one stage pass over the entity store
//! - **JsonlBatchProcessor**: JSON-lines artifacts through the dispatcher

pub mod admission;
pub mod backoff;
pub mod claim;
pub mod concurrency;
pub mod config;
pub mod dispatcher;
pub mod escalation;
pub mod jsonl;
pub mod router;
pub mod run;

pub use self::admission::{AdmissionGate, AdmissionPermit};
pub use self::backoff::LinearBackoff;
pub use self::claim::{
    ClaimCoordinator, ClaimProcessor, ClaimResult, ClaimState, ClaimedArtifact, ProcessError,
    SweepReport,
};
pub use self::concurrency::{ConcurrencyController, ConcurrencySettings, ConcurrencySnapshot};
pub use self::config::{
    ClaimConfig, ConfigError, DispatchConfig, EscalationPolicy, StoreConfig, SurgeConfig,
};
pub use self::dispatcher::{DispatchError, Dispatcher, dispatch};
pub use self::escalation::{Escalation, EscalationError, EscalationReport, RetryEscalation};
pub use self::jsonl::{JsonlBatchProcessor, JsonlTotals};
pub use self::router::{DispatchReport, DispatchStats, OutcomeRouter, UnitResult};
pub use self::run::{BatchRun, RunError, RunReport};

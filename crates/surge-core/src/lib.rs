//! surge-core
//!
//! Adaptive bulk dispatch against a rate-limited external service.
//!
//! # Modules
//! - **domain**: ids, request descriptors, outcomes, items, error taxonomy
//! - **ports**: BlobStore, EntityStore, ExternalService, Clock, IdGenerator
//! - **app**: concurrency controller, dispatcher, claim coordinator, retry escalation, batch run
//! - **impls**: in-memory, local-directory, HTTP and simulated adapters

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

//! Adapters for the ports.
//!
//! - **InMemoryBlobStore** / **LocalBlobStore**: object stores (tests, local directory)
//! - **InMemoryEntityStore**: relational store stand-in
//! - **HttpService**: the external service over HTTP
//! - **SimulatedService**: an external service failing at configured rates

pub mod http_service;
pub mod inmem_blob;
pub mod inmem_entity;
pub mod local_blob;
pub mod simulated;

pub use self::http_service::HttpService;
pub use self::inmem_blob::InMemoryBlobStore;
pub use self::inmem_entity::InMemoryEntityStore;
pub use self::local_blob::LocalBlobStore;
pub use self::simulated::SimulatedService;

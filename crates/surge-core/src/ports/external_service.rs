//! ExternalService port: the rate-limited API every descriptor is sent to.

use async_trait::async_trait;

use crate::domain::ServiceError;

/// One call per attempt. Implementations classify failures into
/// [`ServiceError`]; the dispatcher owns retries and admission.
#[async_trait]
pub trait ExternalService: Send + Sync {
    async fn call(&self, payload: &serde_json::Value) -> Result<serde_json::Value, ServiceError>;
}

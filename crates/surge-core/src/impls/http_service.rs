//! HttpService - ExternalService over HTTP.
//!
//! Each call POSTs the payload as JSON and expects a JSON body back. The
//! status code is classified by [`ServiceError::from_status`]; timeouts and
//! connection failures are transient.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::ServiceError;
use crate::ports::ExternalService;

#[derive(Debug, Clone)]
pub struct HttpService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpService {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Unrecoverable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn classify_send_error(e: reqwest::Error) -> ServiceError {
    if e.is_builder() {
        ServiceError::Unrecoverable(format!("invalid request: {e}"))
    } else if e.is_timeout() {
        ServiceError::Transient(format!("timeout: {e}"))
    } else {
        ServiceError::Transient(format!("request failed: {e}"))
    }
}

#[async_trait]
impl ExternalService for HttpService {
    async fn call(&self, payload: &Value) -> Result<Value, ServiceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(classify_send_error)?;
        if let Some(err) = ServiceError::from_status(status.as_u16(), &body) {
            debug!(endpoint = %self.endpoint, status = status.as_u16(), "service rejected call");
            return Err(err);
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| ServiceError::Unrecoverable(format!("invalid JSON response: {e}")))
    }
}

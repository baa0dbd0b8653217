//! SimulatedService - an ExternalService that fails at configured rates.
//!
//! Used for dry runs: each call sleeps for `latency`, then rolls once and
//! answers with a rate limit, a transient error, an unrecoverable error, or
//! an echo of the payload.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::domain::ServiceError;
use crate::ports::ExternalService;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedService {
    pub rate_limit_probability: f64,
    pub transient_probability: f64,
    pub unrecoverable_probability: f64,
    pub latency_ms: u64,
}

impl Default for SimulatedService {
    fn default() -> Self {
        Self {
            rate_limit_probability: 0.01,
            transient_probability: 0.02,
            unrecoverable_probability: 0.005,
            latency_ms: 5,
        }
    }
}

impl SimulatedService {
    /// Never fails, never waits.
    pub fn reliable() -> Self {
        Self {
            rate_limit_probability: 0.0,
            transient_probability: 0.0,
            unrecoverable_probability: 0.0,
            latency_ms: 0,
        }
    }

    fn outcome(&self, roll: f64, payload: &Value) -> Result<Value, ServiceError> {
        let mut edge = self.rate_limit_probability;
        if roll < edge {
            return Err(ServiceError::RateLimited);
        }
        edge += self.transient_probability;
        if roll < edge {
            return Err(ServiceError::Transient("simulated timeout".into()));
        }
        edge += self.unrecoverable_probability;
        if roll < edge {
            return Err(ServiceError::Unrecoverable("simulated HTTP 400".into()));
        }
        Ok(json!({ "echo": payload }))
    }
}

#[async_trait]
impl ExternalService for SimulatedService {
    async fn call(&self, payload: &Value) -> Result<Value, ServiceError> {
        if self.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.latency_ms)).await;
        }
        let roll: f64 = rand::random();
        self.outcome(roll, payload)
    }
}

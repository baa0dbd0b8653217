//! Request dispatcher: drives one batch through the external service.
//!
//! Flow per descriptor:
//! 1. wait for an admission slot (in-flight < current limit)
//! 2. spawn the unit on the runtime
//! 3. the unit calls the service with bounded local retries, feeding
//!    success / backpressure back into the controller
//! 4. the finished unit is routed to the success or failure sink
//!
//! A failing descriptor never stops the batch. Only an unreadable input
//! stream does: admission stops, in-flight units are drained, and the
//! partial report comes back inside [`DispatchError::Aborted`].

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use super::admission::{AdmissionGate, AdmissionPermit};
use super::backoff::LinearBackoff;
use super::concurrency::{ConcurrencyController, ConcurrencySettings};
use super::config::{ConfigError, DispatchConfig};
use super::router::{DispatchReport, OutcomeRouter, UnitResult};
use crate::domain::{ErrorKind, OutcomeRecord, RequestDescriptor};
use crate::ports::{Clock, ExternalService, SystemClock};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The input stream failed; the batch is incomplete.
    #[error("dispatch aborted after {} admitted items: {reason}", partial.stats.admitted)]
    Aborted {
        reason: String,
        partial: Box<DispatchReport>,
    },
}

/// Everything a spawned unit needs; built per batch and shared by its units.
struct UnitContext {
    service: Arc<dyn ExternalService>,
    controller: Arc<ConcurrencyController>,
    clock: Arc<dyn Clock>,
    backoff: LinearBackoff,
    max_attempts: u32,
    backpressure_events: AtomicU64,
}

pub struct Dispatcher {
    service: Arc<dyn ExternalService>,
    clock: Arc<dyn Clock>,
    backoff: LinearBackoff,
    max_attempts: u32,
    settings: ConcurrencySettings,
    /// Set only by [`Dispatcher::with_controller`]; otherwise every batch
    /// gets its own controller.
    shared: Option<Arc<ConcurrencyController>>,
}

impl Dispatcher {
    /// Dispatcher that starts each batch with a fresh controller built from `config`.
    pub fn new(
        service: Arc<dyn ExternalService>,
        config: &DispatchConfig,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(service, Arc::new(SystemClock), config)
    }

    pub fn with_clock(
        service: Arc<dyn ExternalService>,
        clock: Arc<dyn Clock>,
        config: &DispatchConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            service,
            clock,
            backoff: LinearBackoff::new(config.retry_base_delay()),
            max_attempts: config.max_local_retries.max(1),
            settings: ConcurrencySettings::from(config),
            shared: None,
        })
    }

    /// Dispatcher whose batches all feed one existing controller, so the
    /// limit carries over from one batch to the next.
    pub fn with_controller(
        service: Arc<dyn ExternalService>,
        controller: Arc<ConcurrencyController>,
        clock: Arc<dyn Clock>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            service,
            clock,
            backoff: LinearBackoff::new(config.retry_base_delay()),
            max_attempts: config.max_local_retries.max(1),
            settings: ConcurrencySettings::from(config),
            shared: Some(controller),
        }
    }

    fn batch_context(&self) -> Arc<UnitContext> {
        let controller = match &self.shared {
            Some(controller) => Arc::clone(controller),
            None => Arc::new(ConcurrencyController::new(self.settings)),
        };
        Arc::new(UnitContext {
            service: Arc::clone(&self.service),
            controller,
            clock: Arc::clone(&self.clock),
            backoff: self.backoff,
            max_attempts: self.max_attempts,
            backpressure_events: AtomicU64::new(0),
        })
    }

    /// Dispatch an in-memory batch. Cannot abort.
    pub async fn dispatch_all(&self, items: Vec<RequestDescriptor>) -> DispatchReport {
        let results = items
            .into_iter()
            .map(Ok::<RequestDescriptor, std::convert::Infallible>);
        match self.dispatch(results).await {
            Ok(report) => report,
            Err(DispatchError::Aborted { partial, .. }) => *partial,
        }
    }

    /// Dispatch a possibly failing stream of descriptors.
    pub async fn dispatch<I, E>(&self, items: I) -> Result<DispatchReport, DispatchError>
    where
        I: IntoIterator<Item = Result<RequestDescriptor, E>>,
        E: Display,
    {
        let ctx = self.batch_context();
        let gate = AdmissionGate::new(Arc::clone(&ctx.controller));
        let router = OutcomeRouter::new();
        let mut units: JoinSet<UnitResult> = JoinSet::new();
        // Admitted descriptors by task, so a panicking unit still lands in a sink.
        let mut pending: HashMap<tokio::task::Id, RequestDescriptor> = HashMap::new();
        let mut admitted = 0usize;
        let mut abort_reason = None;

        for item in items {
            let descriptor = match item {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!(admitted, error = %e, "input stream failed; aborting dispatch");
                    abort_reason = Some(e.to_string());
                    break;
                }
            };

            while let Some(joined) = units.try_join_next_with_id() {
                settle(joined, &mut pending, &router);
            }

            let permit = gate.acquire().await;
            admitted += 1;

            let handle = units.spawn(execute_unit(Arc::clone(&ctx), descriptor.clone(), permit));
            pending.insert(handle.id(), descriptor);
        }

        while let Some(joined) = units.join_next_with_id().await {
            settle(joined, &mut pending, &router);
        }

        let routed = router.routed();
        if routed != admitted {
            error!(admitted, routed, "admitted descriptors missing from both sinks");
        }

        let mut report = router.drain();
        report.stats.admitted = admitted;
        report.stats.backpressure_events = ctx.backpressure_events.load(Ordering::Acquire);
        report.stats.final_limit = ctx.controller.admit_check();

        info!(
            admitted,
            succeeded = report.stats.succeeded,
            failed = report.stats.failed,
            retried = report.stats.retried,
            final_limit = report.stats.final_limit,
            "dispatch finished"
        );

        match abort_reason {
            None => Ok(report),
            Some(reason) => Err(DispatchError::Aborted {
                reason,
                partial: Box::new(report),
            }),
        }
    }
}

/// Route one joined unit. A panicked unit routes its original descriptor
/// to the failure sink.
fn settle(
    joined: Result<(tokio::task::Id, UnitResult), JoinError>,
    pending: &mut HashMap<tokio::task::Id, RequestDescriptor>,
    router: &OutcomeRouter,
) {
    match joined {
        Ok((id, result)) => {
            pending.remove(&id);
            router.route(result);
        }
        Err(join_error) => {
            let Some(descriptor) = pending.remove(&join_error.id()) else {
                error!(error = %join_error, "unknown dispatch unit failed");
                return;
            };
            error!(
                correlation_id = %descriptor.correlation_id,
                error = %join_error,
                "dispatch unit panicked"
            );
            router.route(UnitResult::Failed {
                descriptor,
                reason: join_error.to_string(),
                attempts: 0,
            });
        }
    }
}

async fn execute_unit(
    ctx: Arc<UnitContext>,
    descriptor: RequestDescriptor,
    _permit: AdmissionPermit,
) -> UnitResult {
    let mut last_error = String::new();

    for attempt in 1..=ctx.max_attempts {
        match ctx.service.call(&descriptor.payload).await {
            Ok(response) => {
                ctx.controller.on_success();
                let record =
                    OutcomeRecord::success(descriptor.correlation_id, response, ctx.clock.now());
                return UnitResult::Succeeded {
                    record,
                    attempts: attempt,
                };
            }
            Err(err) if !err.is_retryable() => {
                let reason = err.to_string();
                warn!(
                    correlation_id = %descriptor.correlation_id,
                    external_id = %descriptor.external_id,
                    %reason,
                    "unrecoverable service error"
                );
                return UnitResult::Failed {
                    descriptor,
                    reason,
                    attempts: attempt,
                };
            }
            Err(err) => {
                if err.kind() == ErrorKind::Backpressure {
                    ctx.controller.on_backpressure();
                    ctx.backpressure_events.fetch_add(1, Ordering::AcqRel);
                }
                debug!(
                    correlation_id = %descriptor.correlation_id,
                    attempt,
                    error = %err,
                    "attempt failed"
                );
                last_error = err.to_string();
                if attempt < ctx.max_attempts {
                    tokio::time::sleep(ctx.backoff.delay(attempt)).await;
                }
            }
        }
    }

    warn!(
        correlation_id = %descriptor.correlation_id,
        external_id = %descriptor.external_id,
        attempts = ctx.max_attempts,
        error = %last_error,
        "local retries exhausted"
    );
    UnitResult::Failed {
        descriptor,
        reason: last_error,
        attempts: ctx.max_attempts,
    }
}

/// One-shot `Dispatch(items, config)`: a fresh controller per call.
pub async fn dispatch(
    service: Arc<dyn ExternalService>,
    items: Vec<RequestDescriptor>,
    config: &DispatchConfig,
) -> Result<DispatchReport, ConfigError> {
    let dispatcher = Dispatcher::new(service, config)?;
    Ok(dispatcher.dispatch_all(items).await)
}

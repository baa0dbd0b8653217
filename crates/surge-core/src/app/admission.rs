//! Admission gate: caps the number of in-flight units at the controller's
//! current limit.
//!
//! The in-flight count is a plain atomic compared against
//! [`ConcurrencyController::admit_check`] without taking the controller's
//! lock. A caller that finds no free slot parks on a `Notify` that every
//! released permit signals, so waiting costs no polling.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

use super::concurrency::ConcurrencyController;

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    controller: Arc<ConcurrencyController>,
    in_flight: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl AdmissionGate {
    pub fn new(controller: Arc<ConcurrencyController>) -> Self {
        Self {
            controller,
            in_flight: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(Notify::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until `in_flight < limit`, then take a slot.
    pub async fn acquire(&self) -> AdmissionPermit {
        loop {
            // Register interest before checking, so a release between the
            // check and the await is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let current = self.in_flight.load(Ordering::Acquire);
            if current < self.controller.admit_check() {
                if self
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return AdmissionPermit {
                        in_flight: Arc::clone(&self.in_flight),
                        released: Arc::clone(&self.released),
                    };
                }
                continue;
            }

            notified.await;
        }
    }
}

/// One in-flight slot. Dropping it frees the slot, whichever way the unit ended.
#[derive(Debug)]
pub struct AdmissionPermit {
    in_flight: Arc<AtomicUsize>,
    released: Arc<Notify>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.released.notify_one();
    }
}

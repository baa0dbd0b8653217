//! Concurrency controller: the adaptive admission limit for one batch run.
//!
//! Growth is multiplicative and gated on a sustained run of successes;
//! shrinking is multiplicative and happens on the first backpressure signal.
//!
//! ```text
//! on_success:      successes += 1
//!                  if successes >= threshold:
//!                      new = min(round(limit * increment), max)
//!                      if new > limit { limit = new; successes = 0 }
//!
//! on_backpressure: new = max(round(limit * decrement), min)
//!                  successes = 0
//!                  if new < limit { limit = new }
//! ```
//!
//! Every transition of the limit happens under one mutex. The current limit
//! is mirrored into an atomic so admission checks read it without locking;
//! such reads may be momentarily stale.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info};

use super::config::DispatchConfig;

/// Static bounds and factors of the AIMD rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConcurrencySettings {
    pub min: usize,
    pub max: usize,
    pub initial: usize,
    pub increment_factor: f64,
    pub decrement_factor: f64,
    pub success_threshold: u64,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            min: 100,
            max: 1500,
            initial: 1000,
            increment_factor: 1.2,
            decrement_factor: 0.7,
            success_threshold: 1000,
        }
    }
}

impl From<&DispatchConfig> for ConcurrencySettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            min: config.min_concurrency,
            max: config.max_concurrency,
            initial: config.initial_concurrency,
            increment_factor: config.increment_factor,
            decrement_factor: config.decrement_factor,
            success_threshold: config.success_threshold,
        }
    }
}

/// Snapshot of the controller, for reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencySnapshot {
    pub current_limit: usize,
    pub successes_since_adjustment: u64,
}

/// Owned, per-run controller. Share it with `Arc`.
#[derive(Debug)]
pub struct ConcurrencyController {
    settings: ConcurrencySettings,

    /// Lock-free mirror of the limit; only written while `adjust` is held.
    limit: AtomicUsize,

    successes: AtomicU64,

    /// Serializes every limit transition.
    adjust: Mutex<()>,
}

impl ConcurrencyController {
    /// `initial` is clamped into `[min, max]`.
    pub fn new(settings: ConcurrencySettings) -> Self {
        let initial = settings.initial.clamp(settings.min, settings.max);
        Self {
            settings,
            limit: AtomicUsize::new(initial),
            successes: AtomicU64::new(0),
            adjust: Mutex::new(()),
        }
    }

    /// Current admission limit (unlinearized read).
    pub fn admit_check(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let _guard = self.adjust.lock().unwrap_or_else(PoisonError::into_inner);
        ConcurrencySnapshot {
            current_limit: self.limit.load(Ordering::Acquire),
            successes_since_adjustment: self.successes.load(Ordering::Acquire),
        }
    }

    /// Record one success. Returns the new limit if this call raised it.
    pub fn on_success(&self) -> Option<usize> {
        let seen = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
        if seen < self.settings.success_threshold {
            return None;
        }

        let _guard = self.adjust.lock().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have grown the limit and reset the counter while
        // we waited for the lock.
        if self.successes.load(Ordering::Acquire) < self.settings.success_threshold {
            return None;
        }

        let current = self.limit.load(Ordering::Acquire);
        let grown = scale(current, self.settings.increment_factor).min(self.settings.max);
        if grown > current {
            self.limit.store(grown, Ordering::Release);
            self.successes.store(0, Ordering::Release);
            info!(from = current, to = grown, "admission limit increased");
            Some(grown)
        } else {
            None
        }
    }

    /// Record one backpressure signal. Returns the new limit if this call lowered it.
    pub fn on_backpressure(&self) -> Option<usize> {
        let _guard = self.adjust.lock().unwrap_or_else(PoisonError::into_inner);

        // A success run only counts while no backpressure interrupts it, even
        // when the limit is already at the floor.
        self.successes.store(0, Ordering::Release);

        let current = self.limit.load(Ordering::Acquire);
        let shrunk = scale(current, self.settings.decrement_factor).max(self.settings.min);
        if shrunk < current {
            self.limit.store(shrunk, Ordering::Release);
            info!(from = current, to = shrunk, "admission limit decreased after backpressure");
            Some(shrunk)
        } else {
            debug!(limit = current, "backpressure at minimum limit");
            None
        }
    }
}

fn scale(limit: usize, factor: f64) -> usize {
    (limit as f64 * factor).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::Arc;

    fn controller() -> ConcurrencyController {
        ConcurrencyController::new(ConcurrencySettings::default())
    }

    #[test]
    fn starts_at_initial_limit() {
        let c = controller();
        assert_eq!(c.admit_check(), 1000);
    }

    #[test]
    fn initial_is_clamped_into_bounds() {
        let c = ConcurrencyController::new(ConcurrencySettings {
            initial: 5000,
            ..ConcurrencySettings::default()
        });
        assert_eq!(c.admit_check(), 1500);
    }

    #[test]
    fn sustained_successes_grow_the_limit() {
        let c = controller();
        for _ in 0..999 {
            assert_eq!(c.on_success(), None);
        }
        assert_eq!(c.admit_check(), 1000);

        assert_eq!(c.on_success(), Some(1200));
        assert_eq!(c.admit_check(), 1200);
        assert_eq!(c.snapshot().successes_since_adjustment, 0);
    }

    #[test]
    fn one_backpressure_after_growth_drops_to_840() {
        let c = controller();
        for _ in 0..1000 {
            c.on_success();
        }
        assert_eq!(c.admit_check(), 1200);

        assert_eq!(c.on_backpressure(), Some(840));
        assert_eq!(c.admit_check(), 840);
    }

    #[test]
    fn growth_is_capped_at_max() {
        let c = ConcurrencyController::new(ConcurrencySettings {
            initial: 1400,
            ..ConcurrencySettings::default()
        });
        for _ in 0..1000 {
            c.on_success();
        }
        assert_eq!(c.admit_check(), 1500);

        for _ in 0..5000 {
            c.on_success();
        }
        assert_eq!(c.admit_check(), 1500);
    }

    #[test]
    fn shrink_is_floored_at_min() {
        let c = controller();
        for _ in 0..20 {
            c.on_backpressure();
        }
        assert_eq!(c.admit_check(), 100);
        assert_eq!(c.on_backpressure(), None);
        assert_eq!(c.admit_check(), 100);
    }

    #[test]
    fn backpressure_resets_the_success_run() {
        let c = controller();
        for _ in 0..900 {
            c.on_success();
        }
        c.on_backpressure();
        let after_shrink = c.admit_check();

        for _ in 0..999 {
            c.on_success();
        }
        assert_eq!(c.admit_check(), after_shrink);
        assert!(c.on_success().is_some());
    }

    #[test]
    fn backpressure_at_min_still_resets_the_success_run() {
        let c = ConcurrencyController::new(ConcurrencySettings {
            initial: 100,
            ..ConcurrencySettings::default()
        });
        for _ in 0..900 {
            c.on_success();
        }
        assert_eq!(c.on_backpressure(), None);
        assert_eq!(c.snapshot().successes_since_adjustment, 0);

        for _ in 0..100 {
            assert_eq!(c.on_success(), None);
        }
        assert_eq!(c.admit_check(), 100);

        for _ in 0..899 {
            c.on_success();
        }
        assert_eq!(c.admit_check(), 100);
        assert_eq!(c.on_success(), Some(120));
    }

    #[test]
    fn backpressure_strictly_decreases_above_min() {
        let c = controller();
        let mut limit = c.admit_check();
        while limit > 100 {
            c.on_backpressure();
            let next = c.admit_check();
            assert!(next < limit);
            limit = next;
        }
    }

    #[test]
    fn random_event_sequences_stay_within_bounds() {
        let settings = ConcurrencySettings {
            min: 10,
            max: 60,
            initial: 30,
            success_threshold: 5,
            ..ConcurrencySettings::default()
        };
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let c = ConcurrencyController::new(settings);
            for _ in 0..500 {
                if rng.gen_bool(0.2) {
                    c.on_backpressure();
                } else {
                    c.on_success();
                }
                let limit = c.admit_check();
                assert!((settings.min..=settings.max).contains(&limit), "limit {limit}");
            }
        }
    }

    #[test]
    fn concurrent_successes_grow_once_per_threshold() {
        let c = Arc::new(ConcurrencyController::new(ConcurrencySettings {
            initial: 100,
            max: 10_000,
            success_threshold: 1000,
            ..ConcurrencySettings::default()
        }));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        c.on_success();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // exactly 1000 successes: one growth step
        assert_eq!(c.admit_check(), 120);
    }
}

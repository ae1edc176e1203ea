//! Circuit breaker for grid calls.
//!
//! Closed: calls pass and consecutive failures are counted. After `failure_threshold`
//! consecutive failures the breaker opens and calls fail fast with `CircuitOpen`. Once the
//! cooldown has elapsed it half-opens and lets a single trial call through: success closes
//! it, failure opens it again.

use cadence_core::clock::Clock;
use cadence_core::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            clock,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask permission for one call.
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let cooled = inner.opened_at.is_none_or(|opened| {
                    let elapsed = self.clock.now() - opened;
                    elapsed.to_std().map(|e| e >= self.cooldown).unwrap_or(false)
                });
                if cooled {
                    info!(breaker = %self.name, "Circuit half-open, allowing trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(Error::CircuitOpen(self.name.clone()))
                } else {
                    inner.trial_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, "Circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.trial_in_flight = false;

        let trip = inner.state == BreakerState::HalfOpen
            || inner.failure_count >= self.failure_threshold;
        if trip && inner.state != BreakerState::Open {
            warn!(
                breaker = %self.name,
                failures = inner.failure_count,
                "Circuit opened"
            );
        }
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(self.clock.now());
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::clock::ManualClock;
    use chrono::TimeZone;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("grid", 3, Duration::from_secs(60), clock)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn test_opens_after_threshold() {
        let breaker = breaker(clock());
        for _ in 0..2 {
            breaker.try_acquire().unwrap();
            breaker.on_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.try_acquire().unwrap();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.try_acquire(), Err(Error::CircuitOpen(_))));
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = breaker(clock());
        breaker.on_failure();
        breaker.on_failure();
        breaker.on_success();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let clock = clock();
        let breaker = breaker(clock.clone());
        for _ in 0..3 {
            breaker.on_failure();
        }

        clock.advance(chrono::Duration::seconds(59));
        assert!(breaker.try_acquire().is_err());

        clock.advance(chrono::Duration::seconds(1));
        breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        // Only one trial call at a time
        assert!(breaker.try_acquire().is_err());

        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let clock = clock();
        let breaker = breaker(clock.clone());
        for _ in 0..3 {
            breaker.on_failure();
        }
        clock.advance(chrono::Duration::seconds(60));
        breaker.try_acquire().unwrap();
        breaker.on_failure();

        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire().is_err());
    }
}

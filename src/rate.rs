//! Adaptive transmission pacing.
//!
//! The [`RateController`] looks at how many records the store holds and how
//! fast new ones have been arriving, and estimates how long the transmission
//! stage should wait until a batch of at least `min_count` samples is
//! available. Small bursts get coalesced without starving real-time delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

/// Default lower bound for a computed wait.
pub const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(1);

/// Default upper bound for a computed wait (10 hours).
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10 * 60 * 60);

/// Deliberate overshoot so the next round starts with a small surplus.
pub const DEFAULT_AMPLIFICATION_FACTOR: f64 = 1.01;

/// Delay returned right after the target batch size changed.
pub const DEFAULT_RATE_CHANGE_DELAY: Duration = Duration::from_secs(60);

/// Tunables of the wait-time computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBounds {
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub amplification_factor: f64,
    pub rate_change_delay: Duration,
}

impl Default for RateBounds {
    fn default() -> Self {
        Self {
            min_wait: DEFAULT_MIN_WAIT,
            max_wait: DEFAULT_MAX_WAIT,
            amplification_factor: DEFAULT_AMPLIFICATION_FACTOR,
            rate_change_delay: DEFAULT_RATE_CHANGE_DELAY,
        }
    }
}

impl RateBounds {
    /// Fix inverted bounds and keep the re-estimation delay inside them.
    pub fn normalized(mut self) -> Self {
        if self.max_wait < self.min_wait {
            self.max_wait = self.min_wait;
        }
        if !(self.amplification_factor.is_finite() && self.amplification_factor > 0.0) {
            self.amplification_factor = DEFAULT_AMPLIFICATION_FACTOR;
        }
        self.rate_change_delay = self.rate_change_delay.clamp(self.min_wait, self.max_wait);
        self
    }

    fn clamp(&self, wait: Duration) -> Duration {
        wait.max(self.min_wait).min(self.max_wait)
    }
}

/// Wait needed to collect `missing` more samples at the observed rate of
/// `increment` samples per `interval`, amplified and clamped to the bounds.
///
/// An increment below one counts as one, so the wait keeps growing while no
/// new samples arrive instead of dividing by zero.
pub fn wait_time_for(missing: i64, increment: i64, interval: Duration, bounds: &RateBounds) -> Duration {
    if missing <= 0 {
        return Duration::ZERO;
    }
    let increment = increment.max(1) as f64;
    let millis =
        (missing as f64 * bounds.amplification_factor * interval.as_millis() as f64 / increment).round();

    let wait = if millis >= u64::MAX as f64 {
        Duration::MAX
    } else {
        Duration::from_millis(millis as u64)
    };
    bounds.clamp(wait)
}

/// Shared handle that marks the sampling rate as changed.
#[derive(Debug, Clone, Default)]
pub struct RateChangeSignal(Arc<AtomicBool>);

impl RateChangeSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tracks arrival statistics between transmission rounds.
#[derive(Debug)]
pub struct RateController {
    min_count: i64,
    max_count: i64,
    available_count: i64,
    last_record_count: i64,
    last_timestamp: Instant,
    rate_changed: RateChangeSignal,
    bounds: RateBounds,
}

impl RateController {
    pub fn new(min_count: u64, max_count: u64, bounds: RateBounds) -> Self {
        let min_count = min_count as i64;
        Self {
            min_count,
            max_count: (max_count as i64).max(min_count),
            available_count: 0,
            last_record_count: 0,
            last_timestamp: Instant::now(),
            rate_changed: RateChangeSignal::default(),
            bounds: bounds.normalized(),
        }
    }

    pub fn min_count(&self) -> u64 {
        self.min_count as u64
    }

    pub fn max_count(&self) -> u64 {
        self.max_count as u64
    }

    /// Samples claimed for the next transmission.
    pub fn available_count(&self) -> u64 {
        self.available_count as u64
    }

    pub fn bounds(&self) -> RateBounds {
        self.bounds
    }

    pub fn set_bounds(&mut self, bounds: RateBounds) {
        self.bounds = bounds.normalized();
    }

    /// Change the target batch size. Signals a rate change when it differs.
    pub fn set_sample_bounds(&mut self, min_count: u64, max_count: u64) {
        let min_count = min_count as i64;
        let max_count = (max_count as i64).max(min_count);
        if (min_count, max_count) != (self.min_count, self.max_count) {
            self.min_count = min_count;
            self.max_count = max_count;
            self.on_rate_changed();
        }
    }

    /// Handle for signalling rate changes from other threads.
    pub fn rate_change_signal(&self) -> RateChangeSignal {
        self.rate_changed.clone()
    }

    pub fn on_rate_changed(&self) {
        self.rate_changed.raise();
    }

    /// Forget the claimed samples once a batch has been taken.
    pub fn consume_available_samples(&mut self) {
        self.available_count = 0;
    }

    /// Restart statistics from `current_record_count` records.
    pub fn reset(&mut self, current_record_count: u64) {
        self.reset_at(current_record_count, Instant::now());
    }

    pub fn reset_at(&mut self, current_record_count: u64, now: Instant) {
        self.available_count = 0;
        self.last_record_count = current_record_count as i64;
        self.last_timestamp = now;
    }

    pub fn calculate_wait_time(&mut self, current_record_count: u64) -> Duration {
        self.calculate_wait_time_at(current_record_count, Instant::now())
    }

    /// Update the statistics from the current record count and return how
    /// long to wait before the next transmission attempt.
    pub fn calculate_wait_time_at(&mut self, current_record_count: u64, now: Instant) -> Duration {
        let current = current_record_count as i64;
        let interval = now.saturating_duration_since(self.last_timestamp);
        let increment = current - (self.last_record_count + self.available_count);

        self.available_count = current.min(self.max_count).max(0);
        self.last_record_count = current - self.available_count;
        self.last_timestamp = now;

        let missing = (self.min_count - self.available_count).max(0);

        if self.rate_changed.take() {
            // Statistics from before the change are stale; re-estimate later
            // instead of acting on them.
            debug!(
                delay_ms = self.bounds.rate_change_delay.as_millis() as u64,
                "Rate changed, deferring estimate"
            );
            return self.bounds.rate_change_delay;
        }

        let wait = wait_time_for(missing, increment, interval, &self.bounds);
        debug!(
            current,
            available = self.available_count,
            missing,
            increment,
            interval_ms = interval.as_millis() as u64,
            wait_ms = wait.as_millis() as u64,
            "Computed transmission wait"
        );
        wait
    }
}

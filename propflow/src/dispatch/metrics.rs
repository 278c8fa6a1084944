//! Per-worker counters and processing-time distribution.
//!
//! Every metric is written only by the worker's own execution loop and read
//! without locks by status pollers. Atomics with relaxed ordering are
//! enough: a snapshot may mix values from adjacent updates but never sees a
//! torn value.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Interval at which the moving averages decay.
const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Exponentially weighted moving average of an events-per-second rate.
struct Ewma {
    alpha: f64,
    /// f64 bits, events per second.
    rate: AtomicU64,
}

impl Ewma {
    fn over_minutes(minutes: f64) -> Self {
        Self {
            alpha: 1.0 - (-TICK_INTERVAL.as_secs_f64() / 60.0 / minutes).exp(),
            rate: AtomicU64::new(0f64.to_bits()),
        }
    }

    fn rate(&self) -> f64 {
        f64::from_bits(self.rate.load(Ordering::Relaxed))
    }

    /// Rate after one tick that saw `count` events followed by `idle` empty ticks.
    fn decayed(&self, current: f64, initialized: bool, count: u64, idle: u64) -> f64 {
        let instant = count as f64 / TICK_INTERVAL.as_secs_f64();
        let after_first = if initialized {
            current + self.alpha * (instant - current)
        } else {
            instant
        };
        after_first * (1.0 - self.alpha).powi(idle.min(i32::MAX as u64) as i32)
    }
}

/// Timer recording how long each job took and how often jobs finish.
///
/// Reports count, mean duration and 1-, 5- and 15-minute rates.
pub struct ProcessingTimer {
    origin: Instant,
    count: AtomicU64,
    total_nanos: AtomicU64,
    /// Events since the last tick.
    uncounted: AtomicU64,
    /// Nanoseconds after `origin` of the last applied tick.
    last_tick: AtomicU64,
    initialized: AtomicBool,
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
}

impl ProcessingTimer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            count: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            uncounted: AtomicU64::new(0),
            last_tick: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            m1: Ewma::over_minutes(1.0),
            m5: Ewma::over_minutes(5.0),
            m15: Ewma::over_minutes(15.0),
        }
    }

    /// Records one job. Must only be called from the owning loop.
    pub fn update(&self, elapsed: Duration) {
        self.update_at(elapsed, Instant::now());
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        self.snapshot_at(Instant::now())
    }

    fn nanos_since_origin(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_nanos() as u64
    }

    /// Number of whole ticks between the last applied tick and `now`.
    fn pending_ticks(&self, now: Instant) -> u64 {
        let elapsed = self
            .nanos_since_origin(now)
            .saturating_sub(self.last_tick.load(Ordering::Relaxed));
        elapsed / TICK_INTERVAL.as_nanos() as u64
    }

    fn update_at(&self, elapsed: Duration, now: Instant) {
        let ticks = self.pending_ticks(now);
        if ticks > 0 {
            let uncounted = self.uncounted.swap(0, Ordering::Relaxed);
            let initialized = self.initialized.swap(true, Ordering::Relaxed);
            for ewma in [&self.m1, &self.m5, &self.m15] {
                let rate = ewma.decayed(ewma.rate(), initialized, uncounted, ticks - 1);
                ewma.rate.store(rate.to_bits(), Ordering::Relaxed);
            }
            self.last_tick.fetch_add(
                ticks * TICK_INTERVAL.as_nanos() as u64,
                Ordering::Relaxed,
            );
        }

        self.uncounted.fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Reads the timer as of `now`, applying decay for ticks the writer
    /// has not reached yet without modifying any state.
    fn snapshot_at(&self, now: Instant) -> TimerSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total = self.total_nanos.load(Ordering::Relaxed);
        let ticks = self.pending_ticks(now);
        let uncounted = self.uncounted.load(Ordering::Relaxed);
        let initialized = self.initialized.load(Ordering::Relaxed);

        let rate = |ewma: &Ewma| {
            if ticks == 0 {
                ewma.rate()
            } else {
                ewma.decayed(ewma.rate(), initialized, uncounted, ticks - 1)
            }
        };

        TimerSnapshot {
            count,
            mean_ms: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64 / 1_000_000.0
            },
            one_minute_rate: rate(&self.m1),
            five_minute_rate: rate(&self.m5),
            fifteen_minute_rate: rate(&self.m15),
        }
    }
}

impl Default for ProcessingTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a [`ProcessingTimer`]. Rates are per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    pub count: u64,
    pub mean_ms: f64,
    pub one_minute_rate: f64,
    pub five_minute_rate: f64,
    pub fifteen_minute_rate: f64,
}

/// Counters owned by one worker's execution loop.
#[derive(Default)]
pub struct WorkerMetrics {
    processed: AtomicU64,
    errors: AtomicU64,
    in_flight: AtomicU64,
    timer: ProcessingTimer,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn job_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self, elapsed: Duration, succeeded: bool) {
        self.timer.update(elapsed);
        if succeeded {
            self.processed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn timer(&self) -> &ProcessingTimer {
        &self.timer
    }

    pub fn snapshot(&self, name: &str) -> WorkerStatus {
        WorkerStatus {
            name: name.to_string(),
            processed: self.processed(),
            errors: self.errors(),
            in_flight: self.in_flight(),
            processing_time: self.timer.snapshot(),
        }
    }
}

/// Status of one registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub name: String,
    pub processed: u64,
    pub errors: u64,
    pub in_flight: u64,
    pub processing_time: TimerSnapshot,
}

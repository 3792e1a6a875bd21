//! Poll interval selection
//!
//! The delay before the next discovery poll depends only on what the last
//! poll saw: how many event loops the region advertised and how many of them
//! we hold open connections to. Polling is fast while we are disconnected or
//! the region is still starting, and relaxes once every event loop is
//! connected.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// Coarse poll frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalClass {
    Low,
    Mid,
    High,
}

impl fmt::Display for IntervalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalClass::Low => write!(f, "low"),
            IntervalClass::Mid => write!(f, "mid"),
            IntervalClass::High => write!(f, "high"),
        }
    }
}

/// Maps the outcome of a poll to an interval class.
///
/// `num_endpoints` is `None` when discovery failed.
pub fn compute_interval(num_endpoints: Option<usize>, num_open: usize) -> IntervalClass {
    match num_endpoints {
        None | Some(0) => IntervalClass::Low,
        Some(_) if num_open == 0 => IntervalClass::Low,
        Some(endpoints) if num_open < endpoints => IntervalClass::Mid,
        Some(_) => IntervalClass::High,
    }
}

/// Durations for each interval class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollIntervals {
    pub low: Duration,
    pub mid: Duration,
    pub high: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            low: Duration::from_secs(2),
            mid: Duration::from_secs(10),
            high: Duration::from_secs(30),
        }
    }
}

impl PollIntervals {
    pub fn duration(&self, class: IntervalClass) -> Duration {
        match class {
            IntervalClass::Low => self.low,
            IntervalClass::Mid => self.mid,
            IntervalClass::High => self.high,
        }
    }
}

/// Turns poll outcomes into delays, remembering the last class chosen.
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    intervals: PollIntervals,
    jitter: f64,
    last: Option<IntervalClass>,
}

impl BackoffScheduler {
    /// Creates a scheduler.
    ///
    /// Each delay is scaled by a random factor in `[1 - jitter, 1 + jitter]`
    /// so that many clusters do not poll in lock-step. `jitter` is clamped
    /// to `[0, 1]`; zero gives exact delays.
    pub fn new(intervals: PollIntervals, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() { jitter.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            intervals,
            jitter,
            last: None,
        }
    }

    /// Records the outcome of a poll and returns the class and the delay
    /// until the next one.
    pub fn schedule(&mut self, num_endpoints: Option<usize>, num_open: usize) -> (IntervalClass, Duration) {
        let class = compute_interval(num_endpoints, num_open);
        self.last = Some(class);
        (class, self.delay(class))
    }

    /// Delay for `class` with jitter applied.
    pub fn delay(&self, class: IntervalClass) -> Duration {
        let base = self.intervals.duration(class);
        if self.jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
    }

    /// Class chosen by the most recent [`schedule`](Self::schedule), if any.
    pub fn last(&self) -> Option<IntervalClass> {
        self.last
    }

    pub fn intervals(&self) -> &PollIntervals {
        &self.intervals
    }
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self::new(PollIntervals::default(), 0.1)
    }
}

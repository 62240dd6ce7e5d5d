//! RPM signal conditioning
//!
//! Smooths raw motor-speed samples and derives a throttle estimate from
//! their rate of change. Electric drivetrains expose no throttle position
//! over OBD, so acceleration is the only usable proxy.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SignalConfig;

/// One raw reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RpmSample {
    /// Magnitude of the reading
    pub rpm: f64,
    /// Time since the session epoch
    pub at: Duration,
}

impl RpmSample {
    pub fn new(rpm: f64, at: Duration) -> Self {
        Self { rpm: rpm.abs(), at }
    }
}

/// Bounded sample history; the oldest sample is evicted when full
#[derive(Debug, Clone)]
pub struct RpmHistory {
    samples: VecDeque<RpmSample>,
    capacity: usize,
}

impl RpmHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: RpmSample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&RpmSample> {
        self.samples.back()
    }

    /// The newest `n` samples, oldest first
    pub fn recent(&self, n: usize) -> impl Iterator<Item = &RpmSample> {
        let skip = self.samples.len().saturating_sub(n);
        self.samples.iter().skip(skip)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Latest conditioned values, read by the modulation tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionedSignal {
    /// Smoothed RPM
    pub rpm: f64,
    /// Throttle estimate, 0..=1
    pub throttle: f64,
    /// Timestamp of the sample that produced this value
    pub at: Duration,
}

/// Throttle from a window of samples: normalized rate of change, clamped.
///
/// Zero when the window has fewer than two samples or spans no time.
pub fn estimate_throttle<'a, I>(window: I, max_rate_rpm_per_sec: f64) -> f64
where
    I: IntoIterator<Item = &'a RpmSample>,
{
    let mut iter = window.into_iter();
    let Some(first) = iter.next() else {
        return 0.0;
    };
    let Some(last) = iter.last() else {
        return 0.0;
    };

    let elapsed = last.at.saturating_sub(first.at).as_secs_f64();
    if elapsed <= 0.0 || max_rate_rpm_per_sec <= 0.0 {
        return 0.0;
    }

    let rate = (last.rpm - first.rpm) / elapsed;
    (rate / max_rate_rpm_per_sec).clamp(0.0, 1.0)
}

/// EMA smoothing plus throttle estimation over a bounded history
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    history: RpmHistory,
    alpha: f64,
    throttle_window: usize,
    max_rate: f64,
    smoothed: Option<f64>,
    last: ConditionedSignal,
}

impl SignalConditioner {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            history: RpmHistory::new(config.history_capacity),
            alpha: config.smoothing_alpha.clamp(f64::EPSILON, 1.0),
            throttle_window: config.throttle_window.max(2),
            max_rate: config.max_rate_rpm_per_sec,
            smoothed: None,
            last: ConditionedSignal::default(),
        }
    }

    /// Add a raw sample and return the updated conditioned values
    pub fn push(&mut self, sample: RpmSample) -> ConditionedSignal {
        self.history.push(sample);

        let smoothed = match self.smoothed {
            None => sample.rpm,
            Some(prev) => self.alpha * sample.rpm + (1.0 - self.alpha) * prev,
        };
        self.smoothed = Some(smoothed);

        let throttle = estimate_throttle(self.history.recent(self.throttle_window), self.max_rate);

        self.last = ConditionedSignal {
            rpm: smoothed,
            throttle,
            at: sample.at,
        };
        self.last
    }

    pub fn current(&self) -> ConditionedSignal {
        self.last
    }

    pub fn history(&self) -> &RpmHistory {
        &self.history
    }

    /// Forget all samples; the next one re-seeds the average
    pub fn reset(&mut self) {
        self.history.clear();
        self.smoothed = None;
        self.last = ConditionedSignal::default();
    }
}

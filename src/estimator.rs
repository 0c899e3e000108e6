//! Windowed throughput estimation for a single download.
//!
//! Bytes are accumulated into 500 ms windows. Each closed window yields an
//! instantaneous Mbps sample; the last eight samples are averaged and the
//! displayed figure eases toward that average so it does not jitter.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

pub const WINDOW: Duration = Duration::from_millis(500);
pub const SAMPLE_CAPACITY: usize = 8;
pub const SMOOTHING: f64 = 0.25;

const BITS_PER_MEGABIT: f64 = 1024.0 * 1024.0;

pub fn mbps(bytes: u64, secs: f64) -> f64 {
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / BITS_PER_MEGABIT / secs
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Estimate {
    pub received: u64,
    pub total: u64,
    pub mbps: f64,
    pub percent: f64,
    pub samples: usize,
}

#[derive(Debug)]
pub struct ThroughputEstimator {
    total: u64,
    received: u64,
    started_at: Instant,
    window_start: Instant,
    window_bytes: u64,
    samples: VecDeque<f64>,
    display: f64,
    finished: bool,
}

impl ThroughputEstimator {
    pub fn new(total: u64, started_at: Instant) -> Self {
        Self {
            total,
            received: 0,
            started_at,
            window_start: started_at,
            window_bytes: 0,
            samples: VecDeque::with_capacity(SAMPLE_CAPACITY + 1),
            display: 0.0,
            finished: false,
        }
    }

    /// Open the first window at `now`, once the response has arrived.
    pub fn begin_window(&mut self, now: Instant) {
        self.window_start = now;
        self.window_bytes = 0;
    }

    pub fn record(&mut self, len: usize, now: Instant) {
        self.received += len as u64;
        self.window_bytes += len as u64;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed >= WINDOW {
            self.samples.push_back(mbps(self.window_bytes, elapsed.as_secs_f64()));
            if self.samples.len() > SAMPLE_CAPACITY {
                self.samples.pop_front();
            }
            self.window_bytes = 0;
            self.window_start = now;
        }

        if let Some(mean) = self.mean_sample() {
            self.display += (mean - self.display) * SMOOTHING;
        }
    }

    fn mean_sample(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn display_mbps(&self) -> f64 {
        self.display
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    pub fn progress_percent(&self) -> f64 {
        if self.finished {
            return 100.0;
        }
        if self.total == 0 {
            return 0.0;
        }
        (self.received as f64 / self.total as f64 * 100.0).min(100.0)
    }

    pub fn mean_mbps(&self, now: Instant) -> f64 {
        mbps(self.received, now.saturating_duration_since(self.started_at).as_secs_f64())
    }

    pub fn snapshot(&self) -> Estimate {
        Estimate {
            received: self.received,
            total: self.total,
            mbps: self.display,
            percent: self.progress_percent(),
            samples: self.samples.len(),
        }
    }
}

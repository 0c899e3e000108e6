use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::info;

use crate::estimator::mbps;

#[derive(Default)]
pub struct Counters {
    pub bytes_sent: Arc<AtomicU64>,
    pub streams: AtomicU64,
}

pub struct ThroughputAverager {
    tau_secs: f64,
    smoothed_bps: f64,
}

impl ThroughputAverager {
    pub fn new(tau_secs: f64) -> Self {
        Self { tau_secs, smoothed_bps: 0.0 }
    }

    pub fn update(&mut self, bytes_delta: u64, dt_secs: f64) -> f64 {
        let dt = dt_secs.max(1e-3);
        let alpha = 1.0 - (-dt / self.tau_secs).exp();
        let inst = (bytes_delta as f64) / dt;
        self.smoothed_bps = self.smoothed_bps * (1.0 - alpha) + inst * alpha;
        self.smoothed_bps
    }
}

/// Log outbound throughput every `every` until `stop` is set.
pub fn spawn_reporter(counters: Arc<Counters>, stop: Arc<AtomicBool>, every: Duration) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut avg = ThroughputAverager::new(every.as_secs_f64() * 3.0);
        let mut last_sent = 0u64;
        let mut last = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            thread::sleep(every);
            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64().max(0.001);
            last = now;
            let sent = counters.bytes_sent.load(Ordering::Relaxed);
            let delta = sent - last_sent;
            last_sent = sent;
            if delta == 0 {
                continue;
            }
            let smoothed = avg.update(delta, dt);
            info!(
                outbound_mbps = mbps(smoothed as u64, 1.0),
                total_bytes = sent,
                streams = counters.streams.load(Ordering::Relaxed),
                "Throughput"
            );
        }
    })
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::CACHE_CONTROL;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::estimator::{Estimate, ThroughputEstimator};
use crate::size::UnitConvention;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server answered {0}")]
    Status(StatusCode),
}

#[derive(Clone, Debug, Default)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }

    async fn stopped(&self) {
        self.0.cancelled().await
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub bytes: u64,
    pub expected: u64,
    pub elapsed_secs: f64,
    pub mean_mbps: f64,
    pub display_mbps: f64,
}

impl Summary {
    fn from_estimator(est: &ThroughputEstimator, started: Instant, now: Instant) -> Self {
        let snap = est.snapshot();
        Self {
            bytes: snap.received,
            expected: snap.total,
            elapsed_secs: now.saturating_duration_since(started).as_secs_f64(),
            mean_mbps: est.mean_mbps(now),
            display_mbps: snap.mbps,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Finished(Summary),
    Stopped(Summary),
}

impl Outcome {
    pub fn summary(&self) -> &Summary {
        match self {
            Outcome::Finished(s) | Outcome::Stopped(s) => s,
        }
    }
}

#[derive(Clone)]
pub struct SpeedTest {
    client: reqwest::Client,
    url: Url,
    total: u64,
    running: Arc<AtomicBool>,
}

impl SpeedTest {
    pub fn new(client: reqwest::Client, base: &Url, size_mb: u64, units: UnitConvention) -> Result<Self> {
        let url = base
            .join(&format!("{size_mb}m"))
            .with_context(|| format!("Building download URL from {base}"))?;
        Ok(Self {
            client,
            url,
            total: size_mb.saturating_mul(units.megabyte()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn expected_bytes(&self) -> u64 {
        self.total
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self) -> Option<Session> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Session {
            client: self.client.clone(),
            url: self.url.clone(),
            total: self.total,
            stop: StopHandle::default(),
            _slot: RunningSlot(Arc::clone(&self.running)),
        })
    }
}

struct RunningSlot(Arc<AtomicBool>);

impl Drop for RunningSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One measurement. Owns fresh counters; releases the slot when dropped.
pub struct Session {
    client: reqwest::Client,
    url: Url,
    total: u64,
    stop: StopHandle,
    _slot: RunningSlot,
}

impl Session {
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub async fn run<F>(self, on_update: F) -> Result<Outcome, SessionError>
    where
        F: FnMut(&Estimate),
    {
        let started = Instant::now();
        info!(url = %self.url, expected = self.total, "Starting measurement");

        let request = self.client.get(self.url.clone()).header(CACHE_CONTROL, "no-store");
        let response = tokio::select! {
            biased;
            _ = self.stop.stopped() => {
                let est = ThroughputEstimator::new(self.total, started);
                return Ok(Outcome::Stopped(Summary::from_estimator(&est, started, Instant::now())));
            }
            response = request.send() => response?,
        };
        if !response.status().is_success() {
            return Err(SessionError::Status(response.status()));
        }

        let mut estimator = ThroughputEstimator::new(self.total, started);
        estimator.begin_window(Instant::now());
        let outcome = drive(response.bytes_stream(), &self.stop, estimator, started, on_update).await?;
        info!(
            bytes = outcome.summary().bytes,
            mean_mbps = outcome.summary().mean_mbps,
            "Measurement ended"
        );
        Ok(outcome)
    }
}

/// Read loop: feed every slice to the estimator until the body ends or
/// `stop` fires. A stop is a normal outcome, not an error.
pub async fn drive<S, E, F>(
    stream: S,
    stop: &StopHandle,
    mut estimator: ThroughputEstimator,
    started: Instant,
    mut on_update: F,
) -> Result<Outcome, E>
where
    S: Stream<Item = Result<Bytes, E>>,
    F: FnMut(&Estimate),
{
    futures::pin_mut!(stream);
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.stopped() => {
                debug!(received = estimator.received(), "Measurement stopped");
                return Ok(Outcome::Stopped(Summary::from_estimator(&estimator, started, Instant::now())));
            }
            next = stream.next() => next,
        };
        match next {
            Some(Ok(slice)) => {
                estimator.record(slice.len(), Instant::now());
                on_update(&estimator.snapshot());
            }
            Some(Err(e)) => return Err(e),
            None => {
                estimator.finish();
                on_update(&estimator.snapshot());
                return Ok(Outcome::Finished(Summary::from_estimator(&estimator, started, Instant::now())));
            }
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::cli::Serve;
use crate::metrics::{spawn_reporter, Counters};
use crate::routes::{build_router, AppState};
use crate::size::Limits;
#[cfg(feature = "mdns")]
use libmdns as _mdns;

pub fn run_serve(serve: Serve) -> Result<()> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    run_serve_with_shutdown(serve, stop_flag)
}

pub(crate) fn run_serve_with_shutdown(serve: Serve, stop_flag: Arc<AtomicBool>) -> Result<()> {
    let limits = Limits::from_serve(&serve).context("Validating size limits")?;
    let locations = (!serve.no_locations).then(|| serve.locations_upstream.clone());
    info!(
        host = %serve.host,
        min_bytes = limits.min_bytes,
        max_bytes = limits.max_bytes,
        chunk_bytes = limits.chunk_bytes,
        units = ?limits.units,
        "Starting netspeed"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Building tokio runtime")?;

    let counters = Arc::new(Counters::default());
    let reporter = spawn_reporter(Arc::clone(&counters), stop_flag.clone(), Duration::from_secs(5));
    let state = AppState::new(limits, locations, counters);

    let result = runtime.block_on(async {
        let listener = TcpListener::bind(serve.host)
            .await
            .with_context(|| format!("Binding HTTP listener at {}", serve.host))?;

        // mDNS/Bonjour advertisement, optional via feature flag
        #[cfg(feature = "mdns")]
        let _mdns_guard = advertise(serve.host.port());

        serve_on(listener, state, stop_flag.clone()).await
    });

    stop_flag.store(true, Ordering::Relaxed);
    let _ = reporter.join();
    info!("Shutting down");
    result
}

pub(crate) async fn serve_on(listener: TcpListener, state: AppState, stop: Arc<AtomicBool>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(wait_for_stop(stop))
        .await
        .context("Serving HTTP")
}

async fn wait_for_stop(stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[cfg(feature = "mdns")]
fn advertise(port: u16) -> Option<(_mdns::Responder, _mdns::Service)> {
    match _mdns::Responder::new() {
        Ok(responder) => {
            let txt: [&str; 1] = ["provider=netspeed"];
            let service = responder.register("_netspeed._tcp".to_string(), "netspeed".to_string(), port, &txt);
            Some((responder, service))
        }
        Err(e) => {
            warn!(error = ?e, "mDNS responder init failed; continuing without mDNS");
            None
        }
    }
}

#[cfg(test)]
mod itests {
    use super::*;
    use std::net::SocketAddr;

    use futures::StreamExt;
    use reqwest::StatusCode;

    use crate::estimator::Estimate;
    use crate::session::{Outcome, SpeedTest};
    use crate::size::UnitConvention;

    const MB: u64 = 1024 * 1024;

    type Server = (SocketAddr, Arc<AtomicBool>, tokio::task::JoinHandle<Result<()>>);

    async fn spawn_server() -> Server {
        let (server, _) = spawn_server_with_counters().await;
        server
    }

    async fn spawn_server_with_counters() -> (Server, Arc<Counters>) {
        let limits = Limits {
            min_bytes: MB,
            max_bytes: 200 * MB,
            default_bytes: 10 * MB,
            chunk_bytes: 64 * 1024,
            depth: 4,
            ..Limits::default()
        };
        let counters = Arc::new(Counters::default());
        let state = AppState::new(limits, None, Arc::clone(&counters));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(serve_on(listener, state, stop.clone()));
        ((addr, stop, handle), counters)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streams_exact_byte_count_over_loopback() {
        let (addr, stop, handle) = spawn_server().await;

        let resp = reqwest::get(format!("http://{addr}/100m")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.content_length(), Some(100 * MB));
        let mut total = 0u64;
        let mut body = resp.bytes_stream();
        while let Some(chunk) = body.next().await {
            total += chunk.unwrap().len() as u64;
        }
        assert_eq!(total, 100 * MB);

        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_disconnect_stops_production() {
        let ((addr, stop, handle), counters) = spawn_server_with_counters().await;

        let resp = reqwest::get(format!("http://{addr}/200m")).await.unwrap();
        let mut body = resp.bytes_stream();
        let mut read = 0u64;
        while read < MB {
            read += body.next().await.unwrap().unwrap().len() as u64;
        }
        drop(body);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let after_drop = counters.bytes_sent.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(counters.bytes_sent.load(Ordering::Relaxed), after_drop);
        // Socket buffers hold a few MB at most; the rest is never produced.
        assert!(after_drop < 32 * MB, "produced {after_drop}");

        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_before_streaming() {
        let (addr, stop, handle) = spawn_server().await;

        let resp = reqwest::get(format!("http://{addr}/500k")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(resp.text().await.unwrap().starts_with("size out of range"));

        let resp = reqwest::get(format!("http://{addr}/abc")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = reqwest::get(format!("http://{addr}/x/y")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = reqwest::get(format!("http://{addr}/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[reqwest::header::CONTENT_TYPE], "text/html; charset=utf-8");

        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_measures_full_download() {
        let (addr, stop, handle) = spawn_server().await;
        let base: reqwest::Url = format!("http://{addr}/").parse().unwrap();
        let test = SpeedTest::new(reqwest::Client::new(), &base, 20, UnitConvention::Binary).unwrap();

        let session = test.start().unwrap();
        assert!(test.start().is_none());
        let mut last = Estimate::default();
        let outcome = session.run(|e| last = e.clone()).await.unwrap();

        match outcome {
            Outcome::Finished(summary) => assert_eq!(summary.bytes, 20 * MB),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(last.percent, 100.0);
        assert!(!test.is_running());
        drop(test);

        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_stop_mid_stream_is_clean() {
        let (addr, stop, handle) = spawn_server().await;
        let base: reqwest::Url = format!("http://{addr}/").parse().unwrap();
        let test = SpeedTest::new(reqwest::Client::new(), &base, 200, UnitConvention::Binary).unwrap();

        let session = test.start().unwrap();
        let stopper = session.stop_handle();
        let outcome = session
            .run(|e| {
                if e.received >= 4 * MB {
                    stopper.stop();
                }
            })
            .await
            .unwrap();

        match outcome {
            Outcome::Stopped(summary) => {
                assert!(summary.bytes >= 4 * MB);
                assert!(summary.bytes < 200 * MB);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(test.start().is_some());
        drop(test);

        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_reports_rejected_size() {
        let (addr, stop, handle) = spawn_server().await;
        let base: reqwest::Url = format!("http://{addr}/").parse().unwrap();
        let test = SpeedTest::new(reqwest::Client::new(), &base, 500, UnitConvention::Binary).unwrap();

        let err = test.start().unwrap().run(|_| {}).await.unwrap_err();
        assert!(matches!(err, crate::session::SessionError::Status(StatusCode::BAD_REQUEST)));
        drop(test);

        stop.store(true, Ordering::Relaxed);
        handle.await.unwrap().unwrap();
    }
}

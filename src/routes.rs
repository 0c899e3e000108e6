//! HTTP surface.
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/` | browser speed-test page |
//! | GET | `/locations` | upstream location metadata, verbatim |
//! | GET, HEAD | `/<n>[k\|m\|g]` | `n` units of synthetic payload |
//!
//! Anything else is a 404 with a usage hint.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use tracing::{debug, warn};

use crate::metrics::Counters;
use crate::page;
use crate::size::{Limits, SizeRequest};
use crate::stream::{payload_stream, ChunkBuffer};

const USAGE: &str = "not found\n\
usage:\n  GET /                speed-test page\n  GET /<n>[k|m|g]      stream n bytes, kilo-, mega- or gigabytes\n  GET /locations       upstream location metadata\n";

#[derive(Clone)]
pub struct AppState {
    pub limits: Arc<Limits>,
    pub buffer: ChunkBuffer,
    pub counters: Arc<Counters>,
    pub locations: Option<Url>,
    pub client: reqwest::Client,
    page: Arc<str>,
}

impl AppState {
    pub fn new(limits: Limits, locations: Option<Url>, counters: Arc<Counters>) -> Self {
        let page = page::render(&limits);
        Self {
            buffer: ChunkBuffer::new(limits.chunk_bytes),
            limits: Arc::new(limits),
            counters,
            locations,
            client: reqwest::Client::new(),
            page: page.into(),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/locations", get(locations))
        .fallback(payload)
        .with_state(state)
}

async fn index(State(state): State<AppState>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        state.page.to_string(),
    )
}

async fn locations(State(state): State<AppState>) -> Response {
    let Some(url) = state.locations.clone() else {
        return not_found();
    };
    match fetch_verbatim(&state.client, url.clone()).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(%url, ?e, "Locations upstream failed");
            (StatusCode::BAD_GATEWAY, "upstream unavailable\n").into_response()
        }
    }
}

async fn fetch_verbatim(client: &reqwest::Client, url: Url) -> Result<Response, reqwest::Error> {
    let upstream = client.get(url).send().await?;
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream.headers().get(reqwest::header::CONTENT_TYPE).cloned();
    let body = upstream.bytes().await?;

    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    if let Some(ct) = content_type.and_then(|v| HeaderValue::from_bytes(v.as_bytes()).ok()) {
        resp.headers_mut().insert(header::CONTENT_TYPE, ct);
    }
    Ok(resp)
}

/// GET /<size>, and the 404 for everything else.
async fn payload(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/').trim_end_matches('/');
    if path.contains('/') {
        return not_found();
    }
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    if path == "locations" {
        return locations(State(state)).await;
    }

    let request = match SizeRequest::from_path(path, &state.limits) {
        Ok(r) => r,
        Err(e) => {
            debug!(%uri, %e, "Rejected size request");
            return e.into_response();
        }
    };
    let total = request.bytes();

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        state.counters.streams.fetch_add(1, Ordering::Relaxed);
        debug!(total, "Streaming payload");
        Body::from_stream(payload_stream(
            total,
            state.buffer.clone(),
            state.limits.depth,
            Arc::clone(&state.counters.bytes_sent),
        ))
    };

    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CACHE_CONTROL, "no-store".to_string()),
            (header::CONTENT_LENGTH, total.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", request.file_name()),
            ),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*".to_string()),
        ],
        body,
    )
        .into_response()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, USAGE).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        let limits = Limits {
            min_bytes: 10 * 1024 * 1024,
            max_bytes: 1000 * 1024 * 1024,
            default_bytes: 100 * 1024 * 1024,
            chunk_bytes: 64 * 1024,
            depth: 4,
            ..Limits::default()
        };
        AppState::new(limits, None, Arc::new(Counters::default()))
    }

    async fn body_text(resp: Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn index_is_html() {
        let resp = index(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let ct = resp.headers().get(header::CONTENT_TYPE).unwrap().to_str().unwrap();
        assert_eq!(ct, "text/html; charset=utf-8");
        assert!(body_text(resp).await.contains("<!doctype html>"));
    }

    #[tokio::test]
    async fn below_minimum_is_bad_request() {
        let resp = payload(State(test_state()), Method::GET, Uri::from_static("/5m")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.starts_with("size out of range"));
    }

    #[tokio::test]
    async fn malformed_is_bad_request() {
        let resp = payload(State(test_state()), Method::GET, Uri::from_static("/abc")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(resp).await.contains("malformed size path"));
    }

    #[tokio::test]
    async fn nested_path_is_not_found() {
        let resp = payload(State(test_state()), Method::GET, Uri::from_static("/a/10m")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_text(resp).await.contains("usage:"));
    }

    #[tokio::test]
    async fn post_is_not_allowed() {
        let resp = payload(State(test_state()), Method::POST, Uri::from_static("/10m")).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn head_reports_length_without_streaming() {
        let state = test_state();
        let counters = Arc::clone(&state.counters);
        let resp = payload(State(state), Method::HEAD, Uri::from_static("/10m")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "10485760");
        assert_eq!(counters.streams.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn payload_headers_and_exact_length() {
        let state = test_state();
        let counters = Arc::clone(&state.counters);
        let resp = payload(State(state), Method::GET, Uri::from_static("/10m")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let headers = resp.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(headers[header::CONTENT_LENGTH], "10485760");
        assert_eq!(headers[header::CONTENT_DISPOSITION], "attachment; filename=\"10485760.bin\"");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 10 * 1024 * 1024);
        assert_eq!(&body[..4], &[0, 1, 2, 3]);
        assert_eq!(counters.streams.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn locations_disabled_is_not_found() {
        let resp = locations(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn locations_with_trailing_slash_is_not_a_size() {
        let resp = payload(State(test_state()), Method::GET, Uri::from_static("/locations/")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_text(resp).await.contains("usage:"));
    }

    #[tokio::test]
    async fn locations_unreachable_upstream_is_bad_gateway() {
        let mut state = test_state();
        state.locations = Some("http://127.0.0.1:9/locations".parse().unwrap());
        let resp = locations(State(state)).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}

//! Prometheus plumbing shared by the ingest API and the delivery workers.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Latency buckets sized for this pipeline: ingest requests sit at the fast
/// end, webhook deliveries with buyer endpoints in the loop at the slow one.
const LATENCY_BUCKETS_SECONDS: &[f64] = &[0.002, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 10.0, 30.0];

/// Bind a `TcpListener` on the provided address and serve a `Router` on it.
/// Intended for the standalone metrics listener of queue workers.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the recorder and add `/metrics` plus request tracking to an
/// existing router.
pub fn setup_metrics_routes(router: Router) -> Router {
    let handle = setup_metrics_recorder();

    router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(axum::middleware::from_fn(track_requests))
}

pub fn setup_metrics_router() -> Router {
    setup_metrics_routes(Router::new())
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS_SECONDS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Per-request counter and latency histogram, labelled by the route template
/// rather than the raw path so lead ids do not explode the cardinality.
pub async fn track_requests(request: Request<Body>, next: Next) -> impl IntoResponse {
    let started = Instant::now();

    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let method = request.method().as_str().to_owned();

    let response = next.run(request).await;

    let labels = [
        ("endpoint", endpoint),
        ("method", method),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("leadgen_http_requests_total", &labels).increment(1);
    metrics::histogram!("leadgen_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}

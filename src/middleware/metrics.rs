use axum::{body::Body, extract::Request, extract::State, middleware::Next, response::Response};
use std::{sync::Arc, time::Instant};

use event_bus::MetricsSink;

pub async fn metrics_middleware(State(metrics): State<Arc<MetricsSink>>, req: Request<Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16().to_string();
    metrics.observe_duration(
        "http_request_duration_seconds",
        &[("path", &path), ("method", &method), ("status", &status)],
        start.elapsed().as_secs_f64(),
    );

    response
}

use axum::{body::Body, extract::Request, middleware::Next, response::Response};
use uuid::Uuid;

const TRACE_ID_HEADER: &str = "x-trace-id";

pub async fn trace_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    request.extensions_mut().insert(trace_id.clone());

    let span = tracing::info_span!("request", trace_id = %trace_id);
    let mut response = tracing::Instrument::instrument(next.run(request), span).await;
    response.headers_mut().insert(
        TRACE_ID_HEADER,
        trace_id.parse().unwrap_or_else(|_| "invalid".parse().unwrap()),
    );
    response
}

//! Request logging middleware.
//!
//! Tags every HTTP request with the session it hit, so one auction's
//! traffic can be followed across the bid, status and boot endpoints with
//! the same `sid` field the engine puts on its own events.

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

use crate::api::AppState;

/// Logs method, path, status and latency plus the current session id and
/// phase (`sid` stays empty until the first boot). Health probes are not
/// logged.
pub async fn request_logging(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    if path == "/health" {
        return next.run(request).await;
    }

    // Session context at arrival; a boot request is attributed to the
    // session it replaces.
    let (sid, session) = {
        let exchange = state.exchange.read();
        match exchange.as_ref() {
            Some(e) => (e.session_id().to_string(), e.session() as u8),
            None => (String::new(), 0),
        }
    };

    let began = Instant::now();
    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = began.elapsed().as_millis() as u64;
    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            sid = %sid,
            session,
            "request failed"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            sid = %sid,
            session,
            "request served"
        );
    }

    response
}

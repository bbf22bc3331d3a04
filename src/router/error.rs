//! Router error types and response handling

use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};

/// Errors that can occur while routing a client request
#[derive(Debug)]
pub(crate) enum RouterError {
    BodyRead(String),
    Upstream(String),
    ResponseBuild(String),
    /// No healthy instance can take this request
    NoHealthyInstance,
    /// The coordination database is down; writes must be refused
    DatabaseUnavailable(String),
    /// Process RSS is over the configured budget; writes are shed
    MemoryPressure,
}

impl IntoResponse for RouterError {
    fn into_response(self) -> Response<Body> {
        let (status, message) = match &self {
            RouterError::BodyRead(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            RouterError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            RouterError::ResponseBuild(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            RouterError::NoHealthyInstance => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no healthy backend instance available".to_string(),
            ),
            RouterError::DatabaseUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("coordination database unavailable: {msg}"),
            ),
            RouterError::MemoryPressure => (
                StatusCode::SERVICE_UNAVAILABLE,
                "write rejected: router under memory pressure".to_string(),
            ),
        };

        tracing::error!("Router error: {} - {}", status, message);

        let mut builder = Response::builder().status(status);
        if matches!(self, RouterError::MemoryPressure) {
            builder = builder
                .header("Retry-After", "30")
                .header("X-Vecgate-Pressure", "memory");
        }

        builder
            .body(Body::from(message))
            .unwrap_or_else(|_| Response::new(Body::from("Internal error building error response")))
    }
}

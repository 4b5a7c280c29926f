//! HTTP front end
//!
//! Endpoints:
//! - `GET /health`
//! - `POST /generate-report` (multipart `image` field or JSON `image_data`)
//! - `GET /model-info`
//!
//! Every request shares one immutable `InferenceContext`; generation runs on
//! Tokio's blocking pool.

mod handlers;
mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::beam::{CancelToken, GenerationControl};
use crate::engine::InferenceContext;

pub use handlers::*;
pub use types::*;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Server state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub context: Arc<InferenceContext>,

    /// Per-request generation deadline
    pub request_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(context: Arc<InferenceContext>) -> Self {
        Self {
            context,
            request_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Control for one request, starting its deadline now
    fn control(&self, token: CancelToken) -> GenerationControl {
        let control = GenerationControl::none().with_cancel(token);
        match self.request_timeout {
            Some(timeout) => control.with_deadline(Instant::now() + timeout),
            None => control,
        }
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/generate-report", post(generate_report))
        .route("/model-info", get(model_info))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already-bound listener until the process stops
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Report server listening on {}", addr);
    }
    axum::serve(listener, build_router(state)).await
}

/// Bind `addr` and serve
pub async fn start_server(addr: &str, state: AppState) -> Result<(), std::io::Error> {
    tracing::info!("Starting report server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

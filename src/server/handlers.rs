//! HTTP request handlers for API endpoints

use axum::{
    body::Bytes,
    extract::{FromRequest, Multipart, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{error, info, warn};

use super::types::{ErrorResponse, GenerateRequest, GenerateResponse, HealthResponse, ModelInfoResponse};
use super::AppState;
use crate::beam::CancelToken;
use crate::ReportError;

/// Where the image came from
enum ImagePayload {
    Bytes(Bytes),
    Base64(String),
}

/// Cancels the generation if the request future is dropped (client gone)
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn status_for(err: &ReportError) -> StatusCode {
    match err {
        _ if err.is_client_error() => StatusCode::BAD_REQUEST,
        ReportError::Cancelled | ReportError::DeadlineExceeded => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        device: "cpu".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Model metadata endpoint
pub async fn model_info(State(state): State<AppState>) -> impl IntoResponse {
    let context = &state.context;
    let generation = context.generation_config();
    Json(ModelInfoResponse {
        vocab_size: context.tokenizer().vocab_size(),
        device: "cpu".to_string(),
        model_loaded: true,
        weights_loaded: context.weights_pretrained(),
        beam_width: generation.beam_width,
        max_steps: generation.max_steps,
    })
}

/// Generate a report for one image
///
/// Accepts either `multipart/form-data` with an `image` file field, or a JSON
/// body `{"image_data": "<base64>"}`.
pub async fn generate_report(State(state): State<AppState>, request: Request) -> Response {
    let payload = match extract_payload(&state, request).await {
        Ok(payload) => payload,
        Err(message) => {
            warn!("Rejected report request: {}", message);
            return error_response(StatusCode::BAD_REQUEST, message);
        }
    };

    let token = CancelToken::new();
    let _guard = CancelOnDrop(token.clone());
    let control = state.control(token);
    let context = state.context.clone();

    // Numeric work runs on the blocking pool, off the async reactor
    let result = tokio::task::spawn_blocking(move || match payload {
        ImagePayload::Bytes(bytes) => context.generate_from_bytes(&bytes, &control),
        ImagePayload::Base64(data) => context.generate_from_base64(&data, &control),
    })
    .await;

    match result {
        Ok(Ok(report)) => {
            info!(
                steps = report.steps,
                finished = report.finished,
                "Report generated"
            );
            Json(GenerateResponse {
                report: report.text,
                status: "success".to_string(),
            })
            .into_response()
        }
        Ok(Err(err)) => {
            let status = status_for(&err);
            if status.is_server_error() {
                error!("Error generating report: {}", err);
            } else {
                warn!("Error generating report: {}", err);
            }
            error_response(status, err.to_string())
        }
        Err(join_err) => {
            error!("Generation task failed: {}", join_err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Generation task failed: {join_err}"),
            )
        }
    }
}

/// Pull the image out of a multipart or JSON request
async fn extract_payload(state: &AppState, request: Request) -> Result<ImagePayload, String> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    if is_multipart {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| format!("Invalid multipart body: {e}"))?;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| format!("Invalid multipart body: {e}"))?
        {
            if field.name() != Some("image") {
                continue;
            }
            if field.file_name() == Some("") {
                return Err("No file selected".to_string());
            }
            let bytes = field
                .bytes()
                .await
                .map_err(|e| format!("Failed to read image field: {e}"))?;
            return Ok(ImagePayload::Bytes(bytes));
        }
        return Err("No image provided".to_string());
    }

    let Json(body) = Json::<GenerateRequest>::from_request(request, state)
        .await
        .map_err(|e| format!("Invalid request body: {}", e.body_text()))?;

    match body.image_data {
        Some(data) if !data.trim().is_empty() => Ok(ImagePayload::Base64(data)),
        _ => Err("No image provided".to_string()),
    }
}

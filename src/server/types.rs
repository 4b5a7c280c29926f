//! API request and response types

use serde::{Deserialize, Serialize};

/// JSON body of `POST /generate-report`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Base64 image, optionally as a `data:image/...;base64,` URL
    #[serde(default)]
    pub image_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub report: String,
    /// Always `"success"`
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub device: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub vocab_size: usize,
    pub device: String,
    pub model_loaded: bool,
    /// False when running on randomly initialized parameters
    pub weights_loaded: bool,
    pub beam_width: usize,
    pub max_steps: usize,
}

/// Body of every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

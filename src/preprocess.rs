//! Image decoding and normalization
//!
//! Raw request payloads (file bytes, base64 strings, `data:` URLs) become a
//! normalized `ImageTensor` in CHW layout, ready for the feature encoder.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ReportError, Result};

/// Resize target and per-channel normalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Images are resized to `input_size x input_size`
    pub input_size: u32,

    /// Subtracted from every [0, 1] pixel value
    pub mean: f32,

    /// Divides every centered pixel value
    pub std: f32,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            input_size: 512,
            mean: 0.5,
            std: 0.5,
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(ReportError::InvalidConfig(
                "input_size must be positive".to_string(),
            ));
        }
        if !self.std.is_finite() || self.std <= 0.0 || !self.mean.is_finite() {
            return Err(ReportError::InvalidConfig(format!(
                "normalization mean ({}) / std ({}) must be finite with std > 0",
                self.mean, self.std
            )));
        }
        Ok(())
    }
}

/// Normalized image in CHW layout
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    channels: usize,
    height: usize,
    width: usize,
}

impl ImageTensor {
    pub fn new(data: Vec<f32>, channels: usize, height: usize, width: usize) -> Result<Self> {
        if data.len() != channels * height * width || data.is_empty() {
            return Err(ReportError::ShapeMismatch {
                what: "image tensor".to_string(),
                expected: vec![channels, height, width],
                got: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            channels,
            height,
            width,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// One channel plane, `[height, width]`
    pub fn channel(&self, c: usize) -> &[f32] {
        let plane = self.height * self.width;
        &self.data[c * plane..(c + 1) * plane]
    }

    /// Decode image bytes and normalize them
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if `bytes` is empty
    /// - `Image` if the bytes are not a supported image format
    pub fn from_bytes(bytes: &[u8], config: &PreprocessConfig) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ReportError::InvalidInput("Empty image payload".to_string()));
        }

        let decoded = image::load_from_memory(bytes)?;
        debug!(
            width = decoded.width(),
            height = decoded.height(),
            "Decoded image"
        );

        let size = config.input_size;
        let rgb = decoded
            .resize_exact(size, size, FilterType::Triangle)
            .to_rgb8();

        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let plane = width * height;
        let mut data = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for (c, &value) in pixel.0.iter().enumerate() {
                let scaled = value as f32 / 255.0;
                data[c * plane + offset] = (scaled - config.mean) / config.std;
            }
        }

        Self::new(data, 3, height, width)
    }

    /// Decode a base64 payload (optionally a `data:image/...;base64,` URL)
    pub fn from_base64(payload: &str, config: &PreprocessConfig) -> Result<Self> {
        let bytes = decode_base64_payload(payload)?;
        Self::from_bytes(&bytes, config)
    }
}

/// Strip an optional `data:` URL header and decode standard base64
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>> {
    let payload = payload.trim();
    let encoded = if payload.starts_with("data:image") {
        payload
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| ReportError::InvalidInput("Malformed data URL".to_string()))?
    } else {
        payload
    };

    if encoded.is_empty() {
        return Err(ReportError::InvalidInput("Empty image payload".to_string()));
    }

    STANDARD
        .decode(encoded)
        .map_err(|e| ReportError::InvalidInput(format!("Invalid base64 image data: {}", e)))
}

//! OCR Types
//!
//! Defines the recognition results returned by the inference service and the
//! error types of the OCR pipeline.

use serde::{Deserialize, Serialize};

/// Image dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// One recognized text region
///
/// The inference service speaks snake_case for some fields; both spellings
/// are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextBlock {
    /// `[x1, y1, x2, y2]` in image pixels
    pub bbox: [i64; 4],
    pub text: String,
    #[serde(default, alias = "text_lines")]
    pub text_lines: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Vertical (tategaki) text
    #[serde(default)]
    pub vertical: bool,
    /// Number of text lines in the block
    #[serde(default)]
    pub lines: i64,
    #[serde(default, alias = "font_size")]
    pub font_size: Option<f64>,
    pub width: i64,
    pub height: i64,
}

fn default_confidence() -> f64 {
    1.0
}

#[cfg(test)]
impl TextBlock {
    /// A block covering a whole image
    pub(crate) fn whole_image(text: String, size: ImageSize) -> Self {
        let width = i64::from(size.width);
        let height = i64::from(size.height);
        Self {
            bbox: [0, 0, width, height],
            text_lines: vec![text.clone()],
            text,
            confidence: default_confidence(),
            vertical: false,
            lines: 1,
            font_size: None,
            width,
            height,
        }
    }
}

/// Successful recognition of one image
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recognition {
    pub blocks: Vec<TextBlock>,
    pub image_size: ImageSize,
}

/// Inference client errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum InferenceError {
    #[error("Inference service unreachable: {0}")]
    Transport(String),

    #[error("Inference service returned {status}: {detail}")]
    Service { status: u16, detail: String },

    #[error("Inference service rejected the image: {0}")]
    Rejected(String),

    #[error("Malformed inference response: {0}")]
    MalformedPayload(String),
}

/// Invalid queue reconfiguration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Concurrency must be between 1 and {max}, got {requested}")]
    InvalidConcurrency { requested: i64, max: usize },
}

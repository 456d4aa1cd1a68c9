//! Inference Client
//!
//! Defines the client trait for the OCR inference service and its HTTP
//! implementation. The service is slow and unreliable; every way a call can
//! go wrong is folded into [`InferenceError`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::types::{ImageSize, InferenceError, Recognition, TextBlock};

/// OCR inference client trait
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Check if the service is reachable
    async fn is_available(&self) -> bool;

    /// Detect and read the text regions of a page image
    ///
    /// `file_name` is only used to pick a MIME type and for service-side
    /// debugging output.
    async fn recognize(&self, image_data: Vec<u8>, file_name: &str) -> Result<Recognition, InferenceError>;
}

/// Client for the `manga-inference` HTTP service
pub struct HttpInferenceClient {
    client: reqwest::Client,
    /// Service base URL, without trailing slash
    base_url: String,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, InferenceError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| InferenceError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn detect_url(&self) -> String {
        format!("{}/ocr/detect", self.base_url)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);

        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn recognize(&self, image_data: Vec<u8>, file_name: &str) -> Result<Recognition, InferenceError> {
        let mime = mime_guess::from_path(file_name)
            .first()
            .filter(|m| m.type_() == mime_guess::mime::IMAGE)
            .unwrap_or(mime_guess::mime::IMAGE_JPEG);

        let part = reqwest::multipart::Part::bytes(image_data)
            .file_name(base_name(file_name))
            .mime_str(mime.as_ref())
            .map_err(|e| InferenceError::Transport(format!("Invalid image MIME type: {}", e)))?;

        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("original_path", file_name.to_string());

        let response = self
            .client
            .post(self.detect_url())
            .multipart(form)
            .send()
            .await
            .map_err(|e| InferenceError::Transport(format!("Failed to call inference service: {}", e)))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| InferenceError::Transport(format!("Failed to read response body: {}", e)))?;

        parse_response(status, &body)
    }
}

fn base_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page.jpg".to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    success: bool,
    #[serde(default)]
    text_blocks: Option<Vec<TextBlock>>,
    #[serde(default)]
    image_size: Option<ImageSize>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Turn a raw service response into a typed result
pub(crate) fn parse_response(status: u16, body: &str) -> Result<Recognition, InferenceError> {
    if !(200..300).contains(&status) {
        return Err(InferenceError::Service {
            status,
            detail: error_detail(body),
        });
    }

    let wire: WireResponse = serde_json::from_str(body)
        .map_err(|e| InferenceError::MalformedPayload(e.to_string()))?;

    if !wire.success {
        return Err(InferenceError::Rejected(
            wire.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }

    let image_size = wire
        .image_size
        .ok_or_else(|| InferenceError::MalformedPayload("missing imageSize".to_string()))?;

    let blocks = wire
        .text_blocks
        .ok_or_else(|| InferenceError::MalformedPayload("missing textBlocks".to_string()))?;

    Ok(Recognition { blocks, image_size })
}

fn error_detail(body: &str) -> String {
    let parsed = serde_json::from_str::<WireErrorBody>(body).ok();

    match parsed {
        Some(WireErrorBody { detail: Some(serde_json::Value::String(s)), .. }) => s,
        Some(WireErrorBody { detail: Some(other), .. }) => other.to_string(),
        Some(WireErrorBody { error: Some(e), .. }) => e,
        _ => "no error detail in response".to_string(),
    }
}

/// Scripted client for tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;

    /// Treats the image bytes as a page label. Labels containing "fail" are
    /// rejected; everything else yields one block echoing the label.
    pub struct ScriptedClient {
        calls: Mutex<Vec<String>>,
        active: Mutex<usize>,
        peak: Mutex<usize>,
        gate: Option<Semaphore>,
    }

    impl ScriptedClient {
        pub fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                active: Mutex::new(0),
                peak: Mutex::new(0),
                gate: None,
            }
        }

        /// Every call waits for a permit from [`ScriptedClient::release`]
        pub fn gated() -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new()
            }
        }

        pub fn release(&self, calls: usize) {
            if let Some(gate) = &self.gate {
                gate.add_permits(calls);
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        pub fn peak_concurrency(&self) -> usize {
            *self.peak.lock()
        }

        /// Forget the recorded peak; calls running now still count
        pub fn reset_peak(&self) {
            let active = self.active.lock();
            *self.peak.lock() = *active;
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn is_available(&self) -> bool {
            true
        }

        async fn recognize(&self, image_data: Vec<u8>, _file_name: &str) -> Result<Recognition, InferenceError> {
            let label = String::from_utf8_lossy(&image_data).into_owned();
            self.calls.lock().push(label.clone());
            {
                let mut active = self.active.lock();
                *active += 1;
                let mut peak = self.peak.lock();
                *peak = (*peak).max(*active);
            }

            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            *self.active.lock() -= 1;

            if label.contains("fail") {
                return Err(InferenceError::Rejected(format!("cannot read {}", label)));
            }

            let size = ImageSize { width: 640, height: 960 };
            Ok(Recognition {
                blocks: vec![TextBlock::whole_image(label, size)],
                image_size: size,
            })
        }
    }
}

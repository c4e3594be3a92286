use std::path::Path;

use serde::{Deserialize, Serialize};

pub const NO_IMAGE_GENERATED: &str = "No image generated";
pub const NO_IMAGES_PROVIDED: &str = "No images provided";
pub const INTERNAL_SERVER_ERROR: &str = "Internal server error";

/// Outcome of one submitted image.
///
/// Created once, by the relay or by the orchestrator when the relay could not
/// be reached, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    pub original_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationResult {
    pub fn succeeded(original_name: impl Into<String>, image_data: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            success: true,
            image_data: Some(image_data.into()),
            error: None,
        }
    }

    pub fn failed(original_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            original_name: original_name.into(),
            success: false,
            image_data: None,
            error: Some(error.into()),
        }
    }

    /// File name a downloaded result is saved under. Only the last path
    /// component of `original_name` is used.
    pub fn download_file_name(&self) -> String {
        let base = Path::new(&self.original_name)
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("image");
        format!("model_wearing_{base}")
    }
}

/// `200` body of the relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub results: Vec<GenerationResult>,
}

/// `4xx`/`5xx` body of the relay endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

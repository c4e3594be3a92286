use std::time::Duration;

use crate::non_empty_env;

pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4.1";
pub const DEFAULT_PROVIDER: &str = "openai";
/// Mirrors the hosting ceiling the one-image-per-request design works around.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024 + 512 * 1024;

/// Everything the relay needs at process start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub provider: String,
    pub model: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub max_request_bytes: usize,
    pub request_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            api_key: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            request_timeout: None,
        }
    }
}

impl RelayConfig {
    /// Defaults overlaid with `OPENAI_API_KEY` and `OPENAI_API_BASE`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.api_key = non_empty_env("OPENAI_API_KEY");
        if let Some(base) = non_empty_env("OPENAI_API_BASE") {
            config.api_base = base;
        }
        config.api_base = config.api_base.trim_end_matches('/').to_string();
        config
    }
}

//! Compression, relay and upload orchestration for flatlay images.

pub mod compress;
pub mod config;
pub mod generators;
pub mod orchestrator;
pub mod relay;

pub use compress::{
    compress, prepare_upload, CompressionOutcome, CompressionSettings, PreparedItem,
};
pub use config::RelayConfig;
pub use generators::{
    default_generator_registry, DryrunGenerator, GenerationRequest, GeneratorRegistry,
    ImageGenerator, OpenAiResponsesGenerator,
};
pub use orchestrator::{
    HttpRelayClient, Orchestrator, OrchestratorConfig, RelayTransport, TransportError,
};
pub use relay::{router, serve, RelayError, RelayState, GENERATE_ROUTE};

use std::env;

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Joins an error and its causes into one line, skipping repeats.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

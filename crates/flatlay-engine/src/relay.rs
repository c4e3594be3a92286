//! The `POST /api/generate-model-images` relay.
//!
//! Stateless: each request reads its `images` parts, forwards them one at a
//! time to the injected generator and answers with one result per part.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::multipart::{Multipart, MultipartRejection};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flatlay_contracts::results::{
    ErrorResponse, GenerateResponse, GenerationResult, INTERNAL_SERVER_ERROR, NO_IMAGES_PROVIDED,
    NO_IMAGE_GENERATED,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::error_chain_text;
use crate::generators::{GenerationRequest, ImageGenerator};

pub const GENERATE_ROUTE: &str = "/api/generate-model-images";
pub const IMAGES_FIELD: &str = "images";

const ITEM_ERROR_MAX_CHARS: usize = 1024;

#[derive(Clone)]
pub struct RelayState {
    generator: Arc<dyn ImageGenerator>,
}

impl RelayState {
    pub fn new(generator: Arc<dyn ImageGenerator>) -> Self {
        Self { generator }
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("No images provided")]
    NoImages,
    #[error("{0}")]
    MalformedRequest(String),
    #[error("relay task failed: {0}")]
    Internal(String),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            RelayError::NoImages => (StatusCode::BAD_REQUEST, NO_IMAGES_PROVIDED.to_string()),
            RelayError::MalformedRequest(detail) => (StatusCode::BAD_REQUEST, detail.clone()),
            RelayError::Internal(detail) => {
                tracing::error!(error = %detail, "Error in generate-model-images relay");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_SERVER_ERROR.to_string(),
                )
            }
        };
        (status, Json(ErrorResponse::new(message))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePart {
    pub original_name: String,
    pub bytes: Vec<u8>,
}

pub fn router(state: RelayState, max_request_bytes: usize) -> Router {
    Router::new()
        .route(GENERATE_ROUTE, post(generate_model_images))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves the relay on `listener` until Ctrl-C.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: RelayState,
    max_request_bytes: usize,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state, max_request_bytes))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server failed")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed installing Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down relay");
}

async fn healthz() -> &'static str {
    "ok"
}

async fn generate_model_images(
    State(state): State<RelayState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<GenerateResponse>, RelayError> {
    let multipart = multipart.map_err(|rejection| RelayError::MalformedRequest(rejection.body_text()))?;
    let parts = read_image_parts(multipart).await?;
    if parts.is_empty() {
        return Err(RelayError::NoImages);
    }

    let count = parts.len();
    let generator = state.generator.clone();
    let mut batch = AbortOnDrop(tokio::spawn(async move {
        relay_images(generator.as_ref(), parts).await
    }));
    let results = (&mut batch.0)
        .await
        .map_err(|err| RelayError::Internal(err.to_string()))?;

    let succeeded = results.iter().filter(|result| result.success).count();
    tracing::info!(
        images = count,
        succeeded,
        generator = state.generator_name(),
        "relayed batch"
    );
    Ok(Json(GenerateResponse { results }))
}

/// Stops a relay batch when the request that started it goes away.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn read_image_parts(mut multipart: Multipart) -> Result<Vec<ImagePart>, RelayError> {
    let mut parts = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| RelayError::MalformedRequest(err.to_string()))?
    {
        if field.name() != Some(IMAGES_FIELD) {
            continue;
        }
        let original_name = field
            .file_name()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or("image")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|err| RelayError::MalformedRequest(err.to_string()))?;
        parts.push(ImagePart {
            original_name,
            bytes: bytes.to_vec(),
        });
    }
    Ok(parts)
}

/// Forwards each part in order; a failing part never stops the ones after it.
pub async fn relay_images(
    generator: &dyn ImageGenerator,
    parts: Vec<ImagePart>,
) -> Vec<GenerationResult> {
    let mut results = Vec::with_capacity(parts.len());
    for part in parts {
        results.push(relay_one(generator, part).await);
    }
    results
}

async fn relay_one(generator: &dyn ImageGenerator, part: ImagePart) -> GenerationResult {
    let request = GenerationRequest::for_garment(&part.original_name, &part.bytes);
    match generator.generate(&request).await {
        Ok(Some(image_data)) => GenerationResult::succeeded(part.original_name, image_data),
        Ok(None) => GenerationResult::failed(part.original_name, NO_IMAGE_GENERATED),
        Err(err) => {
            let detail = error_chain_text(&err, ITEM_ERROR_MAX_CHARS);
            tracing::warn!(name = %part.original_name, error = %detail, "image generation failed");
            let message = format!("Error processing {}: {detail}", part.original_name);
            GenerationResult::failed(part.original_name, message)
        }
    }
}

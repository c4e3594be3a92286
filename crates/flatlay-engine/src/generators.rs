//! Image generators the relay can forward a flatlay to.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use reqwest::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::RelayConfig;
use crate::truncate_text;

pub const GARMENT_PROMPT: &str = "Generate a photorealistic image of the clothing item from the \
reference picture being worn by a model on a clean white background. The model should be posed \
naturally and the lighting should be professional and even, similar to an e-commerce product photo.";

/// The inlined image is always declared as JPEG to the provider.
const INPUT_IMAGE_MIME: &str = "image/jpeg";
const DRYRUN_SIZE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub original_name: String,
    pub prompt: String,
    pub image_base64: String,
}

impl GenerationRequest {
    pub fn for_garment(original_name: impl Into<String>, image_bytes: &[u8]) -> Self {
        Self {
            original_name: original_name.into(),
            prompt: GARMENT_PROMPT.to_string(),
            image_base64: BASE64.encode(image_bytes),
        }
    }

    pub fn data_url(&self) -> String {
        format!("data:{INPUT_IMAGE_MIME};base64,{}", self.image_base64)
    }
}

#[async_trait]
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Base64 of the first generated image, `None` if the provider made none.
    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>>;
}

#[derive(Default, Clone)]
pub struct GeneratorRegistry {
    generators: BTreeMap<String, Arc<dyn ImageGenerator>>,
}

impl GeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.generators
            .insert(generator.name().to_string(), Arc::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageGenerator>> {
        self.generators.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }
}

pub fn default_generator_registry(config: &RelayConfig) -> Result<GeneratorRegistry> {
    let mut registry = GeneratorRegistry::new();
    registry.register(DryrunGenerator);
    registry.register(OpenAiResponsesGenerator::from_config(config)?);
    Ok(registry)
}

/// Calls the OpenAI "create a response" API with the image-generation tool.
pub struct OpenAiResponsesGenerator {
    api_base: String,
    api_key: Option<String>,
    model: String,
    http: HttpClient,
}

impl OpenAiResponsesGenerator {
    pub fn new(
        http: HttpClient,
        api_base: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            http,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let mut builder = HttpClient::builder();
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed building OpenAI http client")?;
        Ok(Self::new(
            http,
            config.api_base.clone(),
            config.api_key.clone(),
            config.model.clone(),
        ))
    }

    pub fn build_payload(&self, request: &GenerationRequest) -> Value {
        json!({
            "model": self.model,
            "input": [{
                "role": "user",
                "content": [
                    { "type": "input_text", "text": request.prompt },
                    {
                        "type": "input_image",
                        "image_url": request.data_url(),
                        "detail": "high",
                    },
                ],
            }],
            "tools": [{ "type": "image_generation" }],
        })
    }

    async fn post_json(&self, endpoint: &str, api_key: &str, payload: &Value) -> Result<Value> {
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("OpenAI request failed ({endpoint})"))?;
        response_json_or_error("OpenAI", response).await
    }
}

#[async_trait]
impl ImageGenerator for OpenAiResponsesGenerator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("OPENAI_API_KEY not set");
        };
        let endpoint = format!("{}/responses", self.api_base);
        let payload = self.build_payload(request);
        let response = self.post_json(&endpoint, api_key, &payload).await?;
        let image = first_image_generation_result(&response);
        if image.is_none() {
            tracing::debug!(
                name = %request.original_name,
                "OpenAI response carried no image_generation_call result"
            );
        }
        Ok(image)
    }
}

/// The first non-empty `result` among the `image_generation_call` items of a
/// response's `output`.
pub fn first_image_generation_result(response: &Value) -> Option<String> {
    response
        .get("output")
        .and_then(Value::as_array)?
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("image_generation_call"))
        .find_map(|item| {
            item.get("result")
                .and_then(Value::as_str)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string)
        })
}

async fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .await
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{provider} returned invalid JSON payload"))
}

/// Offline generator: a flat colour swatch keyed on the input image.
pub struct DryrunGenerator;

#[async_trait]
impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Option<String>> {
        let (r, g, b) = color_from_input(&request.prompt, &request.image_base64);
        let image = RgbImage::from_pixel(DRYRUN_SIZE, DRYRUN_SIZE, Rgb([r, g, b]));
        let mut bytes = Cursor::new(Vec::new());
        image
            .write_to(&mut bytes, ImageFormat::Png)
            .context("dryrun png encode failed")?;
        Ok(Some(BASE64.encode(bytes.into_inner())))
    }
}

fn color_from_input(prompt: &str, image_base64: &str) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(image_base64.as_bytes());
    let digest = hasher.finalize();
    tracing::trace!(digest = %hex::encode(&digest[..4]), "dryrun swatch");
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use base64::Engine as _;
    use serde_json::{json, Value};

    use crate::config::RelayConfig;

    use super::{
        default_generator_registry, first_image_generation_result, DryrunGenerator,
        GenerationRequest, ImageGenerator, OpenAiResponsesGenerator, BASE64, GARMENT_PROMPT,
    };

    type Captured = Arc<Mutex<Vec<(Option<String>, Value)>>>;

    async fn spawn_mock_api(status: StatusCode, body: Value) -> anyhow::Result<(String, Captured)> {
        let captured: Captured = Arc::default();
        let sink = captured.clone();
        let app = Router::new().route(
            "/v1/responses",
            post(move |headers: HeaderMap, Json(payload): Json<Value>| {
                let sink = sink.clone();
                let body = body.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    sink.lock().unwrap().push((auth, payload));
                    (status, Json(body))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Ok((format!("http://{addr}/v1"), captured))
    }

    fn generator(api_base: &str, api_key: Option<&str>) -> OpenAiResponsesGenerator {
        OpenAiResponsesGenerator::new(
            reqwest::Client::new(),
            api_base,
            api_key.map(str::to_string),
            "gpt-4.1",
        )
    }

    #[test]
    fn payload_inlines_image_with_high_detail_and_image_tool() {
        let request = GenerationRequest::for_garment("shirt.jpg", b"raw-bytes");
        let payload = generator("http://unused/v1", Some("k")).build_payload(&request);

        assert_eq!(payload["model"], json!("gpt-4.1"));
        let content = &payload["input"][0]["content"];
        assert_eq!(content[0]["type"], json!("input_text"));
        assert_eq!(content[0]["text"], json!(GARMENT_PROMPT));
        assert_eq!(content[1]["type"], json!("input_image"));
        assert_eq!(content[1]["detail"], json!("high"));
        assert_eq!(
            content[1]["image_url"],
            json!(format!("data:image/jpeg;base64,{}", BASE64.encode(b"raw-bytes")))
        );
        assert_eq!(payload["tools"], json!([{ "type": "image_generation" }]));
    }

    #[test]
    fn first_result_wins_and_other_outputs_are_ignored() {
        let response = json!({
            "output": [
                { "type": "message", "content": [] },
                { "type": "image_generation_call", "result": "first" },
                { "type": "image_generation_call", "result": "second" },
            ]
        });
        assert_eq!(
            first_image_generation_result(&response).as_deref(),
            Some("first")
        );
        let blank_first = json!({
            "output": [
                { "type": "image_generation_call", "result": "" },
                { "type": "image_generation_call", "result": null },
                { "type": "image_generation_call", "result": "third" },
            ]
        });
        assert_eq!(
            first_image_generation_result(&blank_first).as_deref(),
            Some("third")
        );
        assert_eq!(first_image_generation_result(&json!({ "output": [] })), None);
        assert_eq!(first_image_generation_result(&json!({})), None);
    }

    #[tokio::test]
    async fn missing_api_key_fails_at_call_time() {
        let request = GenerationRequest::for_garment("a.jpg", b"x");
        let err = generator("http://127.0.0.1:9/v1", None)
            .generate(&request)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "OPENAI_API_KEY not set");
    }

    #[tokio::test]
    async fn generate_posts_bearer_request_and_extracts_image() -> anyhow::Result<()> {
        let (base, captured) = spawn_mock_api(
            StatusCode::OK,
            json!({ "output": [{ "type": "image_generation_call", "result": "aW1n" }] }),
        )
        .await?;
        let request = GenerationRequest::for_garment("a.jpg", b"x");

        let image = generator(&base, Some("sk-test")).generate(&request).await?;
        assert_eq!(image.as_deref(), Some("aW1n"));

        let calls = captured.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_deref(), Some("Bearer sk-test"));
        assert_eq!(calls[0].1["tools"][0]["type"], json!("image_generation"));
        Ok(())
    }

    #[tokio::test]
    async fn generate_reports_no_image_as_none() -> anyhow::Result<()> {
        let (base, _) = spawn_mock_api(
            StatusCode::OK,
            json!({ "output": [{ "type": "message", "content": [] }] }),
        )
        .await?;
        let request = GenerationRequest::for_garment("a.jpg", b"x");
        let image = generator(&base, Some("sk-test")).generate(&request).await?;
        assert!(image.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn non_success_status_becomes_error_with_body() -> anyhow::Result<()> {
        let (base, _) = spawn_mock_api(
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "error": { "message": "rate limited" } }),
        )
        .await?;
        let request = GenerationRequest::for_garment("a.jpg", b"x");
        let err = generator(&base, Some("sk-test"))
            .generate(&request)
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("OpenAI request failed (429)"), "{text}");
        assert!(text.contains("rate limited"));
        Ok(())
    }

    #[test]
    fn default_registry_offers_dryrun_and_openai() -> anyhow::Result<()> {
        let registry = default_generator_registry(&RelayConfig::default())?;
        assert_eq!(registry.names(), vec!["dryrun", "openai"]);
        assert_eq!(registry.get("openai").map(|g| g.name().to_string()).as_deref(), Some("openai"));
        assert!(registry.get("missing").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn dryrun_is_deterministic_png() -> anyhow::Result<()> {
        let request = GenerationRequest::for_garment("a.jpg", b"flatlay");
        let first = DryrunGenerator.generate(&request).await?.unwrap_or_default();
        let second = DryrunGenerator.generate(&request).await?.unwrap_or_default();
        assert_eq!(first, second);

        let decoded = image::load_from_memory(&BASE64.decode(first)?)?;
        assert_eq!((decoded.width(), decoded.height()), (256, 256));
        Ok(())
    }
}

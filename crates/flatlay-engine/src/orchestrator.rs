//! Client side of the relay: compresses each selected file, submits it on its
//! own request and publishes progress plus the growing result list.

use anyhow::{bail, Result};
use async_trait::async_trait;
use flatlay_contracts::events::{EventWriter, RunEvent};
use flatlay_contracts::progress::{ProgressState, RunSnapshot};
use flatlay_contracts::results::{ErrorResponse, GenerateResponse, GenerationResult};
use flatlay_contracts::upload::UploadItem;
use futures::stream::{self, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::Client as HttpClient;
use thiserror::Error;
use tokio::sync::watch;

use crate::compress::{prepare_upload, CompressionOutcome, CompressionSettings, PreparedItem};
use crate::relay::{GENERATE_ROUTE, IMAGES_FIELD};

pub const GENERIC_FAILURE: &str = "Failed to generate image. Please try again.";
pub const EMPTY_REPLY: &str = "Relay returned no result for this image";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay responded with status {status}")]
    Status { status: u16, message: Option<String> },
    #[error("relay request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl TransportError {
    /// The relay's own error text when it sent one, else a generic message.
    pub fn user_message(&self) -> String {
        match self {
            TransportError::Status {
                message: Some(message),
                ..
            } => message.clone(),
            _ => GENERIC_FAILURE.to_string(),
        }
    }
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn submit(&self, item: &UploadItem) -> Result<Vec<GenerationResult>, TransportError>;
}

/// Posts one `images` part per request to a running relay.
pub struct HttpRelayClient {
    endpoint: String,
    http: HttpClient,
}

impl HttpRelayClient {
    pub fn new(http: HttpClient, base_url: &str) -> Self {
        Self {
            endpoint: format!("{}{GENERATE_ROUTE}", base_url.trim().trim_end_matches('/')),
            http,
        }
    }

    pub fn from_base_url(base_url: &str) -> Self {
        Self::new(HttpClient::new(), base_url)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RelayTransport for HttpRelayClient {
    async fn submit(&self, item: &UploadItem) -> Result<Vec<GenerationResult>, TransportError> {
        let part = Part::bytes(item.bytes.clone())
            .file_name(item.name.clone())
            .mime_str(&item.mime_type)?;
        let form = Form::new().part(IMAGES_FIELD, part);
        let response = self.http.post(&self.endpoint).multipart(form).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .ok()
                .map(|parsed| parsed.error)
                .filter(|error| !error.trim().is_empty());
            return Err(TransportError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        Ok(parsed.results)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Requests in flight at once. 1 keeps every request under the relay's
    /// body limit and reports progress strictly in order.
    pub concurrency: usize,
    pub compression: CompressionSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            compression: CompressionSettings::default(),
        }
    }
}

pub struct Orchestrator<T: RelayTransport> {
    transport: T,
    config: OrchestratorConfig,
    state: watch::Sender<RunSnapshot>,
    events: Option<EventWriter>,
}

impl<T: RelayTransport> Orchestrator<T> {
    pub fn new(transport: T, config: OrchestratorConfig) -> Self {
        let (state, _) = watch::channel(RunSnapshot::default());
        Self {
            transport,
            config,
            state,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.borrow().clone()
    }

    /// Attempts every item exactly once and returns one or more results per
    /// item, in submission order. Failures never stop the run.
    pub async fn run(&self, items: Vec<UploadItem>) -> Result<Vec<GenerationResult>> {
        let total = items.len();
        let started = self.state.send_if_modified(|snapshot| {
            if snapshot.in_progress {
                return false;
            }
            *snapshot = RunSnapshot {
                progress: ProgressState::start(total),
                results: Vec::new(),
                in_progress: true,
            };
            true
        });
        if !started {
            bail!("an upload run is already in progress");
        }
        let guard = RunGuard { state: &self.state };

        let concurrency = self.config.concurrency.max(1);
        self.emit(RunEvent::RunStarted { total, concurrency });
        tracing::info!(total, concurrency, "upload run started");

        let mut outcomes = stream::iter(items.into_iter().enumerate())
            .map(|(index, item)| self.process_item(index, item))
            .buffered(concurrency);
        while let Some((index, records)) = outcomes.next().await {
            for record in &records {
                self.emit(RunEvent::ResultRecorded {
                    index,
                    name: record.original_name.clone(),
                    success: record.success,
                    error: record.error.clone(),
                });
            }
            self.state
                .send_modify(|snapshot| snapshot.results.extend(records));
        }

        let results = self.state.borrow().results.clone();
        drop(guard);

        let succeeded = results.iter().filter(|result| result.success).count();
        let failed = results.len() - succeeded;
        self.emit(RunEvent::RunFinished {
            total,
            succeeded,
            failed,
        });
        tracing::info!(total, succeeded, failed, "upload run finished");
        Ok(results)
    }

    async fn process_item(&self, index: usize, item: UploadItem) -> (usize, Vec<GenerationResult>) {
        self.state.send_modify(|snapshot| snapshot.progress.advance());
        let name = item.name.clone();
        self.emit(RunEvent::ItemStarted {
            index,
            name: name.clone(),
            bytes: item.len(),
        });

        let settings = self.config.compression;
        let prepared =
            match tokio::task::spawn_blocking(move || prepare_upload(item, &settings)).await {
                Ok(prepared) => prepared,
                Err(err) => {
                    tracing::error!(name = %name, error = %err, "compression task failed");
                    let message = format!("Error preparing {name}: {err}");
                    return (index, vec![GenerationResult::failed(name, message)]);
                }
            };
        self.record_compression(index, &prepared);

        let records = match self.transport.submit(&prepared.item).await {
            Ok(records) if records.is_empty() => vec![GenerationResult::failed(name, EMPTY_REPLY)],
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(name = %name, error = %err, "relay submission failed");
                vec![GenerationResult::failed(name, err.user_message())]
            }
        };
        (index, records)
    }

    fn record_compression(&self, index: usize, prepared: &PreparedItem) {
        match &prepared.outcome {
            CompressionOutcome::Untouched => {}
            CompressionOutcome::Compressed {
                original_bytes,
                quality,
                attempts,
                over_budget,
                ..
            } => {
                let final_bytes = prepared.item.len();
                if *over_budget {
                    tracing::warn!(
                        name = %prepared.item.name,
                        final_bytes,
                        target_bytes = self.config.compression.target_bytes,
                        "image still over budget at the quality floor"
                    );
                } else {
                    tracing::debug!(
                        name = %prepared.item.name,
                        original_bytes,
                        final_bytes,
                        quality,
                        "image compressed"
                    );
                }
                self.emit(RunEvent::ItemCompressed {
                    index,
                    name: prepared.item.name.clone(),
                    original_bytes: *original_bytes,
                    final_bytes,
                    quality: *quality,
                    attempts: *attempts,
                    over_budget: *over_budget,
                });
            }
            CompressionOutcome::Fallback { reason } => {
                tracing::warn!(
                    name = %prepared.item.name,
                    reason = %reason,
                    "compression skipped, sending original bytes"
                );
            }
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(events) = &self.events {
            if let Err(err) = events.emit(&event) {
                tracing::warn!(error = %err, "failed writing run event");
            }
        }
    }
}

/// Returns the orchestrator to idle when a run ends, including when the run
/// future is dropped before completing.
struct RunGuard<'a> {
    state: &'a watch::Sender<RunSnapshot>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|snapshot| {
            snapshot.progress.reset();
            snapshot.in_progress = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use flatlay_contracts::events::EventWriter;
    use flatlay_contracts::progress::{ProgressState, RunSnapshot};
    use flatlay_contracts::results::GenerationResult;
    use flatlay_contracts::upload::UploadItem;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::Value;
    use tokio::sync::{watch, Notify};

    use super::{
        HttpRelayClient, Orchestrator, OrchestratorConfig, RelayTransport, TransportError,
        EMPTY_REPLY, GENERIC_FAILURE,
    };
    use crate::compress::CompressionSettings;
    use crate::relay::tests::ScriptedGenerator;
    use crate::relay::{router, RelayState};

    #[derive(Default)]
    struct StubTransport {
        submitted: Mutex<Vec<UploadItem>>,
        observed: Mutex<Vec<ProgressState>>,
        published: Mutex<Vec<usize>>,
        progress: Mutex<Option<watch::Receiver<RunSnapshot>>>,
        gate: Option<Arc<Notify>>,
    }

    impl StubTransport {
        fn watch(&self, receiver: watch::Receiver<RunSnapshot>) {
            *self.progress.lock().unwrap() = Some(receiver);
        }
    }

    #[async_trait]
    impl RelayTransport for StubTransport {
        async fn submit(&self, item: &UploadItem) -> Result<Vec<GenerationResult>, TransportError> {
            self.submitted.lock().unwrap().push(item.clone());
            if let Some(receiver) = self.progress.lock().unwrap().as_ref() {
                let snapshot = receiver.borrow();
                self.observed.lock().unwrap().push(snapshot.progress);
                self.published.lock().unwrap().push(snapshot.results.len());
            }
            if item.name.starts_with("hang") {
                std::future::pending::<()>().await;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = item.name.strip_prefix("sleep-") {
                let millis: u64 = delay.split('.').next().unwrap_or("0").parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
            }
            match item.name.as_str() {
                name if name.starts_with("reject") => Err(TransportError::Status {
                    status: 400,
                    message: Some("No images provided".to_string()),
                }),
                name if name.starts_with("down") => Err(TransportError::Status {
                    status: 502,
                    message: None,
                }),
                name if name.starts_with("silent") => Ok(Vec::new()),
                name => Ok(vec![GenerationResult::succeeded(name, format!("img-{name}"))]),
            }
        }
    }

    fn item(name: &str) -> UploadItem {
        UploadItem::new(name, vec![1, 2, 3], "image/png")
    }

    fn png_item(name: &str, side: u32) -> anyhow::Result<UploadItem> {
        let image = RgbImage::from_fn(side, side, |x, y| Rgb([(x * 7) as u8, (y * 13) as u8, 99]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png)?;
        Ok(UploadItem::new(name, bytes.into_inner(), "image/png"))
    }

    #[tokio::test]
    async fn every_item_yields_a_result_in_submission_order() -> anyhow::Result<()> {
        let orchestrator = Orchestrator::new(StubTransport::default(), OrchestratorConfig::default());
        orchestrator.transport().watch(orchestrator.subscribe());

        let results = orchestrator
            .run(vec![item("shirt.jpg"), item("reject.jpg"), item("dress.jpg")])
            .await?;

        let names: Vec<&str> = results.iter().map(|r| r.original_name.as_str()).collect();
        assert_eq!(names, vec!["shirt.jpg", "reject.jpg", "dress.jpg"]);
        assert!(results[0].success);
        assert!(!results[1].success);
        assert_eq!(results[1].error.as_deref(), Some("No images provided"));
        assert!(results[2].success);

        let observed = orchestrator.transport().observed.lock().unwrap().clone();
        assert_eq!(
            observed,
            vec![
                ProgressState { current: 1, total: 3 },
                ProgressState { current: 2, total: 3 },
                ProgressState { current: 3, total: 3 },
            ]
        );
        let published = orchestrator.transport().published.lock().unwrap().clone();
        assert_eq!(published, vec![0, 1, 2]);

        let snapshot = orchestrator.snapshot();
        assert!(!snapshot.in_progress);
        assert_eq!(snapshot.progress, ProgressState::default());
        assert_eq!(snapshot.results, results);
        Ok(())
    }

    #[tokio::test]
    async fn transport_failures_without_body_get_generic_message() -> anyhow::Result<()> {
        let orchestrator = Orchestrator::new(StubTransport::default(), OrchestratorConfig::default());
        let results = orchestrator.run(vec![item("down.jpg"), item("silent.jpg")]).await?;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].error.as_deref(), Some(GENERIC_FAILURE));
        assert_eq!(results[1].original_name, "silent.jpg");
        assert_eq!(results[1].error.as_deref(), Some(EMPTY_REPLY));
        Ok(())
    }

    #[tokio::test]
    async fn large_files_are_compressed_before_submission() -> anyhow::Result<()> {
        let config = OrchestratorConfig {
            concurrency: 1,
            compression: CompressionSettings {
                trigger_bytes: 64,
                target_bytes: usize::MAX,
                max_dimension: 32,
            },
        };
        let orchestrator = Orchestrator::new(StubTransport::default(), config);
        let small = UploadItem::new("small.png", vec![9; 10], "image/png");
        orchestrator
            .run(vec![png_item("big.png", 64)?, small.clone()])
            .await?;

        let submitted = orchestrator.transport().submitted.lock().unwrap().clone();
        assert_eq!(submitted[0].name, "big.png");
        assert_eq!(submitted[0].mime_type, "image/jpeg");
        let decoded = image::load_from_memory(&submitted[0].bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (32, 32));
        assert_eq!(submitted[1], small);
        Ok(())
    }

    #[tokio::test]
    async fn parallel_runs_still_publish_in_submission_order() -> anyhow::Result<()> {
        let config = OrchestratorConfig {
            concurrency: 3,
            ..OrchestratorConfig::default()
        };
        let orchestrator = Orchestrator::new(StubTransport::default(), config);
        let results = orchestrator
            .run(vec![item("sleep-60.jpg"), item("sleep-20.jpg"), item("sleep-1.jpg")])
            .await?;
        let names: Vec<&str> = results.iter().map(|r| r.original_name.as_str()).collect();
        assert_eq!(names, vec!["sleep-60.jpg", "sleep-20.jpg", "sleep-1.jpg"]);
        Ok(())
    }

    #[tokio::test]
    async fn second_run_is_refused_while_one_is_in_flight() -> anyhow::Result<()> {
        let gate = Arc::new(Notify::new());
        let transport = StubTransport {
            gate: Some(gate.clone()),
            ..StubTransport::default()
        };
        let orchestrator = Orchestrator::new(transport, OrchestratorConfig::default());
        let mut watcher = orchestrator.subscribe();

        let (first, second) = tokio::join!(orchestrator.run(vec![item("a.jpg")]), async {
            watcher.wait_for(|snapshot| snapshot.in_progress).await?;
            let refused = orchestrator.run(vec![item("b.jpg")]).await;
            gate.notify_one();
            anyhow::Ok(refused)
        });

        assert_eq!(first?.len(), 1);
        let err = second?.unwrap_err();
        assert!(err.to_string().contains("already in progress"));
        Ok(())
    }

    #[tokio::test]
    async fn dropped_run_leaves_the_orchestrator_reusable() -> anyhow::Result<()> {
        let orchestrator = Orchestrator::new(StubTransport::default(), OrchestratorConfig::default());
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            orchestrator.run(vec![item("hang.jpg")]),
        )
        .await;
        assert!(abandoned.is_err());

        let snapshot = orchestrator.snapshot();
        assert!(!snapshot.in_progress);
        assert_eq!(snapshot.progress, ProgressState::default());

        let results = orchestrator.run(vec![item("shirt.jpg")]).await?;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        Ok(())
    }

    #[tokio::test]
    async fn end_to_end_through_a_live_relay() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = router(RelayState::new(Arc::new(ScriptedGenerator)), 1 << 20);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let client = HttpRelayClient::new(reqwest::Client::new(), &format!("http://{addr}/"));
        let orchestrator = Orchestrator::new(client, OrchestratorConfig::default())
            .with_events(EventWriter::new(&events_path, "run-e2e"));

        let results = orchestrator
            .run(vec![item("shirt.jpg"), item("fail-pants.jpg"), item("dress.jpg")])
            .await?;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].image_data.as_deref(), Some("img-shirt.jpg"));
        assert_eq!(
            results[1].error.as_deref(),
            Some("Error processing fail-pants.jpg: provider exploded")
        );
        assert!(results[2].success);

        let raw = std::fs::read_to_string(events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("run_started"));
        assert_eq!(types.last().map(String::as_str), Some("run_finished"));
        assert_eq!(types.iter().filter(|t| *t == "result_recorded").count(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_relay_yields_generic_failure_per_item() -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let client = HttpRelayClient::new(reqwest::Client::new(), &format!("http://{addr}"));
        assert!(client.endpoint().ends_with("/api/generate-model-images"));
        let orchestrator = Orchestrator::new(client, OrchestratorConfig::default());
        let results = orchestrator.run(vec![item("a.jpg"), item("b.jpg")]).await?;

        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| !r.success && r.error.as_deref() == Some(GENERIC_FAILURE)));
        Ok(())
    }
}

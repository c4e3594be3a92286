use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use flatlay_contracts::events::EventWriter;
use flatlay_contracts::progress::{ProgressState, RunSnapshot};
use flatlay_contracts::results::GenerationResult;
use flatlay_contracts::runs::summary::{write_summary, RunSummary};
use flatlay_contracts::upload::UploadItem;
use flatlay_engine::compress::{
    compress, CompressionOutcome, CompressionSettings, COMPRESSION_TRIGGER_BYTES,
    DEFAULT_MAX_DIMENSION, DEFAULT_TARGET_BYTES,
};
use flatlay_engine::config::{DEFAULT_MAX_REQUEST_BYTES, DEFAULT_MODEL, DEFAULT_PROVIDER};
use flatlay_engine::{
    default_generator_registry, serve, HttpRelayClient, Orchestrator, OrchestratorConfig,
    RelayConfig, RelayState,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "flatlay",
    version,
    about = "Turn clothing flatlay photos into on-model product shots"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the generation relay.
    Serve(ServeArgs),
    /// Upload flatlays to a relay and save the generated images.
    Generate(GenerateArgs),
    /// Shrink one image the way uploads are shrunk.
    Compress(CompressArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long, default_value = DEFAULT_PROVIDER)]
    provider: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long, default_value_t = DEFAULT_MAX_REQUEST_BYTES)]
    max_request_bytes: usize,
    #[arg(long)]
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,
    #[arg(long, default_value = "http://127.0.0.1:3000")]
    endpoint: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = 1)]
    concurrency: usize,
    #[arg(long, default_value_t = DEFAULT_TARGET_BYTES)]
    target_bytes: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION)]
    max_dimension: u32,
    #[arg(long)]
    events: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct CompressArgs {
    file: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = DEFAULT_TARGET_BYTES)]
    target_bytes: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_DIMENSION)]
    max_dimension: u32,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("flatlay error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => async_runtime()?.block_on(run_serve(args)).map(|()| 0),
        Command::Generate(args) => async_runtime()?.block_on(run_generate(args)),
        Command::Compress(args) => run_compress(args),
    }
}

fn async_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed starting async runtime")
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = RelayConfig::from_env();
    config.provider = args.provider;
    config.model = args.model;
    config.max_request_bytes = args.max_request_bytes;
    config.request_timeout = args.request_timeout_secs.map(Duration::from_secs);

    if config.provider == "openai" && config.api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set; generation requests will fail");
    }

    let registry = default_generator_registry(&config)?;
    let Some(generator) = registry.get(&config.provider) else {
        bail!(
            "unknown provider '{}' (available: {})",
            config.provider,
            registry.names().join(", ")
        );
    };

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed binding {}", args.bind))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        provider = %config.provider,
        model = %config.model,
        max_request_bytes = config.max_request_bytes,
        "relay listening"
    );
    serve(listener, RelayState::new(generator), config.max_request_bytes).await
}

async fn run_generate(args: GenerateArgs) -> Result<i32> {
    let items = args
        .files
        .iter()
        .map(|path| UploadItem::from_path(path))
        .collect::<Result<Vec<UploadItem>>>()?;
    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;

    let run_id = format!("run-{}", uuid::Uuid::new_v4());
    let started_at = now_utc_iso();
    let config = OrchestratorConfig {
        concurrency: args.concurrency,
        compression: CompressionSettings {
            trigger_bytes: COMPRESSION_TRIGGER_BYTES,
            target_bytes: args.target_bytes,
            max_dimension: args.max_dimension,
        },
    };
    let client = HttpRelayClient::from_base_url(&args.endpoint);
    println!(
        "Generating {} model image(s) via {}",
        items.len(),
        client.endpoint()
    );

    let mut orchestrator = Orchestrator::new(client, config);
    if let Some(events_path) = args.events.clone() {
        orchestrator = orchestrator.with_events(EventWriter::new(events_path, run_id.clone()));
    }

    let mut progress = orchestrator.subscribe();
    let mut printer = ProgressPrinter::default();
    let run = orchestrator.run(items);
    tokio::pin!(run);
    let results = loop {
        tokio::select! {
            finished = &mut run => break finished?,
            changed = progress.changed() => {
                if changed.is_ok() {
                    let snapshot = progress.borrow_and_update().clone();
                    printer.render(&snapshot);
                }
            }
        }
    };
    printer.render(&orchestrator.snapshot());

    let outputs = save_results(&args.out, &results)?;
    let summary = RunSummary::from_results(&run_id, started_at, &results, outputs);
    write_summary(&args.out.join("summary.json"), &summary)?;

    println!(
        "Done: {} generated, {} failed. Saved to {}",
        summary.succeeded,
        summary.failed,
        args.out.display()
    );
    for failure in &summary.failures {
        println!("  failed {}: {}", failure.original_name, failure.error);
    }
    Ok(if summary.failed == 0 { 0 } else { 1 })
}

fn run_compress(args: CompressArgs) -> Result<i32> {
    let item = UploadItem::from_path(&args.file)?;
    let original_bytes = item.len();
    let prepared = compress(item, args.target_bytes, args.max_dimension);
    match &prepared.outcome {
        CompressionOutcome::Compressed {
            width,
            height,
            quality,
            attempts,
            over_budget,
            ..
        } => {
            fs::write(&args.out, &prepared.item.bytes)
                .with_context(|| format!("failed writing {}", args.out.display()))?;
            println!(
                "{} -> {} ({}x{}, quality {:.1}, {} attempt(s)): {} -> {} bytes",
                args.file.display(),
                args.out.display(),
                width,
                height,
                quality,
                attempts,
                original_bytes,
                prepared.item.len()
            );
            if *over_budget {
                println!(
                    "warning: still {} bytes over the {} byte target at the quality floor",
                    prepared.item.len() - args.target_bytes,
                    args.target_bytes
                );
            }
            Ok(0)
        }
        CompressionOutcome::Fallback { reason } => {
            println!("{} left unchanged: {reason}", args.file.display());
            Ok(1)
        }
        CompressionOutcome::Untouched => Ok(0),
    }
}

#[derive(Debug, Default)]
struct ProgressPrinter {
    last_current: usize,
    printed_results: usize,
}

impl ProgressPrinter {
    fn render(&mut self, snapshot: &RunSnapshot) {
        for result in snapshot.results.iter().skip(self.printed_results) {
            println!("{}", result_line(result));
        }
        self.printed_results = self.printed_results.max(snapshot.results.len());

        if snapshot.in_progress && snapshot.progress.current != self.last_current {
            self.last_current = snapshot.progress.current;
            println!("{}", progress_line(&snapshot.progress));
        }
    }
}

fn progress_line(progress: &ProgressState) -> String {
    if progress.current == 0 {
        return "Starting image generation...".to_string();
    }
    format!(
        "Generating image {} of {} ({:.0}%, ~{} min remaining)",
        progress.current,
        progress.total,
        progress.fraction() * 100.0,
        progress.estimated_minutes_remaining()
    )
}

fn result_line(result: &GenerationResult) -> String {
    if result.success {
        format!("  ok     {}", result.original_name)
    } else {
        format!(
            "  failed {}: {}",
            result.original_name,
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

/// Writes every successful image as `model_wearing_<name>`; returns the file names.
///
/// Results sharing a name within one run get `_2`, `_3`, ... before the extension.
fn save_results(out_dir: &Path, results: &[GenerationResult]) -> Result<Vec<String>> {
    let mut written = Vec::new();
    let mut taken = HashSet::new();
    for result in results.iter().filter(|result| result.success) {
        let Some(image_data) = result.image_data.as_deref() else {
            continue;
        };
        let bytes = match BASE64.decode(image_data.trim()) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(name = %result.original_name, error = %err, "undecodable image payload");
                continue;
            }
        };
        let file_name = unique_file_name(result.download_file_name(), &mut taken);
        let path = out_dir.join(&file_name);
        fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
        written.push(file_name);
    }
    Ok(written)
}

fn unique_file_name(file_name: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(file_name.clone()) {
        return file_name;
    }
    let path = Path::new(&file_name);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or(&file_name);
    let extension = path.extension().and_then(|value| value.to_str());
    let mut counter = 2usize;
    loop {
        let candidate = match extension {
            Some(extension) => format!("{stem}_{counter}.{extension}"),
            None => format!("{stem}_{counter}"),
        };
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

fn now_utc_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use sweetdesk_core::batch::{BatchItem, BatchOrchestrator, ProcessingStatus};
use sweetdesk_core::codec::{self, OutputFormat};
use sweetdesk_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use sweetdesk_core::fetch::Fetcher;
use sweetdesk_core::fitter::{fit_exact, AspectFitRequest};
use sweetdesk_core::inference::onnx::OnnxModelOptions;
use sweetdesk_core::inference::{OnnxModel, UpscaleEngine};
use sweetdesk_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use sweetdesk_core::model_registry::{self, ImageKind, ModelEntry, ModelRegistry};
use sweetdesk_core::pipeline::{DimensionSpec, ImageProcessor};
use sweetdesk_core::planner::{
    plan_resolution, validate_dimensions, validate_intermediate, ResizeLimits, ResizeMode,
    ResizeRequest,
};

#[derive(Parser)]
#[command(name = "sweetdesk", about = "Tiled AI image super-resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the planned output size without loading a model
    Plan(PlanArgs),
    /// Enlarge one image
    Upscale(UpscaleArgs),
    /// Squeeze an image to an exact size without enlarging it
    Fit(FitArgs),
    /// Process a JSON manifest of images sequentially
    Batch(BatchArgs),
}

#[derive(Args)]
struct PlanArgs {
    input_width: u32,
    input_height: u32,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    #[arg(long, help = "Use --width/--height verbatim instead of keeping aspect")]
    force: bool,
    #[arg(long, conflicts_with_all = ["width", "height"])]
    scale: Option<f64>,
    #[arg(long)]
    max_resolution: Option<u32>,
    #[arg(long, help = "Native model scale (default: from the configured model)")]
    model_scale: Option<u32>,
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Input image path or http(s) URL")]
    input: String,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long, default_value = "", help = "WxH, a preset like 4k, a factor like 2x, or native")]
    dimension: String,
    #[arg(long, conflicts_with = "model_path")]
    model: Option<String>,
    #[arg(long)]
    model_path: Option<PathBuf>,
    #[arg(long, value_enum, conflicts_with_all = ["model", "model_path"], help = "Pick the recommended model for this content")]
    kind: Option<KindArg>,
    #[arg(long, value_enum)]
    format: Option<FormatArg>,
}

#[derive(Args)]
struct FitArgs {
    input: PathBuf,
    #[arg(short = 'o', long)]
    output: PathBuf,
    #[arg(long)]
    width: u32,
    #[arg(long)]
    height: u32,
    #[arg(long)]
    seam_budget: Option<u32>,
}

#[derive(Args)]
struct BatchArgs {
    #[arg(help = "JSON manifest: an array of items or {\"items\": [...]}")]
    manifest: PathBuf,
    #[arg(long, help = "Output directory (default: [paths].output_dir)")]
    dest: Option<PathBuf>,
    #[arg(long, conflicts_with = "model_path")]
    model: Option<String>,
    #[arg(long)]
    model_path: Option<PathBuf>,
    #[arg(long, value_enum, conflicts_with_all = ["model", "model_path"], help = "Pick the recommended model for this content")]
    kind: Option<KindArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FormatArg {
    Png,
    Jpeg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Anime,
    Photo,
}

impl From<KindArg> for ImageKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::Anime => ImageKind::Anime,
            KindArg::Photo => ImageKind::Photo,
        }
    }
}

/// `--model` as given, else the catalogue's pick for `--kind`.
fn requested_model(model: Option<&str>, kind: Option<KindArg>) -> Option<&str> {
    model.or_else(|| kind.map(|kind| model_registry::recommended_for(kind.into()).name.as_str()))
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Png => OutputFormat::Png,
            FormatArg::Jpeg => OutputFormat::Jpeg,
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Commands::Batch(_) => RuntimeLogMode::Batch,
        _ => RuntimeLogMode::Cli,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let ort_source = sweetdesk_core::runtime::setup_runtime_libs();
    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    sweetdesk_core::runtime::log_runtime_lib_status(&ort_source);
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Plan(args) => run_plan(&config, args),
        Commands::Upscale(args) => run_upscale(&config, args).await,
        Commands::Fit(args) => run_fit(&config, args),
        Commands::Batch(args) => run_batch(&config, args).await,
    }
}

#[cfg(test)]
fn select_log_filter(
    noise_base: &str,
    rust_log_env: Option<&str>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> String {
    let options = LoggingInitOptions {
        mode: RuntimeLogMode::Cli,
        data_dir: None,
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: rust_log_env.map(ToString::to_string),
        default_log_filter: DEFAULT_LOG_FILTER.to_string(),
        noise_filter: noise_base.to_string(),
        include_noise_filter_when_implicit: true,
        retention_files: logging::DEFAULT_LOG_RETENTION_FILES,
    };

    logging::compose_logging_filters(&options).console_filter
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);
    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = &panic_hook_plan
    {
        let attempted_crash_dir = attempted_crash_dir
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "<none>".to_string());
        eprintln!(
            "Warning: panic crash artifact hook unavailable (path: {attempted_crash_dir}; reason: {reason}). Panics will not be persisted to crash logs."
        );
    }

    let init_options = LoggingInitOptions {
        mode,
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(logging::redacting_make_writer(std::io::stderr))
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::ConsoleOnly {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(logging::redacting_make_writer(std::io::stderr))
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// An explicit `--config` must exist; the default location is created with
/// defaults on first run.
fn load_config(data_dir: &Path, explicit: Option<&Path>) -> Result<AppConfig> {
    let config = match explicit {
        Some(path) => {
            if !path.is_file() {
                bail!("Config file does not exist: {}", path.display());
            }
            AppConfig::load_from_path(path)?
        }
        None => {
            if let Err(e) = initialize_data_dir(data_dir) {
                warn!(error = %e, "Failed to initialize data directory");
            }
            match AppConfig::load_from_path(&config_path(data_dir)) {
                Ok(config) => config,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
                    AppConfig::default()
                }
            }
        }
    };
    Ok(config.resolved_against(data_dir))
}

/// Resolves a registry model and checks its hash. A configured
/// `[model].sha256` applies to the configured model only.
fn configured_entry(config: &AppConfig, name: Option<&str>) -> Result<(ModelEntry, PathBuf)> {
    let explicit_name = name.is_some();
    let name = name.unwrap_or(&config.model.name);
    let mut registry = ModelRegistry::with_builtin_models(config.paths.models_dir.clone());
    registry.discover()?;
    let (entry, path) = registry.resolve(name)?;

    let expected = if explicit_name {
        entry.sha256.as_deref()
    } else {
        config.model.sha256.as_deref().or(entry.sha256.as_deref())
    };
    model_registry::verify_model_file(&entry.name, &path, expected)?;
    Ok((entry, path))
}

/// Model scale for `plan`, which never loads a model.
fn configured_scale(config: &AppConfig) -> u32 {
    config
        .model
        .scale
        .or_else(|| {
            ModelRegistry::with_builtin_models(config.paths.models_dir.clone())
                .get(&config.model.name)
                .map(|entry| entry.scale)
        })
        .unwrap_or(4)
}

fn load_engine(
    config: &AppConfig,
    model: Option<&str>,
    model_path: Option<&Path>,
) -> Result<Arc<UpscaleEngine>> {
    let explicit_path = model_path
        .map(Path::to_path_buf)
        .or_else(|| if model.is_none() { config.model.file.clone() } else { None });

    let (mut options, path) = match explicit_path {
        Some(path) => {
            let label = path.display().to_string();
            model_registry::verify_model_file(&label, &path, config.model.sha256.as_deref())?;
            let fallback = model_registry::find_entry(&config.model.name);
            let options = OnnxModelOptions {
                backend: config.model.backend,
                trt_cache_dir: None,
                scale: fallback.map(|e| e.scale).unwrap_or(4),
                tile_size: fallback.map(|e| e.tile_size).unwrap_or(512),
                value_range: fallback.map(|e| e.value_range).unwrap_or_default(),
            };
            (options, path)
        }
        None => {
            let (entry, path) = configured_entry(config, model)?;
            (OnnxModelOptions::for_entry(&entry, config.model.backend), path)
        }
    };
    if let Some(scale) = config.model.scale {
        options.scale = scale;
    }
    if let Some(tile_size) = config.model.tile_size {
        options.tile_size = tile_size;
    }
    options.trt_cache_dir = Some(config.paths.trt_cache_dir.as_path());

    let started = Instant::now();
    let model = OnnxModel::load(&path, &options)?;
    info!(
        model = %path.display(),
        scale = options.scale,
        tile_size = options.tile_size,
        backend = %options.backend,
        fp16 = model.is_fp16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Model loaded"
    );
    Ok(Arc::new(UpscaleEngine::new(model)?))
}

fn run_plan(config: &AppConfig, args: PlanArgs) -> Result<()> {
    let limits: ResizeLimits = config.limits.into();
    let request = plan_request(&args);
    let model_scale = args.model_scale.unwrap_or_else(|| configured_scale(config));

    validate_dimensions(args.input_width as i64, args.input_height as i64, &limits)?;
    validate_intermediate(args.input_width, args.input_height, model_scale, &limits)?;
    let (width, height) = plan_resolution(args.input_width, args.input_height, &request, model_scale)?;
    validate_dimensions(width as i64, height as i64, &limits)?;

    println!("{width}x{height}");
    Ok(())
}

fn plan_request(args: &PlanArgs) -> ResizeRequest {
    let request = if let Some(factor) = args.scale {
        ResizeRequest::scale(factor)
    } else if args.width.is_none() && args.height.is_none() {
        ResizeRequest::model_default()
    } else if args.force {
        ResizeRequest {
            mode: ResizeMode::Force {
                width: args.width,
                height: args.height,
            },
            max_resolution: None,
        }
    } else {
        ResizeRequest::keep_aspect(args.width, args.height)
    };
    match args.max_resolution {
        Some(max) => request.with_max_resolution(max),
        None => request,
    }
}

/// `--format`, else the output file's extension, else the configured format.
fn output_format_for(path: &Path, explicit: Option<FormatArg>, configured: OutputFormat) -> OutputFormat {
    explicit
        .map(OutputFormat::from)
        .or_else(|| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .and_then(OutputFormat::from_extension)
        })
        .unwrap_or(configured)
}

fn is_remote(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

async fn run_upscale(config: &AppConfig, args: UpscaleArgs) -> Result<()> {
    let spec = DimensionSpec::parse(&args.dimension)?;
    let format = output_format_for(&args.output, args.format, config.output.format);

    let bytes = if is_remote(&args.input) {
        let fetcher = config.download.fetcher();
        let url = args.input.clone();
        tokio::task::spawn_blocking(move || fetcher.download(&url))
            .await
            .context("download task failed")??
    } else {
        std::fs::read(&args.input).with_context(|| format!("Failed to read {}", args.input))?
    };

    let engine = load_engine(
        config,
        requested_model(args.model.as_deref(), args.kind),
        args.model_path.as_deref(),
    )?;
    let processor = ImageProcessor::from_config(engine, config)
        .with_output(format, config.output.jpeg_quality);

    let cancel = CancellationToken::new();
    let cancel_on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel_on_ctrl_c.cancel();
        }
    });

    let processed = tokio::task::spawn_blocking(move || processor.process_bytes(&bytes, &spec, &cancel))
        .await
        .context("upscale task failed")??;

    write_output(&args.output, &processed.bytes)?;
    println!(
        "{} ({}x{}, {})",
        args.output.display(),
        processed.width,
        processed.height,
        processed.format
    );
    Ok(())
}

fn run_fit(config: &AppConfig, args: FitArgs) -> Result<()> {
    let bytes = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let (width, height) = codec::probe_dimensions(&bytes)?;
    let limits: ResizeLimits = config.limits.into();
    validate_dimensions(width as i64, height as i64, &limits)?;

    let (image, _) = codec::decode(&bytes, &limits)?;
    let fitted = fit_exact(
        image,
        &AspectFitRequest {
            target_width: args.width,
            target_height: args.height,
            max_seams_per_axis: args.seam_budget.unwrap_or(config.fit.seam_budget),
        },
    )?;

    let format = output_format_for(&args.output, None, config.output.format);
    let encoded = codec::encode(&fitted, format, config.output.jpeg_quality)?;
    write_output(&args.output, &encoded)?;

    let (out_w, out_h) = fitted.dimensions();
    if (out_w, out_h) != (args.width, args.height) {
        warn!(
            width = out_w,
            height = out_h,
            target_width = args.width,
            target_height = args.height,
            "Seam budget exhausted before reaching the target ratio"
        );
    }
    println!("{} ({out_w}x{out_h})", args.output.display());
    Ok(())
}

fn parse_manifest(raw: &str) -> Result<Vec<BatchItem>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Manifest {
        Items(Vec<BatchItem>),
        Wrapped { items: Vec<BatchItem> },
    }

    let manifest: Manifest = serde_json::from_str(raw).context("Failed to parse batch manifest")?;
    Ok(match manifest {
        Manifest::Items(items) | Manifest::Wrapped { items } => items,
    })
}

async fn run_batch(config: &AppConfig, args: BatchArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.manifest)
        .with_context(|| format!("Failed to read manifest: {}", args.manifest.display()))?;
    let items = parse_manifest(&raw)
        .with_context(|| format!("Invalid manifest: {}", args.manifest.display()))?;
    let dest = args
        .dest
        .unwrap_or_else(|| config.paths.output_dir.clone());

    let engine = load_engine(
        config,
        requested_model(args.model.as_deref(), args.kind),
        args.model_path.as_deref(),
    )?;
    let processor = ImageProcessor::from_config(engine, config);
    let fetcher = config.download.fetcher();
    let orchestrator = BatchOrchestrator::new(processor, Arc::new(fetcher));

    let mut events = orchestrator.subscribe();
    let started = Instant::now();
    let handle = orchestrator
        .start_batch(items, dest.clone())
        .context("a batch is already running")?;

    loop {
        match events.recv().await {
            Ok(status) => {
                print_progress(&status, started.elapsed().as_secs_f64());
                if status.done {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress display fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    eprintln!();

    let status = handle.await.context("batch task failed")?;
    for item in &status.items {
        match (&item.output_path, &item.error_message) {
            (Some(path), _) => println!("{}\t{}", item.id, path.display()),
            (None, Some(message)) => println!("{}\terror: {message}", item.id),
            (None, None) => println!("{}\t{:?}", item.id, item.state),
        }
    }

    let failed = status.failed_count();
    info!(
        total = status.total,
        failed,
        dest = %dest.display(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Batch complete"
    );
    if failed > 0 {
        bail!("{failed} of {} items failed", status.total);
    }
    Ok(())
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_line(status: &ProcessingStatus, elapsed: f64) -> String {
    let filled = status.progress_percent as usize * PROGRESS_BAR_WIDTH / 100;
    let bar: String = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH - filled);
    let shown = if status.done {
        status.total
    } else {
        (status.current_index + 1).min(status.total)
    };
    format!(
        "[{bar}] {:3}% | Image {shown}/{} | Failed: {} | Elapsed: {}",
        status.progress_percent,
        status.total,
        status.failed_count(),
        format_duration(elapsed),
    )
}

fn print_progress(status: &ProcessingStatus, elapsed: f64) {
    eprint!("\r{}    ", progress_line(status, elapsed));
}


#[cfg(test)]
mod manifest_tests {
    use super::*;
    use sweetdesk_core::batch::ImageSource;

    #[test]
    fn test_accepts_bare_array_and_wrapped_items() {
        let bare = r#"[{"id": "a", "source": {"type": "remote", "url": "https://x/a.png"}}]"#;
        let wrapped = r#"{"items": [
            {"id": "b", "name": "cat.png", "dimension": "2x",
             "source": {"type": "file", "path": "~/cat.png"}}
        ]}"#;

        let items = parse_manifest(bare).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].source,
            ImageSource::Remote {
                url: "https://x/a.png".into()
            }
        );
        assert!(items[0].dimension.is_empty());

        let items = parse_manifest(wrapped).unwrap();
        assert_eq!(items[0].name, "cat.png");
        assert_eq!(items[0].dimension, "2x");
    }

    #[test]
    fn test_rejects_malformed_manifest() {
        assert!(parse_manifest(r#"{"nope": 1}"#).is_err());
        assert!(parse_manifest("[{\"id\": \"a\"}]").is_err());
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(load_config(dir.path(), Some(&missing)).is_err());
    }

    #[test]
    fn test_default_config_is_created_and_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path(), None).unwrap();
        assert!(config_path(dir.path()).is_file());
        assert_eq!(config.paths.models_dir, dir.path().join("models"));
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use cadenza_core::audio::ContainerEncoder;
use cadenza_core::config::{config_path, data_dir, initialize_data_dir, AppConfig, EngineKind};
use cadenza_core::engine::build_engine;
use cadenza_core::jobs::{GenerationRequest, JobOutcome, JobResult, JobSystem};
use cadenza_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, RuntimeLogMode,
    DEFAULT_LOG_FILTER,
};
use cadenza_core::server::{app_router, AppState};

#[derive(Parser)]
#[command(
    name = "cadenza",
    about = "Queued music generation server",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

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

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single generation and write the audio to a file.
    Generate(GenerateArgs),
}

#[derive(Args)]
struct GenerateArgs {
    #[arg(long, help = "Genre / style tags, e.g. \"lofi, piano, 80 BPM\"")]
    prompt: String,
    #[arg(long, help = "Lyrics text (defaults to instrumental)")]
    lyrics: Option<String>,
    #[arg(long, default_value_t = 60.0, help = "Length of the track in seconds")]
    duration: f64,
    #[arg(long, default_value = "wav", help = "Output container: wav, mp3, ogg or flac")]
    format: String,
    #[arg(long, help = "Number of diffusion steps")]
    infer_step: Option<u32>,
    #[arg(long, help = "Comma-separated manual seeds")]
    seeds: Option<String>,
    #[arg(long, value_enum, help = "Override the configured engine")]
    engine: Option<EngineChoice>,
    #[arg(short = 'o', long, help = "Where to write the generated audio")]
    output: PathBuf,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum EngineChoice {
    Process,
    Tone,
}

impl From<EngineChoice> for EngineKind {
    fn from(choice: EngineChoice) -> Self {
        match choice {
            EngineChoice::Process => EngineKind::Process,
            EngineChoice::Tone => EngineKind::Tone,
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Cli
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Generate(args)) => run_generate(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
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
    let filter = init_plan.filter.effective_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(parse_env_filter_with_fallback(&filter, "console")),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(parse_env_filter_with_fallback(&filter, "file")),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());

            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(parse_env_filter_with_fallback(&filter, "console")),
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

fn load_config(data_dir: &Path) -> AppConfig {
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

/// Builds the engine, encoder and job system described by `config`.
fn start_jobs(config: &AppConfig, data_dir: &Path, shutdown: CancellationToken) -> Result<JobSystem> {
    let paths = config.resolved_paths(data_dir);
    for dir in [&paths.output_dir, &paths.scratch_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory: {}", dir.display()))?;
    }

    let engine = build_engine(&config.engine);
    let encoder = Arc::new(ContainerEncoder::new(config.encoder.ffmpeg_program.clone()));
    info!(
        engine = engine.name(),
        output_dir = %paths.output_dir.display(),
        scratch_dir = %paths.scratch_dir.display(),
        "Starting job system"
    );

    Ok(JobSystem::start(
        engine,
        encoder,
        &paths,
        &config.queue,
        shutdown,
    ))
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let shutdown = CancellationToken::new();
    let jobs = start_jobs(&config, &data_dir, shutdown.clone())?;
    let state = AppState::new(
        &jobs,
        engine_label(&config),
        config.resolved_paths(&data_dir).scratch_dir,
        config.server.max_upload_bytes,
    );
    let app = app_router(state);

    let addr = format!("{host}:{port}");
    info!(%addr, "Starting cadenza server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    jobs.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for ctrl-c");
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

fn engine_label(config: &AppConfig) -> &'static str {
    match config.engine.kind {
        EngineKind::Process => "process",
        EngineKind::Tone => "tone",
    }
}

fn build_request(args: &GenerateArgs) -> GenerationRequest {
    let mut request = GenerationRequest {
        format: args.format.clone(),
        audio_duration: args.duration,
        manual_seeds: args.seeds.clone(),
        return_file_data: true,
        ..GenerationRequest::with_prompt(args.prompt.clone())
    };
    if let Some(lyrics) = &args.lyrics {
        request.lyrics = lyrics.clone();
    }
    if let Some(steps) = args.infer_step {
        request.infer_step = steps;
    }
    request
}

async fn run_generate(args: GenerateArgs, data_dir: PathBuf) -> Result<()> {
    let mut config = load_config(&data_dir);
    if let Some(choice) = args.engine {
        config.engine.kind = choice.into();
    }

    let shutdown = CancellationToken::new();
    let jobs = start_jobs(&config, &data_dir, shutdown)?;
    let request = build_request(&args);

    let outcome = jobs.gateway().submit_and_wait(&request, None).await;
    let job = match outcome {
        Ok(job) => job,
        Err(e) => {
            jobs.shutdown().await;
            bail!("generation was not accepted: {e}");
        }
    };
    jobs.shutdown().await;

    let bytes = match job.outcome() {
        Some(JobOutcome::Success(JobResult::Inline { bytes, .. })) => bytes.to_vec(),
        Some(JobOutcome::Success(JobResult::Artifact { path, .. })) => std::fs::read(path)
            .with_context(|| format!("failed to read artifact: {}", path.display()))?,
        Some(JobOutcome::Failure(failure)) => bail!("generation failed: {}", failure.message),
        None => bail!("generation ended without an outcome"),
    };

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(&args.output, &bytes)
        .with_context(|| format!("failed to write output: {}", args.output.display()))?;

    info!(
        job_id = %job.id,
        output = %args.output.display(),
        size_bytes = bytes.len(),
        duration_ms = job.duration_ms().unwrap_or_default(),
        "Generation finished"
    );
    Ok(())
}

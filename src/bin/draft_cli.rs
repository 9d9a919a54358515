use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rhythm_drafter::analysis::quantizer::GridKind;
use rhythm_drafter::analysis::NeverCancel;
use rhythm_drafter::engine::{PcmDecoder, WavDecoder};
use rhythm_drafter::telemetry;
use rhythm_drafter::{
    AppConfig, OnsetAnalyzer, PipelineBackends, PipelineOptions, PipelineOrchestrator,
    PipelineRequest, PipelineState, ProgressEvent, RunCoordinator,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "draft_cli",
    about = "Detect onsets, resolve the tempo grid and build a rhythm draft from a WAV file"
)]
struct Cli {
    /// JSON config file (defaults are used when missing or invalid)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable debug logging on stderr
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GridArgs {
    /// Input WAV file
    #[arg(long)]
    input: PathBuf,
    /// Onset detection sensitivity (0-100)
    #[arg(long, default_value_t = 50.0)]
    sensitivity: f64,
    /// Quantization grid: quarter, eighth, sixteenth, triplet, thirty_second
    #[arg(long, default_value_t = GridKind::Sixteenth)]
    grid: GridKind,
    /// Maximum snap error in milliseconds
    #[arg(long, default_value_t = 35.0)]
    max_snap_ms: f64,
    /// Force the tempo instead of estimating it
    #[arg(long)]
    bpm: Option<f64>,
    /// Force the grid offset in seconds
    #[arg(long)]
    offset: Option<f64>,
    /// Write JSON to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
}

impl GridArgs {
    fn options(&self) -> PipelineOptions {
        PipelineOptions {
            detection_sensitivity: self.sensitivity,
            quantization_grid: self.grid,
            max_snap_error_ms: self.max_snap_ms,
            forced_bpm: self.bpm,
            forced_offset_seconds: self.offset,
            ..PipelineOptions::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print detection statistics for a WAV file as JSON
    Analyze {
        #[command(flatten)]
        grid: GridArgs,
    },
    /// Run the full drafting pipeline and print the result as JSON
    Run {
        #[command(flatten)]
        grid: GridArgs,
        /// Print progress events to stderr
        #[arg(long)]
        progress: bool,
        /// Draft title (defaults to the file name)
        #[arg(long)]
        title: Option<String>,
        /// Snap every onset to the grid
        #[arg(long)]
        force_quantization: bool,
        /// Skip drum separation
        #[arg(long)]
        no_separation: bool,
        /// Print the run's metric events and hub totals to stderr
        #[arg(long)]
        telemetry: bool,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => AppConfig::load_from_file(path),
        None => AppConfig::default(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating tokio runtime")?;

    match cli.command {
        Commands::Analyze { grid } => runtime.block_on(run_analyze(config, grid)),
        Commands::Run {
            grid,
            progress,
            title,
            force_quantization,
            no_separation,
            telemetry,
        } => {
            let mut options = grid.options();
            options.force_quantization = force_quantization;
            options.enable_separation = !no_separation;
            let request = PipelineRequest {
                audio_path: grid.input.clone(),
                title,
                options,
            };
            let report = Report {
                progress,
                telemetry,
            };
            runtime.block_on(run_pipeline(config, request, report, grid.output))
        }
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();
}

async fn run_analyze(config: AppConfig, args: GridArgs) -> Result<ExitCode> {
    let options = args.options();
    options.validate()?;

    let decoder = WavDecoder::new(config.detection.bucket_seconds);
    let decoded = decoder
        .decode(&args.input, &CancellationToken::new())
        .await
        .with_context(|| format!("decoding {}", args.input.display()))?;

    let stats = OnsetAnalyzer::new(config)
        .analyze(
            &decoded.waveform,
            options.detection_sensitivity,
            &options.quantize_options(),
            &NeverCancel,
        )
        .with_context(|| format!("analysing {}", args.input.display()))?;

    emit_json(&stats, args.output.as_deref())?;
    Ok(ExitCode::from(0))
}

/// What `run` prints to stderr besides the result
struct Report {
    progress: bool,
    telemetry: bool,
}

async fn run_pipeline(
    config: AppConfig,
    request: PipelineRequest,
    report: Report,
    output: Option<PathBuf>,
) -> Result<ExitCode> {
    let backends = PipelineBackends::offline(&config);
    let coordinator = RunCoordinator::new(PipelineOrchestrator::new(config, backends));

    let mut metrics = telemetry::hub().subscribe();
    let mut subscription = coordinator.subscribe();
    let show_progress = report.progress;
    let handle = coordinator
        .start(request, None)
        .context("starting pipeline run")?;

    let printer = tokio::spawn(async move {
        for event in subscription.until_terminal().await {
            if show_progress {
                eprintln!("{}", progress_line(&event));
            }
        }
    });

    let result = handle.wait().await;
    printer.await.context("progress printer failed")?;

    if report.telemetry {
        // Metrics are published before the run returns, so the buffer is complete
        loop {
            match metrics.try_recv() {
                Ok(event) => eprintln!("telemetry: {}", serde_json::to_string(&event)?),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    eprintln!("telemetry: {} events skipped", skipped)
                }
                Err(_) => break,
            }
        }
        let snapshot = telemetry::hub().snapshot();
        eprintln!(
            "telemetry: {} events recorded, {} dropped from history",
            snapshot.total_events, snapshot.dropped_events
        );
    }

    emit_json(&result, output.as_deref())?;

    Ok(match result.final_state {
        PipelineState::Completed => ExitCode::from(0),
        PipelineState::Cancelled => ExitCode::from(3),
        _ => ExitCode::from(2),
    })
}

fn progress_line(event: &ProgressEvent) -> String {
    let mut line = format!(
        "[{:5.1}%] {}: {}",
        event.global_percent,
        event.stage.label(),
        event.status
    );
    if event.is_heartbeat {
        line.push_str(" (heartbeat)");
    }
    if event.is_terminal() {
        if let Some(warning) = &event.warning {
            line.push_str(&format!(" [warning: {}]", warning));
        }
    }
    line
}

fn emit_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        }
        None => println!("{}", json),
    }
    Ok(())
}

//! scope-sim: run the acquisition core against mock hardware.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use scope_core::config::Settings;
use scope_core::feature::common::{focus_search, stack_sweep};
use scope_core::feature::FeatureContainer;
use scope_core::hardware::mock::{MockCamera, MockDisplay, MockProcessor, MockStage, MockWriter};
use scope_core::hardware::StageMotion;
use scope_core::pipeline::AcquisitionPipeline;
use scope_core::proxy::ProxyManager;
use scope_core::telemetry::{self, TracingConfig};

#[derive(Parser)]
#[command(name = "scope-sim", about = "Acquisition core simulator (mock hardware)")]
struct Cli {
    /// Path to a TOML settings file.
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a camera burst through the full custody pipeline.
    Burst {
        /// Number of frames to acquire.
        #[arg(short = 'n', long, default_value_t = 32)]
        frames: u64,
        /// Output file for the raw frame stream.
        #[arg(short, long, default_value = "burst.raw")]
        output: PathBuf,
    },
    /// Step a mock stage through a stack sweep.
    Sweep {
        /// Number of planes.
        #[arg(short, long, default_value_t = 10)]
        planes: u32,
        /// Plane spacing in stage units.
        #[arg(short, long, default_value_t = 2.0)]
        spacing: f64,
    },
    /// Closed-loop focus search over a candidate range.
    Focus {
        /// Number of candidate positions.
        #[arg(short = 'n', long, default_value_t = 9)]
        candidates: u32,
        /// Half-width of the search range around zero.
        #[arg(short, long, default_value_t = 8.0)]
        range: f64,
        /// True best-focus position the simulated metric peaks at.
        #[arg(short, long, default_value_t = 3.0)]
        target: f64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load(path).with_context(|| format!("loading {path}"))?,
        None => Settings::default(),
    };
    let tracing_config = TracingConfig::from_level_str(&settings.log_level)
        .map_err(|e| anyhow::anyhow!(e))?;
    telemetry::init(&tracing_config);

    match cli.command {
        Command::Burst { frames, output } => run_burst(&settings, frames, &output),
        Command::Sweep { planes, spacing } => run_sweep(&settings, planes, spacing),
        Command::Focus {
            candidates,
            range,
            target,
        } => run_focus(&settings, candidates, range, target),
    }
}

fn run_burst(settings: &Settings, frames: u64, output: &std::path::Path) -> Result<()> {
    let mut manager = ProxyManager::new(settings.worker.clone());
    let pool = manager.allocate(
        &settings.pool.frame_shape,
        settings.pool.dtype,
        settings.pool.slot_count,
    )?;

    let camera = manager.proxy_object("camera", || {
        Ok(MockCamera::new(Duration::from_millis(2)))
    })?;
    let processor = manager.proxy_object("processor", || {
        Ok(MockProcessor::new(16, Duration::from_millis(1)))
    })?;
    let display = manager.proxy_object("display", || {
        Ok(MockDisplay::new(Duration::from_millis(1)))
    })?;
    let out = output.to_path_buf();
    let storage = manager.proxy_object("storage", move || MockWriter::create(&out))?;

    let pipeline = AcquisitionPipeline::new(
        pool,
        camera,
        processor,
        display,
        storage,
        settings.acquisition.clone(),
    );
    let report = pipeline.run_burst(frames)?;
    info!(
        requested = report.frames_requested,
        stored = report.frames_stored,
        output = %output.display(),
        "burst finished"
    );
    Ok(())
}

fn run_sweep(settings: &Settings, planes: u32, spacing: f64) -> Result<()> {
    let stage = Arc::new(Mutex::new(MockStage::new().with_speed(100.0)));
    let positions: Vec<f64> = (0..planes).map(|i| f64::from(i) * spacing).collect();
    let spec = stack_sweep(stage.clone(), positions);

    let container = FeatureContainer::new(vec![vec![spec]], 1, settings.acquisition.clone());
    let summary = container.run(|pass| Ok(vec![pass]))?;
    info!(
        frames = summary.frames_produced,
        final_position = stage.lock().position()?,
        "sweep finished"
    );
    Ok(())
}

fn run_focus(settings: &Settings, candidates: u32, range: f64, target: f64) -> Result<()> {
    let stage = Arc::new(Mutex::new(MockStage::new().with_speed(100.0)));
    let positions: Vec<f64> = (0..candidates)
        .map(|i| -range + 2.0 * range * f64::from(i) / f64::from(candidates.max(2) - 1))
        .collect();
    let passes = positions.len() as u32;

    // Simulated sharpness: peaks when the stage sits at the target.
    let metric_stage = stage.clone();
    let (spec, report) = focus_search(stage.clone(), positions, move |_| {
        let position = metric_stage.lock().position()?;
        Ok(-(position - target).abs())
    });

    let container = FeatureContainer::new(vec![vec![spec]], passes, settings.acquisition.clone());
    container.run(|pass| Ok(vec![pass]))?;

    match *report.lock() {
        Some(found) => info!(
            position = found.position,
            score = found.score,
            "focus search finished"
        ),
        None => info!("focus search produced no result"),
    }
    Ok(())
}

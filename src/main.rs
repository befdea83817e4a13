//! CLI Entry Point for confocal-stepper
//!
//! Runs scans against the mock stepper and counter:
//! - `scan` runs a full scan and prints a summary of the image
//! - `axes` lists the stepper axes with their settings
//!
//! # Usage
//!
//! ```bash
//! confocal-stepper scan --lines 20 --steps 50
//! confocal-stepper scan --axes "x,y" --inverted --pattern noise
//! confocal-stepper axes
//! ```
//!
//! With `--lines 0` the scan runs until Ctrl-C.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use confocal_stepper::config::StepperConfig;
use confocal_stepper::hardware::mock::{CountPattern, MemorySink, MockCounter, MockStepper};
use confocal_stepper::logging::{self, OutputFormat, TracingConfig};
use confocal_stepper::scan::{ConfocalStepperLogic, ScanAxes};
use std::path::PathBuf;
use std::sync::Arc;

const MOCK_AXES: [&str; 3] = ["x", "y", "z"];

#[derive(Parser)]
#[command(name = "confocal-stepper")]
#[command(about = "Confocal scanning with open-loop steppers", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan on the mock hardware
    Scan {
        /// Scan axes, e.g. "xz" or "x,z"
        #[arg(long)]
        axes: Option<String>,

        /// Step the first named axis along lines instead of the second
        #[arg(long)]
        inverted: bool,

        /// Steps per line
        #[arg(long)]
        steps: Option<usize>,

        /// Number of lines (0 = until Ctrl-C)
        #[arg(long)]
        lines: Option<usize>,

        /// Step frequency of the fast axis in Hz
        #[arg(long)]
        frequency: Option<f64>,

        /// Counts produced by the mock counter
        #[arg(long, value_enum, default_value = "ramp")]
        pattern: Pattern,
    },

    /// List stepper axes and their settings
    Axes,
}

#[derive(Clone, Copy, ValueEnum)]
enum Pattern {
    Constant,
    Ramp,
    Noise,
}

impl From<Pattern> for CountPattern {
    fn from(pattern: Pattern) -> Self {
        match pattern {
            Pattern::Constant => CountPattern::Constant(100),
            Pattern::Ramp => CountPattern::Ramp { start: 0, step: 1 },
            Pattern::Noise => CountPattern::Noise { mean: 100, seed: 1 },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StepperConfig::load_from(path),
        None => StepperConfig::load(),
    }
    .context("Failed to load configuration")?;
    config.validate()?;

    let mut tracing_config = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if let Some(format) = &cli.log_format {
        tracing_config = tracing_config
            .with_format(format.parse::<OutputFormat>().map_err(anyhow::Error::msg)?);
    }
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Scan {
            axes,
            inverted,
            steps,
            lines,
            frequency,
            pattern,
        } => run_scan(config, axes, inverted, steps, lines, frequency, pattern).await,
        Commands::Axes => list_axes(config).await,
    }
}

fn mock_logic(config: &StepperConfig, pattern: CountPattern) -> Result<Arc<ConfocalStepperLogic>> {
    let logic = ConfocalStepperLogic::new(
        config,
        Arc::new(MockStepper::new(&MOCK_AXES)),
        Arc::new(MockCounter::new(pattern)),
        Arc::new(MemorySink::new()),
    )?;
    Ok(Arc::new(logic))
}

#[allow(clippy::too_many_arguments)]
async fn run_scan(
    config: StepperConfig,
    axes: Option<String>,
    inverted: bool,
    steps: Option<usize>,
    lines: Option<usize>,
    frequency: Option<f64>,
    pattern: Pattern,
) -> Result<()> {
    println!("🔧 Initializing mock hardware...");
    let logic = mock_logic(&config, pattern.into())?;
    logic.initialize().await?;

    if let Some(axes) = axes {
        logic
            .set_scan_axes(ScanAxes::parse(&axes, inverted)?)
            .await?;
    } else if inverted {
        logic
            .set_scan_axes(ScanAxes::parse(&config.scan.axes, true)?)
            .await?;
    }
    if let Some(steps) = steps {
        logic.set_steps_per_line(steps).await?;
    }
    if let Some(lines) = lines {
        logic.set_lines(lines).await?;
    }
    let scan_axes = logic.scan_axes().await;
    if let Some(frequency) = frequency {
        logic
            .set_stepper_frequency(scan_axes.fast_axis(), frequency)
            .await?;
    }

    println!(
        "▶️  Scanning {} (fast axis {}, {} steps/line, {} lines)",
        scan_axes,
        scan_axes.fast_axis(),
        logic.steps_per_line().await,
        match logic.lines().await {
            0 => "unbounded".to_string(),
            n => n.to_string(),
        }
    );

    let mut handle = logic.spawn_scan().await?;
    let outcome = loop {
        tokio::select! {
            joined = &mut handle => break joined?,
            _ = tokio::signal::ctrl_c() => {
                println!("⏹️  Stopping at the end of the current line...");
                logic.stop_stepper().await?;
            }
        }
    };

    match outcome {
        Ok(outcome) => {
            let image = logic.image().await;
            println!();
            println!("✅ Scan finished: {:?}", outcome);
            println!("   Lines: {}", image.line_count());
            println!("   Total counts: {}", image.total_counts());
            println!("   Brightest bin: {}", image.max_count().unwrap_or(0));
            println!("   Positions: {:?}", logic.position().await);
            logic.save_scan_data().await?;
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("❌ Scan failed: {}", e);
            Err(e.into())
        }
    }
}

async fn list_axes(config: StepperConfig) -> Result<()> {
    let logic = mock_logic(&config, CountPattern::default())?;
    logic.initialize().await?;

    let scan_axes = logic.scan_axes().await;
    for axis in logic.stepper_axes().await? {
        let settings = logic.axis_settings(&axis).await?;
        let role = if axis == scan_axes.fast_axis() {
            " (fast)"
        } else if axis == scan_axes.slow_axis() {
            " (slow)"
        } else {
            ""
        };
        println!(
            "{axis}{role}: {} Hz, {} V, {}",
            settings.frequency, settings.amplitude, settings.mode
        );
    }
    Ok(())
}

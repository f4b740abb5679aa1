//! `minipuls` command-line front end.
//!
//! ```bash
//! minipuls plan run.json            # preview a sequence
//! minipuls validate run.json        # check a sequence file
//! minipuls run run.json --simulate  # execute without hardware
//! minipuls manual forward --rpm 12  # drive the pump by hand
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use minipuls_control::config::{Settings, DEFAULT_CONFIG_PATH};
use minipuls_control::controller::PumpController;
use minipuls_control::executor::RunStatus;
use minipuls_control::log_capture::{init_tracing, LogBuffer};
use minipuls_control::plan::{Timeline, Truncation};
use minipuls_control::sequence::{store, Direction, Sequence};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::StreamExt;
use tracing::{info, warn, Level};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "minipuls")]
#[command(about = "Plan and run MINIPULS pump sequences")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overriding the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Pump unit id, overriding the configuration
    #[arg(short, long)]
    unit: Option<u8>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the planned timeline of a sequence file
    Plan {
        file: PathBuf,
        /// Emit the timeline as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check that a sequence file loads and expands without faults
    Validate { file: PathBuf },
    /// Execute a sequence file
    Run {
        file: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Log commands instead of sending them
        #[arg(long)]
        simulate: bool,
    },
    /// Drive the pump by hand
    Manual {
        action: ManualAction,
        /// Speed for forward/backward, in rpm
        #[arg(long, default_value_t = 10.0)]
        rpm: f64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ManualAction {
    Forward,
    Backward,
    Stop,
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(port) = &cli.port {
        settings.serial.port = port.clone();
    }
    if let Some(unit) = cli.unit {
        settings.serial.unit_id = unit;
    }
    settings.validate()?;
    Ok(settings)
}

fn load_sequence(path: &Path) -> Result<Sequence> {
    let sequence = store::load(path)?;
    if sequence.is_empty() {
        bail!("{} contains no steps", path.display());
    }
    Ok(sequence)
}

fn print_plan(sequence: &Sequence, timeline: &Timeline) {
    println!("{:>4}  {:<6}  {:<36}  {}", "#", "Type", "Details", "Duration");
    for row in sequence.summaries() {
        println!(
            "{:>4}  {:<6}  {:<36}  {}",
            row.number, row.kind, row.details, row.duration
        );
    }

    let unit = timeline.display_unit();
    println!(
        "\nTotal: {:.2} {} ({} samples, {} cycle spans)",
        timeline.total_duration() / unit.factor(),
        unit,
        timeline.samples.len(),
        timeline.cycles.len()
    );
    match &timeline.truncation {
        Some(Truncation::InvalidCycle { step, detail }) => {
            println!("Plan stops at step {}: {}", step, detail);
        }
        Some(Truncation::IterationCap { iterations }) => {
            println!("Plan truncated after {} steps (iteration cap)", iterations);
        }
        None => {}
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

async fn run_file(settings: &Settings, logs: &LogBuffer, file: &Path, yes: bool) -> Result<()> {
    let sequence = load_sequence(file)?;
    let mut pump = PumpController::new(settings);
    pump.connect().await.context("connecting to pump")?;

    let timeline = pump.compute_timeline(&sequence);
    print_plan(&sequence, &timeline);
    if timeline.truncation.is_some() {
        warn!("Planned timeline is truncated; the run will stop at the same point");
    }
    if !yes && !confirm("Start sequence?")? {
        pump.disconnect().await?;
        return Ok(());
    }

    let mut progress = pump.progress_stream();
    let handle = pump.start_run(&sequence)?;
    info!(run_id = %handle.id(), "Press Ctrl-C to cancel");

    let mut cancel_requested = false;
    loop {
        tokio::select! {
            item = progress.next() => match item {
                Some(Ok(report)) => {
                    eprint!(
                        "\rstep {}/{}  {}  {:>5.2} rpm {:<8}",
                        report.step,
                        report.total_steps,
                        report.clock_label(),
                        report.planned_rpm,
                        report.planned_direction
                    );
                    if report.is_final {
                        eprintln!();
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(missed, "Progress display fell behind");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                eprintln!();
                pump.cancel_run()?;
                cancel_requested = true;
            }
        }
    }

    let outcome = pump.finish_run().await?;
    println!(
        "Run {:?} at step {} after {:.1} s, last speed {:.2} rpm",
        outcome.status,
        outcome.last_step,
        outcome.elapsed.as_secs_f64(),
        outcome.final_rpm
    );

    if outcome.status != RunStatus::Failed {
        pump.disconnect().await?;
    }

    let issues = logs.at_least(Level::WARN);
    if !issues.is_empty() {
        println!("{} warning(s) during the run:", issues.len());
        for entry in issues {
            println!("  {}", entry.display_line());
        }
    }
    match outcome.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn manual(settings: &Settings, action: ManualAction, rpm: f64) -> Result<()> {
    let mut pump = PumpController::new(settings);
    pump.connect().await.context("connecting to pump")?;
    let result = match action {
        ManualAction::Forward => pump.manual_start(Direction::Forward, rpm).await,
        ManualAction::Backward => pump.manual_start(Direction::Backward, rpm).await,
        ManualAction::Stop => pump.manual_stop().await,
    };
    // keypad mode only after a stop; a started pump stays under remote control
    if matches!(action, ManualAction::Stop) {
        pump.disconnect().await?;
    }
    Ok(result?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(&cli)?;
    let logs = init_tracing(&settings.application);

    match cli.command {
        Command::Plan { ref file, json } => {
            let sequence = load_sequence(file)?;
            let timeline = PumpController::new(&settings).compute_timeline(&sequence);
            if json {
                println!("{}", serde_json::to_string_pretty(&timeline)?);
            } else {
                print_plan(&sequence, &timeline);
            }
        }
        Command::Validate { ref file } => {
            let sequence = load_sequence(file)?;
            let timeline = PumpController::new(&settings).compute_timeline(&sequence);
            if let Some(Truncation::InvalidCycle { step, detail }) = &timeline.truncation {
                bail!("step {}: {}", step, detail);
            }
            println!(
                "{}: {} steps, {:.1} s planned",
                file.display(),
                sequence.len(),
                timeline.total_duration()
            );
        }
        Command::Run {
            ref file,
            yes,
            simulate,
        } => {
            settings.serial.simulate |= simulate;
            run_file(&settings, &logs, file, yes).await?;
        }
        Command::Manual { action, rpm } => {
            manual(&settings, action, rpm).await?;
        }
    }
    Ok(())
}

//! Command-line front end for the capture rig.
//!
//! Subcommands:
//! - `run`: validate a settings file and run every stage
//! - `capture`: take one noise or illuminated burst outside a run
//! - `validate`: report the first invalid setting
//! - `plan`: print stage offsets, waits and the shutter sweep
//! - `pins`: print the GPIO header table
//! - `init-settings`: write a blank settings file
//! - `show-config`: print the effective runtime configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use capture_rig::acquisition::{CancelToken, ProgressFn};
use capture_rig::config::{
    validate, validate_single, CaptureKind, DeviceConfig, ExperimentConfig, ExperimentSettings,
    RigConfig,
};
use capture_rig::experiment::{capture_single, schedule, SequencerOptions, StageSequencer};
use capture_rig::hardware::{self, PIN_TABLE};
use capture_rig::logging;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Stage sequencer for camera exposure sweeps with lamp, LEDs and load cell
#[derive(Parser, Debug)]
#[command(name = "capture-rig")]
#[command(version)]
struct Args {
    /// Runtime configuration file (defaults to ./rig.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate settings and run every stage
    Run {
        /// Settings file (JSON)
        #[arg(short, long)]
        settings: PathBuf,

        /// Root directory for the dataset
        #[arg(short, long)]
        output: PathBuf,

        /// Use simulated devices regardless of the configuration
        #[arg(long)]
        simulate: bool,
    },

    /// Take one noise or illuminated burst with the typed shutter speed
    Capture {
        /// Which burst block of the settings file to use
        #[arg(short, long, value_enum)]
        kind: KindArg,

        /// Settings file (JSON)
        #[arg(short, long)]
        settings: PathBuf,

        /// Directory for the frames
        #[arg(short, long)]
        output: PathBuf,

        /// Use the simulated camera regardless of the configuration
        #[arg(long)]
        simulate: bool,
    },

    /// Check a settings file without touching hardware
    Validate {
        #[arg(short, long)]
        settings: PathBuf,
    },

    /// Print the stage schedule for a settings file
    Plan {
        #[arg(short, long)]
        settings: PathBuf,
    },

    /// Print the GPIO header label table
    Pins,

    /// Write a blank settings file
    InitSettings {
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective runtime configuration as TOML
    ShowConfig,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum KindArg {
    /// Lamp-off frames from the noise block
    Noise,
    /// Frames from the illuminated block
    Illuminated,
}

impl From<KindArg> for CaptureKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Noise => CaptureKind::Noise,
            KindArg::Illuminated => CaptureKind::Illuminated,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut rig = RigConfig::load(args.config.as_deref()).context("loading runtime configuration")?;
    logging::init_from_config(&rig.application)?;

    match args.command {
        Command::Run {
            settings,
            output,
            simulate,
        } => {
            if simulate {
                rig.devices = DeviceConfig::simulated();
            }
            run(&rig, &settings, output).await
        }
        Command::Capture {
            kind,
            settings,
            output,
            simulate,
        } => {
            if simulate {
                rig.devices = DeviceConfig::simulated();
            }
            capture(&rig, kind.into(), &settings, output).await
        }
        Command::Validate { settings } => {
            let loaded = ExperimentSettings::load(&settings)?;
            match validate(&loaded) {
                Ok(config) => {
                    log_warnings(&config);
                    println!("{}: valid", settings.display());
                    Ok(())
                }
                Err(e) => bail!("{}: {}", settings.display(), e),
            }
        }
        Command::Plan { settings } => {
            let config = validate(&ExperimentSettings::load(&settings)?)?;
            log_warnings(&config);
            print_plan(&config);
            Ok(())
        }
        Command::Pins => {
            for (label, line) in PIN_TABLE.iter() {
                println!("{label:<18} line {line}");
            }
            Ok(())
        }
        Command::InitSettings { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            ExperimentSettings::default().save(&path)?;
            println!("Wrote blank settings to {}", path.display());
            Ok(())
        }
        Command::ShowConfig => {
            print!("{}", rig.to_toml()?);
            Ok(())
        }
    }
}

async fn run(rig: &RigConfig, settings: &Path, output: PathBuf) -> Result<()> {
    let loaded = ExperimentSettings::load(settings)?;
    let config = Arc::new(validate(&loaded)?);
    log_warnings(&config);
    let devices = hardware::open_devices(&rig.devices, &config)?;

    let sequencer =
        StageSequencer::new(config, devices, output, SequencerOptions::from_rig(rig));
    cancel_on_interrupt(sequencer.cancel_token());

    let summary = sequencer.run().await?;
    info!(run_id = %summary.run_id, "Dataset written to {}", summary.root.display());
    println!(
        "Completed {} stage(s), {} frame(s) in {}",
        summary.stages_completed,
        summary.frames_captured,
        summary.root.display()
    );
    Ok(())
}

async fn capture(rig: &RigConfig, kind: CaptureKind, settings: &Path, output: PathBuf) -> Result<()> {
    let loaded = ExperimentSettings::load(settings)?;
    let request = validate_single(&loaded, kind)?;
    tokio::fs::create_dir_all(&output)
        .await
        .with_context(|| format!("creating {}", output.display()))?;

    let camera = Arc::new(Mutex::new(hardware::open_camera(&rig.devices)));
    let cancel = CancelToken::new();
    cancel_on_interrupt(cancel.clone());

    let name = kind.name();
    let progress: ProgressFn = Arc::new(move |remaining| {
        println!("{name}: {remaining} image(s) remaining");
    });

    let burst = capture_single(
        &request,
        camera,
        &output,
        rig.camera.resolution(),
        &cancel,
        progress,
    )
    .await?;

    if burst.cancelled {
        println!(
            "Cancelled after {} of {} {name} image(s) in {}",
            burst.captured(),
            burst.requested,
            output.display()
        );
    } else {
        println!(
            "Captured {} {name} image(s) in {}",
            burst.captured(),
            output.display()
        );
    }
    Ok(())
}

fn cancel_on_interrupt(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next boundary");
            cancel.cancel();
        }
    });
}

fn log_warnings(config: &ExperimentConfig) {
    for warning in config.warnings() {
        warn!("{warning}");
    }
}

fn print_plan(config: &ExperimentConfig) {
    let shutters = config.sweep.values();
    println!("Shutter sweep (µs): {shutters:?}");
    println!(
        "Bursts per stage: {} noise, {} LED, {} illuminated",
        shutters.len(),
        if config.led.is_some() { shutters.len() } else { 0 },
        shutters.len()
    );
    for stage in schedule::plan(config) {
        let wait = match stage.wait_after {
            Some(wait) => format!("wait {:.0} s", wait.as_secs_f64()),
            None => "last stage".to_string(),
        };
        println!(
            "Stage {:>3}  t+{:>7} min  dir {:<8} {}",
            stage.index,
            stage.offset_minutes,
            stage.dir_name(),
            wait
        );
    }
}

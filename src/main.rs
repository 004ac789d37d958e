use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use checkflicker::cache::{MemorySlotCache, SlotUploader, WgpuSlotCache};
use checkflicker::config::{ParamMap, StimConfig};
use checkflicker::context::PipelineContext;
use checkflicker::scheduler::DisplayScheduler;

#[derive(Debug, Parser)]
#[command(name = "checkflicker", version = env!("CHECKFLICKER_VERSION"))]
#[command(about = "Pseudorandom checkerboard stimulus pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate a stimulus config and print the derived run parameters.
    Check { config: PathBuf },
    /// Run the pipeline in simulated capture mode for a fixed frame count.
    Run {
        config: PathBuf,
        /// Display refresh ticks to simulate.
        #[arg(long, default_value_t = 300)]
        frames: u64,
        /// Upload into real GPU textures instead of the in-memory backend.
        #[arg(long)]
        gpu: bool,
        /// Override config parameters, control-protocol style
        /// (e.g. --set contrast=0.5 --set rand_gen=binary).
        #[arg(long = "set", value_name = "NAME=VALUE")]
        overrides: Vec<String>,
        /// Write the committed parameter history as JSON.
        #[arg(long)]
        history: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { config } => run_check(&config),
        Commands::Run {
            config,
            frames,
            gpu,
            overrides,
            history,
        } => run_pipeline(&config, frames, gpu, &overrides, history.as_deref()),
    }
}

fn load_config(path: &Path, overrides: &[String]) -> Result<StimConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading {}", path.display()))?;
    let mut config: StimConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed parsing {}", path.display()))?;

    if !overrides.is_empty() {
        let mut params = ParamMap::new();
        for pair in overrides {
            params.set_pair(pair)?;
        }
        config.apply_params(&params)?;
    }
    Ok(config)
}

fn run_check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path, &[])?;
    config.validate()?;

    let (nx, ny) = config.grid();
    println!(
        "OK: {} ({}x{} px, {}x{} stixels, {:?}/{:?})",
        config_path.display(),
        config.display_width,
        config.display_height,
        nx,
        ny,
        config.rand_mode,
        config.sub_frame
    );
    println!(
        "Cache: {} slots, cores: {}, colortable: {} entries",
        config.cache_depth, config.cores, config.color_table_size
    );
    Ok(())
}

fn run_pipeline(
    config_path: &Path,
    frames: u64,
    gpu: bool,
    overrides: &[String],
    history_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path, overrides)?;
    let ctx = PipelineContext::new(config)?;

    if gpu {
        let uploader = pollster::block_on(WgpuSlotCache::new())?;
        drive(DisplayScheduler::new(ctx, uploader, true), frames, history_path)
    } else {
        let uploader = MemorySlotCache::new();
        drive(DisplayScheduler::new(ctx, uploader, true), frames, history_path)
    }
}

fn drive<U: SlotUploader>(
    mut scheduler: DisplayScheduler<U>,
    frames: u64,
    history_path: Option<&Path>,
) -> Result<()> {
    scheduler.initialize()?;

    let mut delivered = 0u64;
    let mut skipped = 0u64;
    for tick in 0..frames {
        let report = scheduler.tick()?;
        delivered += report.delivered as u64;
        if report.skipped {
            skipped += 1;
        }
        if tick % 300 == 299 {
            eprintln!("tick {}/{frames}", tick + 1);
        }
    }

    println!(
        "Displayed {} frames ({} delivered this run, {} skipped ticks, {} producer(s))",
        scheduler.frames_displayed(),
        delivered,
        skipped,
        scheduler.producer_count()
    );
    let stats = scheduler.upload_stats();
    if let (Some(min), Some(max), Some(avg)) = (stats.min, stats.max, stats.average()) {
        println!(
            "Upload timing: min {:?}, max {:?}, avg {:?} over {} uploads",
            min, max, avg, stats.count
        );
    }
    if let Some(avg) = scheduler.local_synthesis_average() {
        println!("Synthesis avg (sync mode): {avg:?}");
    }

    if let Some(path) = history_path {
        let json = scheduler.params().history_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("failed writing {}", path.display()))?;
        println!("Wrote parameter history to {}", path.display());
    }

    scheduler.shutdown();
    Ok(())
}

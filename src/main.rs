use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use episodex::config::ConverterConfig;
use episodex::container::inspect_container;
use episodex::driver::{BatchDriver, BatchReport};

#[derive(Parser)]
#[command(name = "episodex", version, about = "Pack per-timestep pickles into per-episode HDF5 files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert scenes `begin..=end` into episode containers.
    Convert {
        /// First scene ID (inclusive).
        #[arg(long)]
        begin: u32,
        /// Last scene ID (inclusive).
        #[arg(long)]
        end: u32,
        /// JSON configuration file (defaults are used when omitted).
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        input_root: Option<PathBuf>,
        #[arg(long)]
        output_root: Option<PathBuf>,
        /// Episodes converted concurrently.
        #[arg(long)]
        jobs: Option<usize>,
        /// Reject episodes that disagree with the configured task geometry.
        #[arg(long)]
        strict: bool,
        /// Write the per-episode outcome as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        #[arg(long)]
        no_progress: bool,
    },
    /// Print the layout of a written episode container.
    Inspect {
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            begin,
            end,
            config,
            input_root,
            output_root,
            jobs,
            strict,
            report,
            no_progress,
        } => {
            let episode_ids = episode_range(begin, end)?;
            let mut config = match config {
                Some(path) => ConverterConfig::load(&path)?,
                None => ConverterConfig::default(),
            };
            if let Some(input_root) = input_root {
                config.input_root = input_root;
            }
            if let Some(output_root) = output_root {
                config.output_root = output_root;
            }
            if let Some(jobs) = jobs {
                config.jobs = jobs;
            }
            config.strict |= strict;

            let report_path = report;
            let report = BatchDriver::new(config)
                .with_progress(!no_progress)
                .run(episode_ids);
            if let Some(path) = report_path {
                save_report(&report, &path)?;
            }
            Ok(())
        }
        Commands::Inspect { file, json } => {
            let summary = inspect_container(&file)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{}", summary);
            }
            Ok(())
        }
    }
}

fn episode_range(begin: u32, end: u32) -> Result<RangeInclusive<u32>> {
    if begin > end {
        bail!("--begin ({}) must not exceed --end ({})", begin, end);
    }
    Ok(begin..=end)
}

fn save_report(report: &BatchReport, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create report {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, report)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    writer
        .flush()
        .with_context(|| format!("failed to flush report {}", path.display()))?;
    Ok(())
}

mod ingest;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use smolder_report::{ReportOptions, flamegraph_report, table_report};

#[derive(Parser)]
#[command(name = "smolder", version, about = "Continuous-profiling report engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a flamegraph report from a pprof JSON export.
    Flamegraph {
        /// Profile to read.
        input: PathBuf,
        /// Collapse sibling frames that resolve to the same function.
        #[arg(long)]
        aggregate: bool,
        /// Prune subtrees below this fraction of their parent's cumulative
        /// value (0 to 1).
        #[arg(long, value_name = "FRACTION")]
        trim: Option<f64>,
        /// Write the report here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Build a flat table report with caller/callee adjacency.
    Table {
        /// Profile to read.
        input: PathBuf,
        /// Write the report here instead of stdout.
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Flamegraph {
            input,
            aggregate,
            trim,
            output,
        } => {
            if let Some(fraction) = trim
                && !(0.0..=1.0).contains(&fraction)
            {
                bail!("--trim must be a fraction between 0 and 1, got {fraction}");
            }
            let profile = load(&input)?;
            let report = flamegraph_report(
                &profile.samples,
                profile.unit,
                &ReportOptions {
                    aggregate_functions: aggregate,
                    trim_threshold: trim,
                },
            );
            emit(&report, output.as_deref())
        }
        Command::Table { input, output } => {
            let profile = load(&input)?;
            let report = table_report(&profile.samples, profile.unit);
            emit(&report, output.as_deref())
        }
    }
}

fn load(path: &Path) -> Result<ingest::ProfileData> {
    let data =
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ingest::parse(&data).with_context(|| format!("parsing {}", path.display()))
}

fn emit<T: serde::Serialize>(report: &T, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            serde_json::to_writer(std::io::BufWriter::new(file), report)?;
        }
        None => {
            let rendered = serde_json::to_string_pretty(report)?;
            println!("{rendered}");
        }
    }
    Ok(())
}

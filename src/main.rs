use std::{path::PathBuf, process::ExitCode};

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};

use pmc_oa_parquet::{
    config::{default_output_dir, resolve_threads, PipelineConfig},
    logging::{init_logging, parse_log_level},
    memory_usage, pipeline,
    writer::PartCompression,
};

#[derive(Parser)]
#[command(name = "PMC OA Parquet")]
#[command(about = "Extracts article fields from a PubMed Central OA tar archive into Parquet part-files.")]
#[command(version = "1.0.0")]
struct Cli {
    #[arg(long, help = "Manifest of archive members: plain list or PMC CSV file list", required = true)]
    filelist: PathBuf,

    #[arg(long, help = "Path to the .tar.gz archive of JATS XML articles", required = true)]
    tar: PathBuf,

    #[arg(
        long,
        default_value = "-1",
        allow_negative_numbers = true,
        help = "Worker threads (0 or -1 for all cores, -2 for all but one)"
    )]
    n_jobs: i64,

    #[arg(long, default_value = "1", help = "Number of Parquet part-files to split the output into")]
    parquet_chunks: usize,

    #[arg(long, default_value = "logs/pubmed.log", help = "Log file path")]
    log: PathBuf,

    #[arg(long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,

    #[arg(long, help = "Output directory (defaults to <archive dir>/processed.parquet)")]
    output_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = PartCompression::Snappy, help = "Part-file compression codec")]
    compression: PartCompression,

    #[arg(long, help = "Keep the unpacked archive after the run")]
    keep_extracted: bool,

    #[arg(long, help = "Keep manifest rows flagged as retracted")]
    include_retracted: bool,

    #[arg(long, help = "Disable progress bars")]
    no_progress: bool,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let _log_guard = init_logging(&cli.log, parse_log_level(&cli.log_level))?;

    info!("Starting PMC OA Parquet v1.0.0");
    memory_usage::log_memory_usage("initial");

    let cores = num_cpus::get();
    let threads = resolve_threads(cli.n_jobs, cores);
    info!("Using {} threads ({} CPU cores detected, n_jobs={}).", threads, cores, cli.n_jobs);

    let config = PipelineConfig {
        threads,
        chunks: cli.parquet_chunks,
        output_dir: cli
            .output_dir
            .clone()
            .unwrap_or_else(|| default_output_dir(&cli.tar)),
        compression: cli.compression,
        keep_extracted: cli.keep_extracted,
        include_retracted: cli.include_retracted,
        show_progress: !cli.no_progress,
        ..PipelineConfig::new(&cli.filelist, &cli.tar)
    };

    let result = pipeline::run(&config);
    match &result {
        Ok(summary) if summary.succeeded() => {
            info!("Output written to {}", config.output_dir.display())
        }
        Ok(summary) => warn!(
            "{} of {} chunks failed to write; see the log for details.",
            summary.failed_chunks.len(),
            summary.chunks
        ),
        Err(e) => error!("Run aborted: {}", e),
    }
    Ok(ExitCode::from(pipeline::exit_status(&result)))
}

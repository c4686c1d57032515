use std::path::{Path, PathBuf};

use crate::writer::PartCompression;

pub const OUTPUT_DIR_NAME: &str = "processed.parquet";

/// Everything a run needs, resolved up front from the command line.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub filelist: PathBuf,
    pub tar: PathBuf,
    pub threads: usize,
    pub chunks: usize,
    pub output_dir: PathBuf,
    pub compression: PartCompression,
    pub keep_extracted: bool,
    pub include_retracted: bool,
    pub show_progress: bool,
}

impl PipelineConfig {
    /// Defaults matching the command line: all cores, one chunk, output
    /// next to the archive.
    pub fn new(filelist: &Path, tar: &Path) -> Self {
        Self {
            filelist: filelist.to_path_buf(),
            tar: tar.to_path_buf(),
            threads: resolve_threads(-1, num_cpus::get()),
            chunks: 1,
            output_dir: default_output_dir(tar),
            compression: PartCompression::default(),
            keep_extracted: false,
            include_retracted: false,
            show_progress: true,
        }
    }
}

/// `<archive dir>/processed.parquet`
pub fn default_output_dir(tar: &Path) -> PathBuf {
    tar.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(OUTPUT_DIR_NAME)
}

/// Worker count for `--n_jobs`. Zero means every core; negative values count
/// back from the core count, so `-1` is every core and `-2` all but one.
pub fn resolve_threads(n_jobs: i64, cores: usize) -> usize {
    let cores = cores.max(1) as i64;
    let threads = match n_jobs {
        0 => cores,
        n if n < 0 => cores + 1 + n,
        n => n,
    };
    threads.max(1) as usize
}

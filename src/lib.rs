//! Converts a PubMed Central open-access tar archive of JATS XML articles
//! into chunked Parquet part-files with one row per manifest entry.

pub mod archive;
pub mod batch;
pub mod config;
pub mod error;
pub mod extractor;
pub mod jats;
pub mod logging;
pub mod manifest;
pub mod memory_usage;
pub mod pipeline;
pub mod record;
pub mod writer;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{run, RunSummary};
pub use record::DocumentRecord;

//! Error types for each stage of the conversion.
//!
//! Only [`ManifestError`], [`ArchiveError`] and [`PipelineError`] ever abort a
//! run. Member and extraction errors are folded into invalid records, and
//! [`WriteError`] is confined to the chunk it happened in.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse CSV manifest {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("CSV manifest {0} has no 'Article File' column")]
    MissingColumn(PathBuf),

    #[error("manifest {0} contains no entries")]
    Empty(PathBuf),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to open archive {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to stage archive into {path}: {source}")]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to index staged archive directory: {0}")]
    Index(String),

    #[error("archive {0} contains no readable members")]
    NoMembers(PathBuf),
}

/// Failure to fetch one member's bytes.
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("member not found in archive")]
    NotFound,

    #[error("member path matches {0} archive entries")]
    Ambiguous(usize),

    #[error("member path escapes the archive root")]
    UnsafePath,

    #[error("failed to read member: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of the field-extraction capability on one document.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("malformed XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("document is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("root element is <{0}>, expected <article>")]
    NotAnArticle(String),

    #[error("document has no root element")]
    EmptyDocument,
}

/// Why one document produced an invalid record.
#[derive(Debug, Error)]
pub enum DocumentFailure {
    #[error("could not read member: {0}")]
    Retrieval(#[from] MemberError),

    #[error("could not extract fields: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("document has no {0}")]
    MissingField(&'static str),

    #[error("cited PMID {0:?} is not a number")]
    InvalidCitation(String),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to create part-file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open part-file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build record batch: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("parquet error on {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("unexpected column layout in {path}: {detail}")]
    Schema { path: PathBuf, detail: String },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
